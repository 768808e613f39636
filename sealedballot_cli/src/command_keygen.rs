pub fn command_keygen(_matches: &clap::ArgMatches) {
    let keys = sealedballot::generate_keys();

    println!("private-key: {}", keys.private_key.to_hex());
    println!("public-key: {}", keys.public_key.to_hex());
}
