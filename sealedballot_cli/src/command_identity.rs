use crate::election_id_arg;
use sealedballot::VoterIdentity;

pub fn command_identity(matches: &clap::ArgMatches) {
    let election_id = election_id_arg("identity", matches);

    let identity = match matches.value_of("seed") {
        Some(seed) => VoterIdentity::from_seed(seed.as_bytes()),
        None => VoterIdentity::generate(),
    };

    // The secrets are only ever shown to the voter who generated them
    println!(
        "nullifier-secret: {}",
        hex::encode(identity.nullifier_secret().expose())
    );
    println!("trapdoor: {}", hex::encode(identity.trapdoor().expose()));
    println!("commitment: {}", identity.commitment());
    println!("nullifier: {}", identity.nullifier(election_id));
}
