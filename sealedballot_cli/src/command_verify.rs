use crate::{fail, Config};
use sealedballot::SnarkjsProof;
use serde::de::DeserializeOwned;

fn read_json_arg<T: DeserializeOwned>(matches: &clap::ArgMatches, name: &str) -> T {
    let filename = crate::expand(matches.value_of(name).unwrap_or_default());
    let file_bytes = match std::fs::read(&filename) {
        Ok(bytes) => bytes,
        Err(e) => fail("verify", format!("unable to read {}: {}", &filename, e)),
    };
    serde_json::from_slice(&file_bytes)
        .unwrap_or_else(|e| fail("verify", format!("unable to parse {}: {}", &filename, e)))
}

pub fn command_verify(matches: &clap::ArgMatches, config: &Config) {
    let proof: SnarkjsProof = read_json_arg(matches, "PROOF");
    let signals: Vec<String> = read_json_arg(matches, "SIGNALS");

    let verifier = config.verifier().unwrap_or_else(|e| fail("verify", e));
    let valid = match matches.value_of("CIRCUIT") {
        Some("vote") => verifier.verify_vote_proof(&proof, &signals),
        _ => verifier.verify_eligibility_proof(&proof, &signals),
    }
    .unwrap_or_else(|e| fail("verify", e));

    println!("{}", valid);
    if !valid {
        std::process::exit(1);
    }
}
