use crate::{election_id_arg, fail, print_json, Config};
use sealedballot::{ElGamalCiphertext, ElGamalPublicKey};

pub fn command_setup(matches: &clap::ArgMatches, config: &Config) {
    let election_id = election_id_arg("setup", matches);
    let caller = matches.value_of("CALLER").unwrap_or_default();

    let keys = config.election_keys().unwrap_or_else(|e| fail("setup", e));
    let setup = keys
        .setup_encryption(election_id, caller)
        .unwrap_or_else(|e| fail("setup", e));

    if setup.remote_backup_id.is_none() {
        eprintln!("sealedballot setup: warning: key has no remote backup");
    }
    print_json("setup", &setup);
}

pub fn command_tally(matches: &clap::ArgMatches, config: &Config) {
    let election_id = election_id_arg("tally", matches);
    let caller = matches.value_of("CALLER").unwrap_or_default();
    let filename = crate::expand(matches.value_of("VOTES").unwrap_or_default());

    let file_bytes = match std::fs::read(&filename) {
        Ok(bytes) => bytes,
        Err(e) => fail("tally", format!("unable to read {}: {}", &filename, e)),
    };
    let votes: Vec<ElGamalCiphertext> = serde_json::from_slice(&file_bytes)
        .unwrap_or_else(|e| fail("tally", format!("error deserializing votes: {}", e)));

    let public_key = matches.value_of("public-key").map(|pk| {
        ElGamalPublicKey::from_hex(pk).unwrap_or_else(|e| fail("tally", e))
    });

    let keys = config.election_keys().unwrap_or_else(|e| fail("tally", e));
    let tally = keys
        .decrypt_tally(election_id, caller, &votes, public_key.as_ref())
        .unwrap_or_else(|e| fail("tally", e));

    if !tally.is_complete() {
        eprintln!(
            "sealedballot tally: {} of {} votes failed to decrypt",
            tally.failure_count,
            votes.len()
        );
    }
    print_json("tally", &tally);
}
