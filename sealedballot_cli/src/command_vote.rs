use crate::{fail, print_json, Config};
use sealedballot::ElGamalPublicKey;

pub fn command_encrypt(matches: &clap::ArgMatches, config: &Config) {
    let public_key = matches.value_of("PUBLIC-KEY").unwrap_or_default();
    let public_key =
        ElGamalPublicKey::from_hex(public_key).unwrap_or_else(|e| fail("encrypt", e));

    let candidate = matches.value_of("CANDIDATE-ID").unwrap_or_default();
    let candidate: i64 = candidate
        .parse()
        .unwrap_or_else(|_| fail("encrypt", format!("invalid candidate id {:?}", candidate)));

    let cipher = config.cipher().unwrap_or_else(|e| fail("encrypt", e));
    let ciphertext = cipher
        .encrypt(candidate, &public_key, None)
        .unwrap_or_else(|e| fail("encrypt", e));

    print_json("encrypt", &ciphertext);
}

// Secrets are taken verbatim, never shell-expanded
fn private_key_arg<'a>(matches: &'a clap::ArgMatches) -> &'a str {
    matches.value_of("PRIVATE-KEY").unwrap_or_default()
}

pub fn command_decrypt(matches: &clap::ArgMatches, config: &Config) {
    let private_key = private_key_arg(matches);
    let c1 = matches.value_of("C1").unwrap_or_default();
    let c2 = matches.value_of("C2").unwrap_or_default();

    let cipher = config.cipher().unwrap_or_else(|e| fail("decrypt", e));
    let candidate = cipher
        .decrypt_hex(c1, c2, private_key)
        .unwrap_or_else(|e| fail("decrypt", e));

    println!("{}", candidate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{App, Arg};

    #[test]
    fn private_key_is_not_expanded() {
        std::env::set_var("SEALEDBALLOT_TEST_KEY", "expanded");
        let app = App::new("decrypt").arg(Arg::with_name("PRIVATE-KEY").index(1));
        for raw in ["$SEALEDBALLOT_TEST_KEY", "~/key", "ab${SEALEDBALLOT_TEST_KEY}"] {
            let matches = app.clone().get_matches_from(vec!["decrypt", raw]);
            assert_eq!(private_key_arg(&matches), raw);
        }
    }
}
