use crate::{election_id_arg, fail, Config};

pub fn command_keys(matches: &clap::ArgMatches, config: &Config) {
    let custodian = config.custodian().unwrap_or_else(|e| fail("keys", e));

    match matches.subcommand() {
        ("list", Some(_)) => {
            let elections = custodian
                .list_elections_with_keys()
                .unwrap_or_else(|e| fail("keys list", e));
            for election_id in elections {
                println!("{}", election_id);
            }
        }
        ("has", Some(matches)) => {
            let election_id = election_id_arg("keys has", matches);
            let present = custodian
                .has_private_key(election_id)
                .unwrap_or_else(|e| fail("keys has", e));
            println!("{}", present);
            if !present {
                std::process::exit(1);
            }
        }
        ("delete", Some(matches)) => {
            let election_id = election_id_arg("keys delete", matches);
            custodian
                .delete_private_key(election_id)
                .unwrap_or_else(|e| fail("keys delete", e));
        }
        _ => unreachable!(),
    }
}
