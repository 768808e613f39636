use crate::{election_id_arg, fail, print_json, Config};
use sealedballot::PermissionUpdate;

pub fn command_organizers(matches: &clap::ArgMatches, config: &Config) {
    let registry = config.registry().unwrap_or_else(|e| fail("organizers", e));

    match matches.subcommand() {
        ("init", Some(matches)) => {
            let election_id = election_id_arg("organizers init", matches);
            let primary = matches.value_of("PRIMARY").unwrap_or_default();
            let record = registry
                .initialize(election_id, primary)
                .unwrap_or_else(|e| fail("organizers init", e));
            print_json("organizers init", &record);
        }
        ("add", Some(matches)) => {
            let election_id = election_id_arg("organizers add", matches);
            let address = matches.value_of("ADDRESS").unwrap_or_default();
            let caller = matches.value_of("CALLER").unwrap_or_default();

            let permissions = PermissionUpdate {
                can_setup_encryption: Some(!matches.is_present("no-setup")),
                can_decrypt_votes: Some(!matches.is_present("no-decrypt")),
                can_add_co_organizers: Some(matches.is_present("admin")),
            };
            let co_organizer = registry
                .add_co_organizer(election_id, address, caller, permissions)
                .unwrap_or_else(|e| fail("organizers add", e));
            print_json("organizers add", &co_organizer);
        }
        ("remove", Some(matches)) => {
            let election_id = election_id_arg("organizers remove", matches);
            let address = matches.value_of("ADDRESS").unwrap_or_default();
            let caller = matches.value_of("CALLER").unwrap_or_default();
            registry
                .remove_co_organizer(election_id, address, caller)
                .unwrap_or_else(|e| fail("organizers remove", e));
        }
        ("update", Some(matches)) => {
            let election_id = election_id_arg("organizers update", matches);
            let address = matches.value_of("ADDRESS").unwrap_or_default();
            let caller = matches.value_of("CALLER").unwrap_or_default();

            // possible_values limits these to "true" or "false"
            let flag = |name: &str| matches.value_of(name).map(|v| v == "true");
            let update = PermissionUpdate {
                can_setup_encryption: flag("setup"),
                can_decrypt_votes: flag("decrypt"),
                can_add_co_organizers: flag("admin"),
            };
            let permissions = registry
                .update_permissions(election_id, address, update, caller)
                .unwrap_or_else(|e| fail("organizers update", e));
            print_json("organizers update", &permissions);
        }
        ("show", Some(matches)) => {
            let election_id = election_id_arg("organizers show", matches);
            match registry.get_election_organizers(election_id) {
                Some(record) => print_json("organizers show", &record),
                None => fail(
                    "organizers show",
                    format!("election {} has no organizers", election_id),
                ),
            }
        }
        _ => unreachable!(),
    }
}
