use clap::{App, AppSettings, Arg, SubCommand};
use tracing_subscriber::EnvFilter;

mod command_identity;
mod command_keygen;
mod command_keys;
mod command_organizers;
mod command_selftest;
mod command_tally;
mod command_verify;
mod command_vote;
mod config;
mod rest;

pub use command_identity::*;
pub use command_keygen::*;
pub use command_keys::*;
pub use command_organizers::*;
pub use command_selftest::*;
pub use command_tally::*;
pub use command_verify::*;
pub use command_vote::*;
pub use config::Config;

fn main() {
    let election_id = || {
        Arg::with_name("ELECTION-ID")
            .required(true)
            .help("Numeric election id")
    };
    let caller = |index: u64| {
        Arg::with_name("CALLER")
            .index(index)
            .required(true)
            .help("Address of the organizer making the request")
    };

    let permission_flag = |name: &'static str| {
        Arg::with_name(name)
            .long(name)
            .takes_value(true)
            .possible_values(&["true", "false"])
    };

    let matches = App::new("SealedBallot CLI")
        .version("0.1")
        .about("Private voting cryptography and organizer key custody")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(SubCommand::with_name("keygen").about("Generate an election key pair"))
        .subcommand(
            SubCommand::with_name("encrypt")
                .about("Encrypt a vote for a candidate")
                .arg(Arg::with_name("PUBLIC-KEY").index(1).required(true))
                .arg(
                    Arg::with_name("CANDIDATE-ID")
                        .index(2)
                        .required(true)
                        .allow_hyphen_values(true)
                        .help("Candidate id, -1 for a blank vote"),
                ),
        )
        .subcommand(
            SubCommand::with_name("decrypt")
                .about("Decrypt a single vote")
                .arg(Arg::with_name("PRIVATE-KEY").index(1).required(true))
                .arg(Arg::with_name("C1").index(2).required(true))
                .arg(Arg::with_name("C2").index(3).required(true)),
        )
        .subcommand(
            SubCommand::with_name("setup")
                .about("Generate and store the key pair for an election")
                .arg(election_id().index(1))
                .arg(caller(2)),
        )
        .subcommand(
            SubCommand::with_name("tally")
                .about("Decrypt and count a file of encrypted votes")
                .arg(election_id().index(1))
                .arg(caller(2))
                .arg(
                    Arg::with_name("VOTES")
                        .index(3)
                        .required(true)
                        .help("JSON array of {c1, c2} ciphertexts"),
                )
                .arg(
                    Arg::with_name("public-key")
                        .long("public-key")
                        .takes_value(true)
                        .help("Refuse to tally unless the stored key matches this public key"),
                ),
        )
        .subcommand(
            SubCommand::with_name("organizers")
                .about("Manage election organizers")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("init")
                        .about("Register the primary organizer of an election")
                        .arg(election_id().index(1))
                        .arg(Arg::with_name("PRIMARY").index(2).required(true)),
                )
                .subcommand(
                    SubCommand::with_name("add")
                        .about("Add a co-organizer")
                        .arg(election_id().index(1))
                        .arg(Arg::with_name("ADDRESS").index(2).required(true))
                        .arg(caller(3))
                        .arg(Arg::with_name("no-setup").long("no-setup"))
                        .arg(Arg::with_name("no-decrypt").long("no-decrypt"))
                        .arg(Arg::with_name("admin").long("admin")),
                )
                .subcommand(
                    SubCommand::with_name("remove")
                        .about("Remove a co-organizer")
                        .arg(election_id().index(1))
                        .arg(Arg::with_name("ADDRESS").index(2).required(true))
                        .arg(caller(3)),
                )
                .subcommand(
                    SubCommand::with_name("update")
                        .about("Change the permissions of a co-organizer")
                        .arg(election_id().index(1))
                        .arg(Arg::with_name("ADDRESS").index(2).required(true))
                        .arg(caller(3))
                        .arg(permission_flag("setup"))
                        .arg(permission_flag("decrypt"))
                        .arg(permission_flag("admin")),
                )
                .subcommand(
                    SubCommand::with_name("show")
                        .about("Show the organizers of an election")
                        .arg(election_id().index(1)),
                ),
        )
        .subcommand(
            SubCommand::with_name("keys")
                .about("Inspect stored election keys")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("list").about("List elections with keys"))
                .subcommand(
                    SubCommand::with_name("has")
                        .about("Check whether an election key is stored")
                        .arg(election_id().index(1)),
                )
                .subcommand(
                    SubCommand::with_name("delete")
                        .about("Delete an election key")
                        .arg(election_id().index(1)),
                ),
        )
        .subcommand(
            SubCommand::with_name("identity")
                .about("Generate a voter identity and its nullifier for an election")
                .arg(election_id().index(1))
                .arg(
                    Arg::with_name("seed")
                        .long("seed")
                        .takes_value(true)
                        .help("Derive the identity deterministically from a seed"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Verify a Groth16 proof against the configured verification keys")
                .arg(
                    Arg::with_name("CIRCUIT")
                        .index(1)
                        .required(true)
                        .possible_values(&["vote", "eligibility"]),
                )
                .arg(Arg::with_name("PROOF").index(2).required(true))
                .arg(Arg::with_name("SIGNALS").index(3).required(true)),
        )
        .subcommand(SubCommand::with_name("selftest").about("Run cryptographic self tests"))
        .get_matches();

    let level = match matches.occurrences_of("v") {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = Config::from_env().unwrap_or_else(|e| fail("config", e));

    // Subcommands
    match matches.subcommand() {
        ("keygen", Some(matches)) => command_keygen(matches),
        ("encrypt", Some(matches)) => command_encrypt(matches, &config),
        ("decrypt", Some(matches)) => command_decrypt(matches, &config),
        ("setup", Some(matches)) => command_setup(matches, &config),
        ("tally", Some(matches)) => command_tally(matches, &config),
        ("organizers", Some(matches)) => command_organizers(matches, &config),
        ("keys", Some(matches)) => command_keys(matches, &config),
        ("identity", Some(matches)) => command_identity(matches),
        ("verify", Some(matches)) => command_verify(matches, &config),
        ("selftest", Some(matches)) => command_selftest(matches, &config),
        _ => unreachable!(),
    }
}

/// Print `sealedballot <command>: <error>` and exit
pub fn fail(command: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("sealedballot {}: {}", command, error);
    std::process::exit(1);
}

/// Shell-expand a path or value given on the command line
pub fn expand(input: &str) -> String {
    shellexpand::full(input)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| input.to_string())
}

/// Parse a required numeric election id argument
pub fn election_id_arg(command: &str, matches: &clap::ArgMatches) -> sealedballot::ElectionId {
    let value = matches.value_of("ELECTION-ID").unwrap_or_default();
    value
        .parse()
        .unwrap_or_else(|_| fail(command, format!("invalid election id {:?}", value)))
}

/// Print a value as pretty JSON
pub fn print_json<T: serde::Serialize>(command: &str, value: &T) {
    let json = serde_json::to_string_pretty(value).unwrap_or_else(|e| fail(command, e));
    println!("{}", json);
}
