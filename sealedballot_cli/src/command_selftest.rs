use crate::{fail, Config};

pub fn command_selftest(_matches: &clap::ArgMatches, config: &Config) {
    let cipher = config.cipher().unwrap_or_else(|e| fail("selftest", e));
    cipher.self_test().unwrap_or_else(|e| fail("selftest", e));
    println!("vote cipher: ok");

    let custodian = config.custodian().unwrap_or_else(|e| fail("selftest", e));
    custodian
        .self_test()
        .unwrap_or_else(|e| fail("selftest", e));
    println!("key custodian: ok");
}
