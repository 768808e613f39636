#[macro_use]
extern crate serde;

mod blind;
mod custodian;
mod election_keys;
mod elgamal;
mod error;
mod membership;
mod nullifier;
mod organizers;
mod serde_hex;
mod store;
mod util;
mod zkp;

pub use blind::*;
pub use custodian::*;
pub use election_keys::*;
pub use elgamal::*;
pub use error::*;
pub use membership::*;
pub use nullifier::*;
pub use organizers::*;
pub use serde_hex::*;
pub use store::*;
pub use util::*;
pub use zkp::*;

pub(crate) use serde_hex::decode_fixed;
pub(crate) use util::preview;
