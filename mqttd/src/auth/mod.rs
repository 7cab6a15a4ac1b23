//! Credential and topic permission ledger.
//!
//! [`Ledger`] answers two questions for the broker: may this connection be
//! admitted, and may this user publish or subscribe to this topic. It is
//! built once at startup and never mutated while installed.

mod file;
mod ledger;

pub use file::{load, parse, render, write_sample};
pub use ledger::{Access, AclRule, AuthRule, Ledger, Operation, User};
