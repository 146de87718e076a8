//! Tally — command-line front end.
//!
//! [`Command::parse`] turns arguments into a [`Command`];
//! [`Command::execute`] runs it against an [`EventStore`] and returns the
//! JSON document the binary prints.
//!
//! [`EventStore`]: tally_core::store::EventStore

pub mod commands;
pub mod error;

pub use commands::{Command, USAGE};
pub use error::CliError;
