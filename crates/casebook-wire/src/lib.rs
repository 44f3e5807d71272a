#![doc = include_str!("../README.md")]

mod common;
pub use common::*;

pub mod client;
pub mod server;
pub mod tls;

// Public re-export so downstream crates can access `casebook` via
// `casebook_wire::casebook`
pub use casebook;
