#![doc = include_str!("../README.md")]

mod database;
mod error;
mod expiry;
mod id_pool;
mod ledger;
mod reduction;
mod source;
mod time;
mod tracking;

pub use crate::database::*;
pub use crate::error::*;
pub use crate::expiry::*;
pub use crate::id_pool::*;
pub use crate::ledger::*;
pub use crate::reduction::*;
pub use crate::source::*;
pub use crate::time::*;
pub use crate::tracking::*;
