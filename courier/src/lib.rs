//! courier: asynchronous notification delivery over pluggable channels,
//! backed by a durable SQLite queue.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;
pub mod utils;

pub use error::{DeliveryError, Error, Result};
