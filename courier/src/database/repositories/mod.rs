//! Repository layer for database access.
//!
//! Each repository is a trait plus an SQLx implementation so the pipeline
//! services can be exercised against any store that honors the same
//! conditional-update contracts.

pub mod channel;
pub mod history;
pub mod queue;
pub mod recipient;
pub mod settings;

pub use channel::*;
pub use history::*;
pub use queue::*;
pub use recipient::*;
pub use settings::*;
