//! Database models.
//!
//! Plain row structs mapped with `sqlx::FromRow`, plus the string-backed
//! enums used for their state columns.

mod channel;
mod history;
mod queue;
mod recipient;
mod settings;

pub use channel::{ChannelStateDbModel, ChannelStatus};
pub use history::{HistoryMetadata, HistoryRecordDbModel, HistoryStatus};
pub use queue::{QueueEntryDbModel, QueueState};
pub use recipient::{UserChannelPreferenceDbModel, UserDbModel};
pub use settings::SettingDbModel;
