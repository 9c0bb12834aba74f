//! Settings key-value model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A single persisted setting.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettingDbModel {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}
