//! Process configuration read from the environment.
//!
//! Pipeline knobs (retries, workers, retention) live in the settings table
//! and are loaded by [`crate::notification::PolicyStore`]; only what is
//! needed before the database is open comes from here.

use std::time::Duration;

/// Default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:courier.db?mode=rwc";

/// Default log directory.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Default delay between queue ticks.
pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// Process-level configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    /// Delay between `process_queue` ticks.
    pub tick: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            tick: DEFAULT_TICK,
        }
    }
}

impl AppConfig {
    /// Load config from environment variables (and `.env` if present),
    /// falling back to defaults.
    ///
    /// Supported env vars:
    /// - `DATABASE_URL`
    /// - `COURIER_LOG_DIR`
    /// - `COURIER_TICK_SECS` (whole seconds, at least 1)
    pub fn from_env_or_default() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL")
            && !url.trim().is_empty()
        {
            config.database_url = url.trim().to_string();
        }

        if let Some(dir) = lookup("COURIER_LOG_DIR")
            && !dir.trim().is_empty()
        {
            config.log_dir = dir.trim().to_string();
        }

        if let Some(secs) = lookup("COURIER_TICK_SECS")
            && let Ok(parsed) = secs.trim().parse::<u64>()
            && parsed > 0
        {
            config.tick = Duration::from_secs(parsed);
        }

        config
    }
}
