//! Command implementations for the CLI.

mod config;
mod history;
mod latest;
mod replay;
mod sleep;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use vitalband_core::SessionConfig;
use vitalband_store::{SqliteSampleStore, Store};

use crate::format::FormatOptions;

pub use config::cmd_config;
pub use history::{HistoryArgs, cmd_history};
pub use latest::cmd_latest;
pub use replay::cmd_replay;
pub use sleep::cmd_sleep;

/// Settings every command shares.
pub struct Context {
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub config: SessionConfig,
    pub opts: FormatOptions,
}

impl Context {
    pub fn open_store(&self) -> Result<Store> {
        Store::open(&self.db_path)
            .with_context(|| format!("Failed to open database {}", self.db_path.display()))
    }

    pub fn open_reactive_store(&self) -> Result<SqliteSampleStore> {
        self.open_store().map(SqliteSampleStore::new)
    }
}
