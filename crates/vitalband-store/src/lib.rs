//! Local persistence for band samples.
//!
//! SQLite storage with one table per metric, keyed by sample timestamp.
//! Writes with an existing timestamp replace the stored sample, so replaying
//! the same history twice leaves one copy.
//!
//! - [`Store`]: synchronous access with fluent [`SampleQuery`] filters
//! - [`SqliteSampleStore`]: the reactive [`vitalband_core::SampleStore`]
//!   the session writes into
//!
//! # Example
//!
//! ```no_run
//! use vitalband_store::{SampleQuery, Store};
//! use vitalband_types::Metric;
//!
//! let store = Store::open_default()?;
//! let night = store.query(&SampleQuery::new(Metric::Sleep).day("2024.03.01").oldest_first())?;
//! println!("{} stages", night.len());
//! # Ok::<(), vitalband_store::Error>(())
//! ```

mod error;
mod queries;
mod reactive;
mod schema;
mod store;

pub use error::{Error, Result};
pub use queries::SampleQuery;
pub use reactive::SqliteSampleStore;
pub use schema::SCHEMA_VERSION;
pub use store::{DEFAULT_RECENT_LIMIT, Store};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/vitalband/samples.db`
/// - macOS: `~/Library/Application Support/vitalband/samples.db`
/// - Windows: `C:\Users\<user>\AppData\Local\vitalband\samples.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("vitalband")
        .join("samples.db")
}
