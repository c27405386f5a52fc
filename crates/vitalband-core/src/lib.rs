//! Session core for BLE fitness bands.
//!
//! This crate owns everything between the radio and the store: the link's
//! lifecycle, the paced command protocol the band expects, and the
//! conversion of the band's loosely shaped payloads into typed samples.
//!
//! # Features
//!
//! - **Link state machine**: connect, settle, discover, enable notifications,
//!   with an optimistic fallback when the band never acknowledges
//! - **Command choreography**: bring-up and history sync with mandatory pacing
//! - **Frame decoding**: structured records, JSON text and `key=value` blobs
//! - **Normalization**: field-name synonyms, a timestamp fallback chain and
//!   per-record validation
//! - **Multiplexing**: one lane per message type, debounced live telemetry
//! - **Reconciliation**: one current-value feed per metric from live and stored data
//! - **Sleep summaries**: stage breakdown, efficiency, score
//!
//! # Collaborators
//!
//! | Trait | Provided here |
//! |-------|---------------|
//! | [`Transport`] | [`ble::BleTransport`], [`mock::MockTransport`] |
//! | [`CommandCodec`] | [`mock::MockCodec`] (the vendor codec lives outside this crate) |
//! | [`SampleStore`] | [`mock::MemoryStore`]; SQLite in `vitalband-store` |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use vitalband_core::mock::{MemoryStore, MockCodec};
//! use vitalband_core::{BleOptions, BleTransport, Session, SessionConfig};
//! use vitalband_types::Metric;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let codec = Arc::new(MockCodec::new());
//!     let transport = BleTransport::new(codec.clone(), BleOptions::default()).await?;
//!     let session = Session::new(
//!         Arc::new(transport),
//!         codec,
//!         Arc::new(MemoryStore::new()),
//!         SessionConfig::load_default()?,
//!     )?;
//!
//!     let mut bands = session.scan().await?;
//!     if let Some(band) = bands.next().await {
//!         session.connect(&band).await?;
//!         let mut heart_rate = session.latest(Metric::HeartRate);
//!         while let Some(sample) = heart_rate.next().await {
//!             println!("{sample}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod choreography;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod link;
pub mod mock;
pub mod multiplexer;
pub mod normalizer;
pub mod reconcile;
pub mod retry;
pub mod session;
pub mod sleep;
pub mod timestamp;
pub mod traits;
pub mod value;

pub use vitalband_types::uuids;

pub use ble::{BleOptions, BleTransport};
pub use choreography::{Choreographer, CommandSink, PacedSink, RunReport, Step};
pub use commands::{
    Command, CommandBuilder, CommandCodec, CursorMode, HistoryCategory, HistoryCursor,
    PersonalInfo, Sex,
};
pub use config::{
    ChoreographyConfig, ConfigError, IngestConfig, LinkConfig, SessionConfig, ValidationError,
    default_config_path,
};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SessionEvent};
pub use frame::{DecodeStrategy, FramePayload, MessageType, RawFrame, decode_payload};
pub use link::{Link, ResolvedCharacteristics};
pub use multiplexer::Multiplexer;
pub use normalizer::{Batch, LiveSnapshot, Normalizer, Rejection};
pub use reconcile::{LiveFeeds, MergePolicy, current_value};
pub use retry::{RetryConfig, with_retry};
pub use session::Session;
pub use timestamp::{ParsedTimestamp, TimestampFormat, TimestampParser};
pub use traits::{
    CharacteristicInfo, DeviceHandle, Enablement, Feed, LinkEvent, SampleStore, ServiceInfo,
    ServiceLayout, Transport, revision_feed,
};
pub use value::{DecodedValue, Record};
