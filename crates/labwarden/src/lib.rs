//! Lab lifecycle monitoring for VIRL / CML servers.
//!
//! Every cycle, each configured server is asked for its diagnostics. Labs
//! that have been running longer than the alert threshold are tracked, their
//! owners are sent one digest per server, and labs left unextended past the
//! dead threshold are stopped, wiped and deleted.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use labwarden::{CycleRunner, FileRecordStore, VirlClient};
//!
//! let store = Arc::new(FileRecordStore::open("records.json").await?);
//! let runner = CycleRunner::new(platforms, messenger, store, settings.engine);
//! runner.run_forever(settings.cycle_interval).await;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod cycle;
pub mod digest;
pub mod engine;
pub mod error;
pub mod platform;
pub mod snapshot;
pub mod store;

pub use config::{EngineOptions, ServiceArgs, Settings, TerminationPolicy, Thresholds};
pub use cycle::{CycleReport, CycleRunner, ServerOutcome, ServerReport};
pub use engine::{Notice, NoticeKind, ReconcileReport, Reconciler};
pub use error::{ConfigError, CycleError, ParseError, Stage, StoreError};
pub use platform::{LabPlatform, PlatformError, Session, VirlClient};
pub use snapshot::{LabSnapshot, ServerSnapshot};
pub use store::{FileRecordStore, LabRecord, RecordKey, RecordStore};
