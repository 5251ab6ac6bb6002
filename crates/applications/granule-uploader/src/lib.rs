//! # L2P Granule Uploader
//!
//! Moves processed L2P granules from the shared filesystem to S3, announces
//! them to Cumulus with CNM messages, and returns the IDL licenses the
//! processing batch checked out.
//!
//! ## Architecture
//!
//! ```text
//! input JSON ──► GranuleLocator ──► UploadPipeline ──► S3
//!                     │                  │
//!                     │                  └──► CNM ──► SNS (provider topic)
//!                     │
//!                     └── missing checksums ──┐
//!                                             ├──► FailureReporter ──► SNS (alert topic)
//!              upload / publish failures ─────┘
//!
//! last job of batch ──► LicenseReturn ──► DistributedLock ──► SSM
//! ```
//!
//! Every remote dependency sits behind a trait ([`ParameterStore`],
//! [`ObjectStore`], [`MessageBus`]) with an AWS implementation and an
//! in-memory one for tests.
//!
//! ## License pool safety
//!
//! Concurrent batch jobs share the license pools. Updates happen under the
//! retrieval hold flag, and each counter write is conditional on the version
//! read inside the lock. SSM cannot compare-and-swap, so a concurrent write is
//! only detected after ours has landed on top of it. The lock resolves who
//! owns a raced flag. A raced floating-pool write is re-applied once over the
//! value it replaced and logged at error level. Overlapping writers can still
//! lose an update, so the pools are only as safe as the hold flag. See
//! [`lock`] and [`license`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod cnm;
pub mod config;
pub mod error;
pub mod license;
pub mod locator;
pub mod lock;
pub mod naming;
pub mod object_store;
pub mod report;
pub mod runner;
pub mod store;
pub mod upload;

// Error handling
pub use error::{Result, UploaderError};

// Remote stores
pub use bus::{MemoryMessageBus, MessageBus, SnsMessageBus};
pub use object_store::{
    Destination, Encryption, KeyLayout, MemoryObjectStore, ObjectStore, S3ObjectStore,
};
pub use store::{
    MemoryParameterStore, Parameter, ParameterStore, SsmParameterStore, WriteOutcome,
    WritePrecondition,
};

// Licenses
pub use license::{LicenseKeys, LicenseReservation, LicenseReturn, PoolUpdate};
pub use lock::{AcquireOptions, DistributedLock, LockGuard};

// Granules
pub use cnm::{CnmFile, CnmFileType, CnmMessage};
pub use locator::{load_timestamps, GranuleLocator, GranulePair, Located};
pub use naming::{DatasetProduct, GranuleTimestamp, Pass, ProcessingType};
pub use report::{FailureReporter, RunErrorSummary};
pub use upload::{UploadPipeline, UploadReport, UploadState};

// Runs
pub use config::{LicenseSettings, LockSettings, UploadConfig};
pub use runner::{RunOutcome, Services, UploadRun};
