//! lims-ingest library interface
//!
//! Reconciles LIMS plate, sample and study messages into the warehouse
//! graph Plate → Well → {Sample, Study}.

pub mod coordinator;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod identity;
pub mod linker;
pub mod locks;
pub mod outcome;
pub mod payload;
pub mod reference_sync;
pub mod settings;
pub mod staleness;
pub mod utils;

pub use crate::dispatcher::Dispatcher;
pub use crate::engine::ReconcileEngine;
pub use crate::error::{IngestError, IngestResult, RejectReason};
pub use crate::linker::LinkWorker;
pub use crate::outcome::{EntityOutcome, LinkOutcome, PlateReport, ReferenceReport, Report, Verdict};
pub use crate::payload::{IngestMessage, PlatePayload, ReferencePayload, WellPayload};
pub use crate::settings::IngestSettings;
