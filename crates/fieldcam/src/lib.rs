//! `fieldcam` - An unattended geotagging camera pipeline
//!
//! This library captures frames from a camera at a fixed cadence, tags each
//! one with the best available position fix, and stores the results in
//! time-bucketed session directories while keeping the volume within its
//! free-space budget.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod position;
pub mod storage;
pub mod tagging;
pub mod time;

pub use capture::{AcquisitionController, Frame};
pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use pipeline::{HealthReport, Pipeline, PipelineState};
pub use position::{FixValidity, PositionFix, PositionTracker};
pub use storage::{StorageManager, StorageSession};
pub use tagging::{MetadataTagger, TaggedImage};
