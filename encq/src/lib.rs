//! Background encoding job runner.
//!
//! Launches external encoder processes (single or piped), drains their
//! output, detects success/failure from textual markers, and sequences a
//! FIFO queue of multi-step jobs for a transcoding front-end.

pub mod error;
pub mod logging;
pub mod power;
pub mod queue;
pub mod runner;

pub use error::{Error, Result};
