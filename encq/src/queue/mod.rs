//! Job queueing and sequencing.

pub mod job;
pub mod messages;
pub mod sequencer;
