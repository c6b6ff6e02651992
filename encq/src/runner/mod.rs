//! Encoder process execution and output watching.

pub mod background;
pub mod output;
pub mod process;
