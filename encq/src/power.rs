//! System sleep inhibition while encodes run.

use tracing::debug;

/// Keeps the machine awake for the duration of an encode.
///
/// The sequencer calls `prevent_sleep` when it starts the first step of a
/// job and `allow_sleep` whenever it returns to idle, so the system never
/// sleeps mid-encode and never stays awake while the queue is empty. Both
/// calls may be repeated; implementations must tolerate that.
///
/// The OS-specific calls live in the host application; this crate ships only
/// the no-op implementation.
pub trait SleepInhibitor: Send + Sync {
    fn prevent_sleep(&self);
    fn allow_sleep(&self);
}

/// Inhibitor that only records the requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSleepInhibitor;

impl SleepInhibitor for NoopSleepInhibitor {
    fn prevent_sleep(&self) {
        debug!("Sleep prevention requested (no-op)");
    }

    fn allow_sleep(&self) {
        debug!("Sleep re-enabled (no-op)");
    }
}
