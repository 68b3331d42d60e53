use std::time::Duration;

/// Blocking suspension between batches.
pub trait Pause: Send + Sync {
    fn pause(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}
