use anyhow::Result;
use pacer_core::Detection;

/// Anti-bot signal source, queried with a page or session handle before dispatch.
pub trait BlockDetector<H: ?Sized> {
    fn detect(&self, handle: &H) -> Result<Detection>;
}

impl<H: ?Sized, F> BlockDetector<H> for F
where
    F: Fn(&H) -> Result<Detection>,
{
    fn detect(&self, handle: &H) -> Result<Detection> {
        self(handle)
    }
}

/// Per-call options for `process_batch`.
pub struct DispatchContext<'a, H: ?Sized> {
    pub(crate) detection: Option<(&'a H, &'a dyn BlockDetector<H>)>,
    pub(crate) final_batch: bool,
}

impl<'a> DispatchContext<'a, ()> {
    /// No detector, not final.
    pub fn none() -> Self {
        Self { detection: None, final_batch: false }
    }
}

impl<'a, H: ?Sized> DispatchContext<'a, H> {
    pub fn with_detector(handle: &'a H, detector: &'a dyn BlockDetector<H>) -> Self {
        Self {
            detection: Some((handle, detector)),
            final_batch: false,
        }
    }

    /// Mark the batch as the last of a run: no inter-batch pause afterwards.
    pub fn final_batch(mut self, final_batch: bool) -> Self {
        self.final_batch = final_batch;
        self
    }

    pub fn is_final(&self) -> bool {
        self.final_batch
    }
}
