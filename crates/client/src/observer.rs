//! Observer hook for status transitions.

use crate::status::JobStatus;

/// Callback invoked synchronously by the event dispatcher on every
/// status transition, in the exact order frames were received.
///
/// The callback runs on the event-channel task: a slow implementation
/// stalls frame processing for its job. That trade-off keeps per-event
/// ordering trivial; observers that need to do real work should hand
/// the snapshot off to their own task.
pub trait StatusObserver: Send + Sync {
    fn on_status_changed(&self, status: &JobStatus);
}

/// Default observer that does nothing.
pub struct NoopObserver;

impl StatusObserver for NoopObserver {
    fn on_status_changed(&self, _status: &JobStatus) {}
}

/// Adapter that lets a plain closure act as an observer.
pub struct FnObserver<F>(pub F);

impl<F> StatusObserver for FnObserver<F>
where
    F: Fn(&JobStatus) + Send + Sync,
{
    fn on_status_changed(&self, status: &JobStatus) {
        (self.0)(status)
    }
}
