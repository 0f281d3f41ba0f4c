//! Panic isolation for queue workers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::error;

/// Contains panics raised by kernel bodies so one bad launch fails its event
/// instead of killing the queue's worker thread.
#[derive(Debug, Default)]
pub struct PanicHandler {
    panic_count: AtomicUsize,
}

impl PanicHandler {
    /// A handler that has caught nothing yet.
    pub fn new() -> Self {
        Self {
            panic_count: AtomicUsize::new(0),
        }
    }

    /// Run `f`, turning a panic into a logged [`PanicInfo`].
    pub fn execute<F, R>(&self, f: F) -> Result<R, PanicInfo>
    where
        F: FnOnce() -> R,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => Ok(result),
            Err(payload) => {
                self.panic_count.fetch_add(1, Ordering::Relaxed);
                let info = PanicInfo::from_payload(payload);
                error!(message = %info.message, "command panicked on host device");
                Err(info)
            }
        }
    }

    /// Panics caught so far.
    pub fn panic_count(&self) -> usize {
        self.panic_count.load(Ordering::Relaxed)
    }
}

/// Panic payload rendered as text.
#[derive(Debug, Clone)]
pub struct PanicInfo {
    /// The panic message, or "unknown panic".
    pub message: String,
}

impl PanicInfo {
    fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        Self { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_is_contained() {
        let handler = PanicHandler::new();

        let result = handler.execute(|| {
            panic!("kernel blew up");
        });

        let info: PanicInfo = result.unwrap_err();
        assert_eq!(info.message, "kernel blew up");
        assert_eq!(handler.panic_count(), 1);
    }

    #[test]
    fn test_success_passes_through() {
        let handler = PanicHandler::new();
        assert_eq!(handler.execute(|| 42).unwrap(), 42);
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_formatted_payload() {
        let handler = PanicHandler::new();
        let n = 3;
        let info = handler
            .execute(|| {
                panic!("group {} failed", n);
            })
            .unwrap_err();
        assert_eq!(info.message, "group 3 failed");
    }
}
