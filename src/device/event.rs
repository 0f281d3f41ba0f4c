//! Completion events for asynchronous device commands.
//!
//! An event moves `Queued -> Submitted -> Running` and ends in `Complete` or
//! `Failed`. Waiters park on a condvar until a terminal state is reached.
//! Drivers that track completion themselves attach a [`NativeEvent`], which
//! waits and status queries consult.

use super::driver::CommandQueue;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Lifecycle of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// Enqueued but not yet flushed to the device.
    Queued,
    /// Handed to the device, waiting for its dependencies or its turn.
    Submitted,
    /// Executing on the device.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished with the given reason.
    Failed(String),
}

impl EventStatus {
    /// Whether the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Failed(_))
    }
}

/// Completion source owned by a driver that tracks its commands itself.
pub trait NativeEvent: Send + Sync + fmt::Debug {
    /// Block until the command has finished. `Err` carries the failure reason.
    fn wait(&self) -> std::result::Result<(), String>;

    /// Terminal status once the command has finished, `None` while it runs.
    fn poll(&self) -> Option<EventStatus>;

    /// Concrete event, for the driver that created it.
    fn as_any(&self) -> &dyn Any;
}

struct EventState {
    label: String,
    status: Mutex<EventStatus>,
    condvar: Condvar,
    /// Queue holding the command while it is still `Queued`.
    queue: Mutex<Option<Weak<dyn CommandQueue>>>,
    native: Mutex<Option<Arc<dyn NativeEvent>>>,
}

/// Shared handle to the completion state of one command.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventState>,
}

impl Event {
    /// A fresh event in the `Queued` state.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventState {
                label: label.into(),
                status: Mutex::new(EventStatus::Queued),
                condvar: Condvar::new(),
                queue: Mutex::new(None),
                native: Mutex::new(None),
            }),
        }
    }

    /// An event that has already completed. Useful as a user event.
    pub fn complete(label: impl Into<String>) -> Self {
        let event = Self::new(label);
        event.set_status(EventStatus::Complete);
        event
    }

    /// Name given at creation, used in logs.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current status.
    pub fn status(&self) -> EventStatus {
        self.refresh();
        self.inner.status.lock().clone()
    }

    /// Whether the command finished successfully.
    pub fn is_complete(&self) -> bool {
        self.status() == EventStatus::Complete
    }

    /// Record the queue the command sits on, so waiting can flush it.
    pub fn attach_queue(&self, queue: Weak<dyn CommandQueue>) {
        *self.inner.queue.lock() = Some(queue);
    }

    /// Hand completion tracking to a driver-side event.
    pub fn attach_native(&self, native: Arc<dyn NativeEvent>) {
        *self.inner.native.lock() = Some(native);
    }

    /// The driver-side event, if one is attached.
    pub fn native(&self) -> Option<Arc<dyn NativeEvent>> {
        self.inner.native.lock().clone()
    }

    /// Update the status. Terminal states are final and wake all waiters.
    pub fn set_status(&self, status: EventStatus) {
        let mut current = self.inner.status.lock();
        if current.is_terminal() {
            return;
        }
        let terminal = status.is_terminal();
        *current = status;
        drop(current);

        if terminal {
            self.inner.queue.lock().take();
            self.inner.condvar.notify_all();
        }
    }

    /// Block until the event completes.
    ///
    /// A command that was never flushed is flushed first, so waiting cannot
    /// hang on work the device has not seen.
    pub fn wait(&self) -> Result<()> {
        self.flush_if_queued()?;
        if let Some(native) = self.pending_native() {
            let status = match native.wait() {
                Ok(()) => EventStatus::Complete,
                Err(reason) => EventStatus::Failed(reason),
            };
            self.set_status(status);
        }

        let mut status = self.inner.status.lock();
        while !status.is_terminal() {
            self.inner.condvar.wait(&mut status);
        }
        Self::outcome(&status)
    }

    /// Like [`Event::wait`] with an upper bound. Returns `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        self.flush_if_queued()?;

        let deadline = Instant::now() + timeout;
        if let Some(native) = self.pending_native() {
            loop {
                if let Some(status) = native.poll() {
                    self.set_status(status);
                    break;
                }
                if Instant::now() >= deadline {
                    return Ok(false);
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        let mut status = self.inner.status.lock();
        while !status.is_terminal() {
            if self.inner.condvar.wait_until(&mut status, deadline).timed_out() {
                if !status.is_terminal() {
                    return Ok(false);
                }
                break;
            }
        }
        Self::outcome(&status).map(|_| true)
    }

    /// Wait for every event, reporting the first failure.
    pub fn wait_all(events: &[Event]) -> Result<()> {
        let mut first_err = None;
        for event in events {
            if let Err(e) = event.wait() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether both handles refer to the same command.
    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn pending_native(&self) -> Option<Arc<dyn NativeEvent>> {
        if self.inner.status.lock().is_terminal() {
            return None;
        }
        self.native()
    }

    fn refresh(&self) {
        if let Some(native) = self.pending_native() {
            if let Some(status) = native.poll() {
                self.set_status(status);
            }
        }
    }

    fn flush_if_queued(&self) -> Result<()> {
        if *self.inner.status.lock() != EventStatus::Queued {
            return Ok(());
        }
        // The status lock must not be held here: flushing hands the command
        // to a worker that will update this very event.
        let queue = self.inner.queue.lock().as_ref().and_then(Weak::upgrade);
        match queue {
            Some(queue) => queue.flush(),
            None => Ok(()),
        }
    }

    fn outcome(status: &EventStatus) -> Result<()> {
        match status {
            EventStatus::Failed(reason) => Err(Error::execution(reason.clone())),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("label", &self.inner.label)
            .field("status", &*self.inner.status.lock())
            .finish()
    }
}
