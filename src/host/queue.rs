//! In-order command queue backed by one worker thread.
//!
//! Enqueued commands are buffered on the queue until `flush`, then handed to
//! the worker over a channel in enqueue order. The worker waits for each
//! command's dependencies, runs it and moves its event to a terminal state.

use super::kernel::HostKernel;
use super::memory::HostBuffer;
use super::panic::PanicHandler;
use crate::device::{
    CommandQueue, DeviceBuffer, DeviceId, DeviceInfo, Event, EventStatus, HostRegion, Kernel,
    LaunchInput, NdRange,
};
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

enum CommandKind {
    Write {
        buffer: DeviceBuffer,
        offset: usize,
        src: HostRegion,
    },
    Read {
        buffer: DeviceBuffer,
        offset: usize,
        dst: HostRegion,
    },
    Launch {
        kernel: Arc<dyn Kernel>,
        inputs: Vec<LaunchInput>,
        range: NdRange,
    },
    Marker,
}

struct Command {
    kind: CommandKind,
    wait_for: Vec<Event>,
    event: Event,
}

enum Message {
    Run(Command),
    Shutdown,
}

/// In-order command queue of a host device, run by one worker thread.
pub struct HostQueue {
    device_id: DeviceId,
    info: DeviceInfo,
    label: String,
    pending: Mutex<Vec<Command>>,
    sender: Sender<Message>,
    /// First failure since the last `finish`.
    failure: Arc<Mutex<Option<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<HostQueue>,
    next_id: AtomicU64,
}

impl HostQueue {
    pub(crate) fn spawn(device_id: DeviceId, info: DeviceInfo) -> Result<Arc<Self>> {
        static QUEUE_SEQ: AtomicU64 = AtomicU64::new(0);

        let (sender, receiver) = unbounded();
        let failure = Arc::new(Mutex::new(None));
        let label = format!(
            "{}#{}",
            info.name,
            QUEUE_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        let queue = Arc::new_cyclic(|this| HostQueue {
            device_id,
            info,
            label: label.clone(),
            pending: Mutex::new(Vec::new()),
            sender,
            failure: Arc::clone(&failure),
            worker: Mutex::new(None),
            this: this.clone(),
            next_id: AtomicU64::new(0),
        });

        let handle = thread::Builder::new()
            .name(format!("hetbatch-queue-{}", label))
            .spawn(move || worker_loop(receiver, failure))
            .map_err(|e| Error::queue(format!("failed to spawn queue worker: {}", e)))?;
        *queue.worker.lock() = Some(handle);

        debug!(queue = %queue.label, device = %device_id, "command queue created");
        Ok(queue)
    }

    /// Queue name used in logs, `<device>#<n>`.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn push(&self, name: &str, kind: CommandKind, wait_for: &[Event]) -> Event {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = Event::new(format!("{}:{}#{}", self.label, name, id));
        let weak: Weak<dyn CommandQueue> = self.this.clone();
        event.attach_queue(weak);

        self.pending.lock().push(Command {
            kind,
            wait_for: wait_for.to_vec(),
            event: event.clone(),
        });
        event
    }

    fn host_buffer<'b>(&self, buffer: &'b DeviceBuffer) -> Result<&'b HostBuffer> {
        buffer
            .as_any()
            .downcast_ref::<HostBuffer>()
            .ok_or_else(|| Error::argument("buffer was not created by the host driver"))
    }

    fn check_transfer(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        region: &HostRegion,
    ) -> Result<()> {
        self.host_buffer(buffer)?;
        if offset + region.len > buffer.len() {
            return Err(Error::argument(format!(
                "transfer of {} bytes at offset {} exceeds buffer of {} bytes",
                region.len,
                offset,
                buffer.len()
            )));
        }
        if region.offset + region.len > region.storage.read().len() {
            return Err(Error::argument("host region exceeds its storage"));
        }
        Ok(())
    }
}

impl CommandQueue for HostQueue {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn enqueue_write(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        src: HostRegion,
        wait_for: &[Event],
    ) -> Result<Event> {
        self.check_transfer(buffer, offset, &src)?;
        let kind = CommandKind::Write {
            buffer: Arc::clone(buffer),
            offset,
            src,
        };
        Ok(self.push("write", kind, wait_for))
    }

    fn enqueue_read(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        dst: HostRegion,
        wait_for: &[Event],
    ) -> Result<Event> {
        self.check_transfer(buffer, offset, &dst)?;
        let kind = CommandKind::Read {
            buffer: Arc::clone(buffer),
            offset,
            dst,
        };
        Ok(self.push("read", kind, wait_for))
    }

    fn enqueue_kernel(
        &self,
        kernel: &Arc<dyn Kernel>,
        inputs: Vec<LaunchInput>,
        range: NdRange,
        wait_for: &[Event],
    ) -> Result<Event> {
        let launch_error = |reason: String| Error::KernelLaunch {
            kernel: kernel.name().to_string(),
            environment: self.info.name.clone(),
            reason,
        };

        let host_kernel = kernel
            .as_any()
            .downcast_ref::<HostKernel>()
            .ok_or_else(|| launch_error("kernel was not built for the host driver".into()))?;
        host_kernel
            .validate(&inputs, range, &self.info)
            .map_err(launch_error)?;

        trace!(
            queue = %self.label,
            kernel = kernel.name(),
            global = range.global,
            local = range.local,
            "kernel enqueued"
        );
        let kind = CommandKind::Launch {
            kernel: Arc::clone(kernel),
            inputs,
            range,
        };
        Ok(self.push(kernel.name(), kind, wait_for))
    }

    fn flush(&self) -> Result<()> {
        // Holding the pending lock while sending keeps submission order equal
        // to enqueue order across concurrent flushes.
        let mut pending = self.pending.lock();
        for command in pending.drain(..) {
            command.event.set_status(EventStatus::Submitted);
            if let Err(err) = self.sender.send(Message::Run(command)) {
                if let Message::Run(command) = err.0 {
                    command
                        .event
                        .set_status(EventStatus::Failed("queue worker has shut down".into()));
                }
                return Err(Error::queue(format!("{}: worker has shut down", self.label)));
            }
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let marker = self.push("finish", CommandKind::Marker, &[]);
        self.flush()?;
        marker.wait()?;

        match self.failure.lock().take() {
            Some(reason) => Err(Error::execution(reason)),
            None => Ok(()),
        }
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(queue = %self.label, error = %e, "flush on drop failed");
        }
        let _ = self.sender.send(Message::Shutdown);

        if let Some(handle) = self.worker.lock().take() {
            // The last handle may be released by the worker itself while it
            // waits on an event of this queue.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for HostQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostQueue")
            .field("label", &self.label)
            .field("device_id", &self.device_id)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

fn worker_loop(receiver: Receiver<Message>, failure: Arc<Mutex<Option<String>>>) {
    let panic_handler = PanicHandler::new();

    while let Ok(message) = receiver.recv() {
        let command = match message {
            Message::Run(command) => command,
            Message::Shutdown => break,
        };

        if let Err(e) = Event::wait_all(&command.wait_for) {
            let reason = format!("{}: dependency failed: {}", command.event.label(), e);
            fail(&command.event, &failure, reason);
            continue;
        }

        command.event.set_status(EventStatus::Running);
        let outcome = panic_handler.execute(|| execute(command.kind));
        match outcome {
            Ok(Ok(())) => command.event.set_status(EventStatus::Complete),
            Ok(Err(e)) => fail(&command.event, &failure, e.to_string()),
            Err(panic) => {
                let reason = format!("{} panicked: {}", command.event.label(), panic.message);
                fail(&command.event, &failure, reason);
            }
        }
    }
}

fn fail(event: &Event, failure: &Mutex<Option<String>>, reason: String) {
    warn!(command = event.label(), %reason, "command failed");
    failure.lock().get_or_insert_with(|| reason.clone());
    event.set_status(EventStatus::Failed(reason));
}

fn execute(kind: CommandKind) -> Result<()> {
    match kind {
        CommandKind::Write {
            buffer,
            offset,
            src,
        } => downcast(&buffer)?.write_from(offset, &src),
        CommandKind::Read {
            buffer,
            offset,
            dst,
        } => downcast(&buffer)?.read_into(offset, &dst),
        CommandKind::Launch {
            kernel,
            inputs,
            range,
        } => {
            let host_kernel = kernel
                .as_any()
                .downcast_ref::<HostKernel>()
                .ok_or_else(|| Error::execution("kernel was not built for the host driver"))?;
            host_kernel.run(&inputs, range)
        }
        CommandKind::Marker => Ok(()),
    }
}

fn downcast(buffer: &DeviceBuffer) -> Result<&HostBuffer> {
    buffer
        .as_any()
        .downcast_ref::<HostBuffer>()
        .ok_or_else(|| Error::execution("buffer was not created by the host driver"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, HostPtrMode, MemAccess, MemFlags};
    use parking_lot::RwLock;
    use std::time::Duration;

    fn info() -> DeviceInfo {
        DeviceInfo {
            name: "cpu".into(),
            vendor: "test".into(),
            class: DeviceClass::Cpu,
            supports_double: true,
            compute_units: 1,
            max_work_group_size: 64,
            global_mem_bytes: 0,
            driver_version: "0".into(),
        }
    }

    fn region(bytes: Vec<u8>) -> HostRegion {
        let len = bytes.len();
        HostRegion {
            storage: Arc::new(RwLock::new(bytes)),
            offset: 0,
            len,
        }
    }

    fn device_buffer(len: usize) -> DeviceBuffer {
        let flags = MemFlags::new(MemAccess::ReadWrite, HostPtrMode::CopyHostPtr);
        Arc::new(HostBuffer::allocate(flags, len, None).unwrap())
    }

    #[test]
    fn test_commands_wait_for_flush() {
        let queue = HostQueue::spawn(DeviceId(0), info()).unwrap();
        let buffer = device_buffer(4);

        let event = queue
            .enqueue_write(&buffer, 0, region(vec![1, 2, 3, 4]), &[])
            .unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(event.status(), EventStatus::Queued);

        queue.flush().unwrap();
        event.wait().unwrap();
        assert!(event.is_complete());
    }

    #[test]
    fn test_wait_flushes_queued_command() {
        let queue = HostQueue::spawn(DeviceId(0), info()).unwrap();
        let buffer = device_buffer(2);
        let event = queue
            .enqueue_write(&buffer, 0, region(vec![9, 9]), &[])
            .unwrap();
        event.wait().unwrap();
    }

    #[test]
    fn test_in_order_write_then_read() {
        let queue = HostQueue::spawn(DeviceId(0), info()).unwrap();
        let buffer = device_buffer(3);
        let dst = region(vec![0; 3]);

        queue
            .enqueue_write(&buffer, 0, region(vec![7, 8, 9]), &[])
            .unwrap();
        queue.enqueue_read(&buffer, 0, dst.clone(), &[]).unwrap();
        queue.finish().unwrap();

        assert_eq!(*dst.storage.read(), vec![7, 8, 9]);
    }

    #[test]
    fn test_cross_queue_dependency() {
        let producer = HostQueue::spawn(DeviceId(0), info()).unwrap();
        let consumer = HostQueue::spawn(DeviceId(0), info()).unwrap();
        let buffer = device_buffer(2);
        let dst = region(vec![0; 2]);

        let written = producer
            .enqueue_write(&buffer, 0, region(vec![5, 6]), &[])
            .unwrap();
        // The producer is never flushed explicitly; the consumer's worker
        // flushes it when waiting on the dependency.
        consumer
            .enqueue_read(&buffer, 0, dst.clone(), &[written])
            .unwrap();
        consumer.finish().unwrap();

        assert_eq!(*dst.storage.read(), vec![5, 6]);
    }

    #[test]
    fn test_kernel_panic_fails_event_and_finish() {
        let queue = HostQueue::spawn(DeviceId(0), info()).unwrap();
        let kernel: Arc<dyn Kernel> = Arc::new(HostKernel::new("boom", |_| {
            panic!("kernel exploded");
        }));

        let event = queue
            .enqueue_kernel(&kernel, Vec::new(), NdRange::new(1, 1), &[])
            .unwrap();
        let err = event.wait().unwrap_err();
        assert!(err.to_string().contains("kernel exploded"));
        assert!(matches!(queue.finish(), Err(Error::KernelExecution(_))));

        // The worker survives and the failure is reported once.
        let ok = queue
            .enqueue_kernel(&kernel_ok(), Vec::new(), NdRange::new(1, 1), &[])
            .unwrap();
        ok.wait().unwrap();
        queue.finish().unwrap();
    }

    fn kernel_ok() -> Arc<dyn Kernel> {
        Arc::new(HostKernel::new("ok", |_| Ok(())))
    }

    #[test]
    fn test_failed_dependency_propagates() {
        let queue = HostQueue::spawn(DeviceId(0), info()).unwrap();
        let failed = Event::new("upstream");
        failed.set_status(EventStatus::Failed("lost".into()));

        let event = queue
            .enqueue_kernel(&kernel_ok(), Vec::new(), NdRange::new(1, 1), &[failed])
            .unwrap();
        let err = event.wait().unwrap_err();
        assert!(err.to_string().contains("dependency failed"));
    }

    #[test]
    fn test_invalid_launch_rejected_at_enqueue() {
        let queue = HostQueue::spawn(DeviceId(0), info()).unwrap();
        let err = queue
            .enqueue_kernel(&kernel_ok(), Vec::new(), NdRange::new(10, 3), &[])
            .unwrap_err();
        assert!(matches!(err, Error::KernelLaunch { .. }));
    }

    #[test]
    fn test_drop_drains_pending() {
        let buffer = device_buffer(1);
        let event = {
            let queue = HostQueue::spawn(DeviceId(0), info()).unwrap();
            queue.enqueue_write(&buffer, 0, region(vec![3]), &[]).unwrap()
        };
        event.wait().unwrap();
        let host = buffer.as_any().downcast_ref::<HostBuffer>().unwrap();
        assert_eq!(host.load_bytes(0, 1).unwrap(), vec![3]);
    }
}
