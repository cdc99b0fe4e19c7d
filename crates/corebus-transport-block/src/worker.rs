//! Dedicated worker for endpoint bounding.
//!
//! The link's receive callback must stay short and may run in interrupt
//! context, so everything bounding-related is handed off to one consumer
//! thread through a bounded queue. The queue has capacity one: a schedule
//! while a run is already pending coalesces into it, which is all the
//! state machine needs because every run re-scans the whole table.

use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Weak;
use std::thread::JoinHandle;

use corebus_core::{Error, Result};
use tracing::debug;

use crate::transport::Inner;

pub(crate) struct BindWorker {
    queue: Option<SyncSender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl BindWorker {
    pub(crate) fn spawn(inner: Weak<Inner>) -> Result<Self> {
        let (queue, signals) = sync_channel::<()>(1);
        let thread = std::thread::Builder::new()
            .name("corebus-bind".into())
            .spawn(move || {
                while signals.recv().is_ok() {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.process_bindings();
                }
                debug!("binding worker stopped");
            })
            .map_err(|_| Error::WorkerStart)?;
        Ok(Self { queue: Some(queue), thread: Some(thread) })
    }

    /// Request a bounding pass. A pass already queued absorbs the request.
    pub(crate) fn schedule(&self) {
        if let Some(queue) = &self.queue {
            match queue.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {}
            }
        }
    }
}

impl Drop for BindWorker {
    fn drop(&mut self) {
        // Disconnect the queue so the thread's recv fails, then join.
        self.queue = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
