//! Single-consumer background task executor, used by out-of-band writers
//! (metadata, `StringMap` deltas) distinct from the two-stage frame
//! pipeline. Owned directly by [`StoreFacade`]; holds only a `Weak` back
//! reference so the cycle never keeps the facade alive.

use crate::facade::{StoreFacade, TxContext};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracecap_error::{Error, Result};
use tracecap_util::channel::{unbounded, RecvTimeoutError, Sender};
use tracecap_util::StopHandle;

/// The consumer's drain cadence.
const CONSUMER_CADENCE: Duration = Duration::from_millis(100);

/// One unit of out-of-band work, executed inside the consumer's
/// `safe_transaction`.
pub trait Task: Send {
    fn execute(&self, tx: &TxContext<'_>) -> Result<()>;
}

enum QueueItem {
    Work(Box<dyn Task>),
    Shutdown,
}

/// Single background consumer plus a thread-safe FIFO. The consumer
/// thread is lazily spawned on first `enqueue`; shutdown is cooperative
/// via a `Shutdown` sentinel, never a hard abort.
pub struct AsyncTaskQueue {
    facade: Weak<StoreFacade>,
    sender: Mutex<Option<Sender<QueueItem>>>,
    stop_handle: Mutex<Option<StopHandle<()>>>,
    consumer_thread_id: Mutex<Option<ThreadId>>,
}

impl AsyncTaskQueue {
    pub fn new(facade: Weak<StoreFacade>) -> Self {
        Self {
            facade,
            sender: Mutex::new(None),
            stop_handle: Mutex::new(None),
            consumer_thread_id: Mutex::new(None),
        }
    }

    pub fn enqueue(&self, task: Box<dyn Task>) {
        let mut sender_guard = self.sender.lock();
        if sender_guard.is_none() {
            self.spawn_consumer(&mut sender_guard);
        }
        if let Some(sender) = sender_guard.as_ref() {
            let _ = sender.send(QueueItem::Work(task));
        }
    }

    fn spawn_consumer(&self, sender_guard: &mut Option<Sender<QueueItem>>) {
        let (tx, rx) = unbounded::<QueueItem>();
        let facade = Weak::clone(&self.facade);

        let thread = thread::Builder::new()
            .name("tracecap-task-queue".into())
            .spawn(move || {
                let mut pending: Vec<Box<dyn Task>> = Vec::new();
                loop {
                    match rx.recv_timeout(CONSUMER_CADENCE) {
                        Ok(QueueItem::Work(task)) => pending.push(task),
                        Ok(QueueItem::Shutdown) => {
                            drain(&facade, &mut pending);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            drain(&facade, &mut pending);
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn tracecap-task-queue consumer thread");

        *self.consumer_thread_id.lock() = Some(thread.thread().id());
        let stop_tx = tx.clone();
        *self.stop_handle.lock() = Some(StopHandle::new(
            Box::new(move || {
                let _ = stop_tx.send(QueueItem::Shutdown);
            }),
            thread,
        ));
        *sender_guard = Some(tx);
    }

    /// Enqueues the shutdown sentinel and joins the consumer thread.
    /// Fails with [`Error::Shutdown`] if called from within a `Task`'s
    /// own `execute()` (that would be the consumer thread joining
    /// itself).
    pub fn stop(&self) -> Result<()> {
        if let Some(id) = *self.consumer_thread_id.lock() {
            if thread::current().id() == id {
                return Err(Error::Shutdown);
            }
        }
        self.sender.lock().take();
        if let Some(mut handle) = self.stop_handle.lock().take() {
            handle.stop();
        }
        Ok(())
    }
}

impl Drop for AsyncTaskQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn drain(facade: &Weak<StoreFacade>, pending: &mut Vec<Box<dyn Task>>) {
    if pending.is_empty() {
        return;
    }
    let Some(facade) = facade.upgrade() else {
        log::warn!(
            "task queue consumer draining after the store was dropped; discarding {} task(s)",
            pending.len()
        );
        pending.clear();
        return;
    };
    let tasks = std::mem::take(pending);
    let result = facade.safe_transaction(move |tx| {
        for task in &tasks {
            task.execute(tx)?;
        }
        Ok(())
    });
    if let Err(e) = result {
        log::error!("task queue commit failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use tracecap_schema::{core_schema, TimeType};

    struct InsertClock(u32);

    impl Task for InsertClock {
        fn execute(&self, tx: &TxContext<'_>) -> Result<()> {
            tx.insert(
                "Clocks",
                &["id", "name", "period"],
                &[Value::U32(self.0), Value::Text("c".into()), Value::U32(1)],
            )?;
            Ok(())
        }
    }

    #[test]
    fn enqueued_tasks_eventually_run_and_stop_joins_cleanly() {
        let facade = StoreFacade::open_in_memory().unwrap();
        facade.apply_schema(&core_schema(5, TimeType::Int).unwrap()).unwrap();
        facade.enqueue_task(Box::new(InsertClock(0)));
        facade.enqueue_task(Box::new(InsertClock(1)));
        facade.stop_task_queue().unwrap();

        let rows: Vec<_> = facade.query("Clocks").select(&["id"]).run().unwrap().collect();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn stop_called_from_within_a_task_fails_instead_of_deadlocking() {
        use std::sync::mpsc;

        let facade = StoreFacade::open_in_memory().unwrap();
        facade.apply_schema(&core_schema(5, TimeType::Int).unwrap()).unwrap();

        struct StopFromWithin {
            facade: Arc<StoreFacade>,
            result: mpsc::Sender<bool>,
        }
        impl Task for StopFromWithin {
            fn execute(&self, _tx: &TxContext<'_>) -> Result<()> {
                let outcome = self.facade.stop_task_queue();
                let _ = self.result.send(outcome.is_err());
                Ok(())
            }
        }

        let (result_tx, result_rx) = mpsc::channel();
        facade.enqueue_task(Box::new(StopFromWithin {
            facade: Arc::clone(&facade),
            result: result_tx,
        }));

        let was_rejected = result_rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert!(was_rejected);

        facade.stop_task_queue().unwrap();
    }
}
