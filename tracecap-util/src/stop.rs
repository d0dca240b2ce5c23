//! Cooperative shutdown for a background worker thread.
//!
//! A `StopHandle` pairs a stop signal with the worker's `JoinHandle`. The
//! signal is a boxed closure rather than a fixed channel type so each
//! caller can send whatever sentinel its own queue expects (a unit
//! `Sender<()>`, a `Shutdown` variant on a work-item enum, ...).
//! Dropping it (or calling [`StopHandle::stop`] explicitly) sends the
//! stop signal and blocks until the thread has actually exited, so the
//! caller never outlives a thread it thinks it has stopped.

use std::thread::JoinHandle;

pub struct StopHandle<T = ()> {
    signal: Option<Box<dyn FnOnce() + Send>>,
    thread: Option<JoinHandle<T>>,
}

impl<T> StopHandle<T> {
    pub fn new(signal: Box<dyn FnOnce() + Send>, thread: JoinHandle<T>) -> Self {
        Self {
            signal: Some(signal),
            thread: Some(thread),
        }
    }

    /// Send the stop signal and join the worker thread, returning its
    /// final value. Calling this more than once is a no-op after the
    /// first call.
    pub fn stop(&mut self) -> Option<T> {
        if let Some(signal) = self.signal.take() {
            signal();
        }
        self.thread.take().and_then(|t| t.join().ok())
    }
}

impl<T> Drop for StopHandle<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
