//! Re-exports `crossbeam_channel` so every crate in the workspace pins the
//! same version without spelling it out individually.

pub use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
