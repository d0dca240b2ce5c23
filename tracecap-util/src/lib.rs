//! Small pieces of plumbing shared by every `tracecap` crate: a uniform
//! channel re-export, one-shot logger initialization, and
//! [`StopHandle`], the enqueue-sentinel-then-join shutdown idiom used by
//! the pipeline's worker threads and the store's background task queue.

pub mod channel;
pub mod logging;
pub mod stop;

pub use channel::{unbounded, Receiver, Sender};
pub use stop::StopHandle;
