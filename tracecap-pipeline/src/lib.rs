//! The compress-and-commit half of the capture engine: a two-stage
//! pipeline moving captured frames from the producer thread onto disk,
//! committing through the store's background task queue rather than a
//! parallel commit path of its own.

mod balancer;
mod compress;
mod pipeline;
mod stats;

pub use balancer::{BackPressure, CompressionLevels};
pub use compress::{compress, decompress};
pub use pipeline::{Payload, Pipeline, StringDrain};
pub use stats::{RunningMean, Stage, StageStats};
