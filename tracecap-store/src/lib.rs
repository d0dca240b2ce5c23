//! A thin, reentrant, retry-on-busy transactional façade over SQLite,
//! exposing the record-level read/write/query surface and bulk
//! transaction scoping that `tracecap-collect` and `tracecap-pipeline`
//! build on.

mod facade;
mod query;
mod task;
mod value;

pub use facade::{RecordHandle, StoreFacade, TxContext};
pub use query::{Constraint, Query, QueryOperator, QueryResults};
pub use task::{AsyncTaskQueue, Task};
pub use value::Value;

#[cfg(test)]
mod tests;
