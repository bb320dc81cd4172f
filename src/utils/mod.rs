pub mod errors;
pub mod tasks;
pub mod tracing;

pub use errors::{ResilienceError, ResilienceResult};
pub use tasks::{BackgroundTask, TaskGroup};
pub use tracing::init_tracing;
