pub mod loader;
pub mod types;
pub mod validation;

pub use loader::{ConfigFormat, ConfigLoader, DEFAULT_ENV_PREFIX};
pub use types::*;
pub use validation::ConfigValidator;
