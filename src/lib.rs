pub mod config;
pub mod error;
pub mod types;
pub mod relay;
pub mod server;
pub mod providers;
pub mod metrics;

pub use error::RelayError;
pub use relay::{Relay, RelayResult};
pub type Result<T> = std::result::Result<T, RelayError>;
