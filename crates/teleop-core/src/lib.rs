pub mod config;
pub mod errors;
pub mod types;

pub use config::SessionPolicy;
pub use errors::{PlatformError, RelayError, SessionError};
pub use types::*;
