pub mod archive;
pub mod config;
pub mod discovery;
pub mod error;
pub mod monitor;
pub mod mqtt;
pub mod publisher;
pub mod restart;
pub mod session;
pub mod transform;
pub mod upstream;

// Re-export commonly used items
pub use config::Config;
pub use error::{AppError, Result};
pub use monitor::{Bridge, ExitReason};
pub use publisher::{MessageSink, Publisher};
