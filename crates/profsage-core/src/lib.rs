//! ProfSage Core — configuration and the shared error taxonomy.

pub mod config;
pub mod error;

pub use config::{ProfSageConfig, Timeouts};
pub use error::{Error, Result};
