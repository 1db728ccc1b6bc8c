//! Common utilities and types shared across cachecoord

pub mod config;
pub mod error;

pub use config::CoordinatorConfig;
pub use error::{Error, Result};
