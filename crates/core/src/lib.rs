pub mod config;
pub mod error;
pub mod event;

pub use error::{EventBusError, ParleyError, Result};
