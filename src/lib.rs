pub mod error;
pub mod gateway;

pub use error::{GatewayError, Result};
