pub mod config;
pub mod error;

pub use config::{AppConfig, LimiterConfig, LimiterSettings, StoreConfig};
pub use error::{FlowgateError, FlowgateResult};
