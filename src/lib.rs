pub mod cancel;
pub mod comm;
pub mod config;
pub mod error;
pub mod kernels;
pub mod launcher;
pub mod link;
pub mod protocol;
pub mod runtime;
pub mod worker;

pub use config::{ClusterConfig, Timeouts};
pub use error::{FlotillaError, Result};
pub use runtime::Runtime;
