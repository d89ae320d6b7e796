pub mod config;
pub mod error;
pub mod supervisor;
pub mod worker;

pub use config::Config;
pub use error::RuntimeError;
pub use supervisor::Supervisor;
pub use worker::Worker;
