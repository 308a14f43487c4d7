pub mod config;
pub mod error;
pub mod log_buffer;
pub mod ports;
pub mod supervisor;

pub use config::{SupervisorConfig, SupervisorConfigDeserialize};
pub use error::SupervisorError;
pub use supervisor::{StartOutcome, Supervisor, WorkerInfo};
