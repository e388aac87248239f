pub mod controller;
pub mod error;
pub mod logsink;
pub mod orchestrator;
pub mod platform;
pub mod probe;
pub mod process;
pub mod services;

pub use controller::*;
pub use error::*;
pub use logsink::*;
pub use orchestrator::*;
pub use platform::*;
pub use probe::*;
pub use process::*;
pub use services::*;
