//! Core module - Engine supervision, config routing and core process lifecycle

mod engine;
mod error;
mod inspector;
mod launcher;
pub mod log;
pub mod profile;
mod router;
pub mod settings;
mod terminator;

pub use engine::{CoreRequest, EngineSupervisor};
pub use error::{CoreError, ErrorKind};
pub use log::EngineLog;
pub use profile::ProfileKind;
pub use router::ConfigRouter;
pub use settings::Settings;
