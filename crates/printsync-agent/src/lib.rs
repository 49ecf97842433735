pub mod camera;
pub mod cloud;
pub mod cmdlog;
pub mod config;
pub mod daemon;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod gcode;
pub mod job;
pub mod router;
pub mod sampling;
pub mod session;
pub mod stream;
pub mod system;
pub mod update;
pub mod util;

pub mod testkit;

pub use cloud::{CloudApi, HttpCloud, TokenStatus};
pub use config::{AgentConfig, RuntimeSettings, SettingsHandle, SettingsWriter, settings_channel};
pub use daemon::{Agent, AgentParts};
pub use error::AgentError;
pub use gateway::{GatewayAction, MoonrakerGateway, PrinterGateway};
pub use job::{JobEngine, JobState, TickOutcome};
pub use session::{ConnectionManager, SendOutcome};
