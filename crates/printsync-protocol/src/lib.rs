//! Wire types exchanged between the printer agent and the cloud backend.
//!
//! Inbound frames arrive as JSON objects carrying a `token`, an `interface`
//! tag and one of a small set of action tags. Outbound traffic is a single
//! envelope kind, a full-state snapshot of the device.

pub mod command;
pub mod envelope;
pub mod files;
pub mod frame;
pub mod printer;
pub mod settings;
pub mod system;

pub use command::{
    ExecuteCommand, FilesCommand, GcodeCommand, GcodeLines, MotionCommand, PrinterCommand,
    TemperatureCommand,
};
pub use envelope::{CommandList, EnvelopeExtra, OutboundEnvelope, PACKET_KIND, PrinterSnapshot};
pub use files::{FileListing, FileNode, NodeKind};
pub use frame::{CLIENT_INTERFACE, FrameError, InboundFrame, Presence, StreamSignal, parse_frame};
pub use printer::{
    HeaterReading, JobFile, JobSummary, PrinterData, PrinterState, Progress, StateFlags,
    Temperatures,
};
pub use settings::{NozzleTip, WebcamTransforms};
pub use system::{MemoryUsage, SystemInfo};
