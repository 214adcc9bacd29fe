// croma_shared: shared traits and types for the host, the simulator and tests

pub mod api_models;
pub mod config;
pub mod gcode_utils;
pub mod print_job;
pub mod serial_interface;
pub mod telemetry;

pub use gcode_utils::{Command, CommandClass};
pub use serial_interface::{SerialInterface, SerialLink, TransportError};
