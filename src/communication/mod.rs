pub mod serial;
pub mod serial_linux;

pub use serial::{CommandOutcome, CommandResponse, SendOptions, SerialTransport};
pub use serial_linux::LinuxSerial;
