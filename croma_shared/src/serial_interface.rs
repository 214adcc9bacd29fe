use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the serial transport. Connect-time variants carry the port so the
/// caller can tell a missing device from a permissions problem.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("serial port {port} does not exist")]
    LinkUnavailable { port: String },
    #[error("permission denied opening serial port {port}")]
    PermissionDenied { port: String },
    #[error("serial port {port} is held by another process")]
    LinkBusy { port: String },
    #[error("serial link error: {0}")]
    LinkError(String),
    #[error("no acknowledgement for '{command}' after {attempts} attempt(s) in {elapsed:?}")]
    Timeout {
        command: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl TransportError {
    /// Maps an OS error raised while opening `port`.
    pub fn from_open_error(port: &str, err: io::Error) -> Self {
        let port = port.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => TransportError::LinkUnavailable { port },
            io::ErrorKind::PermissionDenied => TransportError::PermissionDenied { port },
            io::ErrorKind::ResourceBusy => TransportError::LinkBusy { port },
            // EBUSY is not always mapped to ResourceBusy by the platform layer
            _ if err.raw_os_error() == Some(16) => TransportError::LinkBusy { port },
            _ => TransportError::LinkError(format!("{}: {}", port, err)),
        }
    }

    /// True for faults of the link itself, as opposed to a single unacknowledged command.
    pub fn is_link_fault(&self) -> bool {
        !matches!(self, TransportError::Timeout { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::LinkUnavailable { .. } => "link_unavailable",
            TransportError::PermissionDenied { .. } => "permission_denied",
            TransportError::LinkBusy { .. } => "link_busy",
            TransportError::LinkError(_) => "link_error",
            TransportError::Timeout { .. } => "timeout",
        }
    }
}

/// An open, line-oriented connection to a printer.
///
/// `read_line` must be cancel safe: if the returned future is dropped before completion,
/// bytes of a partially received line stay buffered for the next call.
#[async_trait]
pub trait SerialLink: Send {
    async fn write_line(&mut self, line: &str) -> io::Result<()>;
    /// Next response line without its terminator. `UnexpectedEof` when the device went away.
    async fn read_line(&mut self) -> io::Result<String>;
    /// Drops anything already received but not yet read.
    async fn discard_input(&mut self) -> io::Result<()>;
}

/// Driver able to open serial links, implemented by the real port backend and the simulator.
#[async_trait]
pub trait SerialInterface: Send + Sync {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, TransportError>;
    fn port_exists(&self, port: &str) -> bool;
    fn available_ports(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_errors_map_to_connect_failures() {
        let missing = TransportError::from_open_error("/dev/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(missing, TransportError::LinkUnavailable { .. }));
        let denied = TransportError::from_open_error("/dev/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind(), "permission_denied");
        let busy = TransportError::from_open_error("/dev/x", io::Error::from_raw_os_error(16));
        assert_eq!(busy.kind(), "link_busy");
        let other = TransportError::from_open_error("/dev/x", io::Error::other("boom"));
        assert_eq!(other.kind(), "link_error");
    }

    #[test]
    fn only_timeouts_are_not_link_faults() {
        let timeout = TransportError::Timeout {
            command: "G28".into(),
            attempts: 3,
            elapsed: Duration::from_secs(1),
        };
        assert!(!timeout.is_link_fault());
        assert!(TransportError::LinkError("gone".into()).is_link_fault());
    }
}
