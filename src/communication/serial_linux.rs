use async_trait::async_trait;
use croma_shared::serial_interface::{SerialInterface, SerialLink, TransportError};
use serial2_tokio::SerialPort;
use std::io;
use std::path::Path;

/// Linux implementation of SerialInterface using serial2-tokio
pub struct LinuxSerial;

#[async_trait]
impl SerialInterface for LinuxSerial {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        let serial = SerialPort::open(port, baud).map_err(|e| TransportError::from_open_error(port, e))?;
        Ok(Box::new(PortLink {
            port: serial,
            pending: Vec::new(),
        }))
    }

    fn port_exists(&self, port: &str) -> bool {
        Path::new(port).exists()
    }

    fn available_ports(&self) -> Vec<String> {
        match SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(_) => vec![],
        }
    }
}

struct PortLink {
    port: SerialPort,
    /// Bytes received after the last complete line.
    pending: Vec<u8>,
}

impl PortLink {
    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string())
    }
}

#[async_trait]
impl SerialLink for PortLink {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes()).await
    }

    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            let mut chunk = [0u8; 256];
            let n = self.port.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed"));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    async fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port.discard_input_buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_reported_absent() {
        assert!(!LinuxSerial.port_exists("/dev/croma-does-not-exist"));
    }

    #[tokio::test]
    async fn opening_missing_device_is_link_unavailable() {
        let err = LinuxSerial.open("/dev/croma-does-not-exist", 115200).await.err();
        assert!(matches!(err, Some(TransportError::LinkUnavailable { .. })));
    }
}
