//! Framed request/response access to the printer's serial link.
//!
//! Every exchange (write, read until `ok`, retries, and a reconnect after an I/O fault)
//! happens while holding a single async mutex, so job streaming and status polling can
//! never interleave their lines on the wire.

use croma_shared::config::SerialConfig;
use croma_shared::gcode_utils::{is_ack, Command};
use croma_shared::serial_interface::{SerialInterface, SerialLink, TransportError};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Response to one command, in the order the lines arrived. The last line is the
/// acknowledgement unless the command was sent without waiting.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub lines: Vec<String>,
    pub elapsed: Duration,
    pub attempts: u32,
}

impl CommandResponse {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

pub type CommandOutcome = Result<CommandResponse, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendOptions {
    pub wait_for_ack: bool,
    /// Per-attempt budget; the command class decides when unset.
    pub timeout: Option<Duration>,
    pub retries: u32,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            wait_for_ack: true,
            timeout: None,
            retries: 0,
        }
    }
}

impl SendOptions {
    pub fn retries(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.wait_for_ack = false;
        self
    }
}

enum AttemptError {
    NoAck,
    Io(io::Error),
}

impl From<io::Error> for AttemptError {
    fn from(e: io::Error) -> Self {
        AttemptError::Io(e)
    }
}

pub struct SerialTransport {
    driver: Arc<dyn SerialInterface>,
    settings: SerialConfig,
    link: Mutex<Option<Box<dyn SerialLink>>>,
    open: AtomicBool,
}

impl SerialTransport {
    pub fn new(driver: Arc<dyn SerialInterface>, settings: SerialConfig) -> Self {
        Self {
            driver,
            settings,
            link: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    /// Liveness as last observed; does no I/O.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }
        *link = Some(self.open_link().await?);
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if link.take().is_some() {
            tracing::info!(port = %self.settings.port, "Serial link closed");
        }
        self.open.store(false, Ordering::Release);
    }

    async fn open_link(&self) -> Result<Box<dyn SerialLink>, TransportError> {
        let port = self.settings.port.as_str();
        if !self.driver.port_exists(port) {
            let candidates = self.driver.available_ports();
            tracing::warn!(port, ?candidates, "Serial port not found");
            return Err(TransportError::LinkUnavailable { port: port.to_string() });
        }
        tracing::info!(port, baud = self.settings.baud, "Opening serial link");
        let mut link = self.driver.open(port, self.settings.baud).await.inspect_err(|e| {
            tracing::warn!(port, error = %e, "Failed to open serial port");
        })?;
        // Most boards reset when the port opens and print a banner while booting.
        tokio::time::sleep(self.settings.settle()).await;
        link.discard_input().await.map_err(|e| TransportError::LinkError(e.to_string()))?;

        if self.settings.probe_on_connect {
            let probe = Command::new("M115");
            match self.exchange(link.as_mut(), &probe, true, self.settings.probe_timeout()).await {
                Ok(lines) => {
                    tracing::info!(port, firmware = lines.first().map(String::as_str).unwrap_or(""), "Printer answered probe");
                }
                Err(AttemptError::NoAck) => {
                    tracing::warn!(port, "Printer did not answer M115 probe, continuing");
                }
                Err(AttemptError::Io(e)) => return Err(TransportError::LinkError(e.to_string())),
            }
        }
        tracing::info!(port, "Serial link ready");
        Ok(link)
    }

    /// One write plus, when asked, reads until an acknowledgement or the deadline.
    async fn exchange(
        &self,
        link: &mut dyn SerialLink,
        command: &Command,
        wait_for_ack: bool,
        timeout: Duration,
    ) -> Result<Vec<String>, AttemptError> {
        // Motion commands skip the flush to keep the planner fed.
        if !command.class().is_motion() {
            link.discard_input().await?;
        }
        tracing::trace!(command = %command, "TX");
        link.write_line(&command.wire_line()).await?;
        if !wait_for_ack {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, link.read_line()).await {
                Err(_) => {
                    tracing::debug!(command = %command, received = ?lines, "No acknowledgement before deadline");
                    return Err(AttemptError::NoAck);
                }
                Ok(Err(e)) => return Err(AttemptError::Io(e)),
                Ok(Ok(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::trace!(line, "RX");
                    let acked = is_ack(line);
                    lines.push(line.to_string());
                    if acked {
                        return Ok(lines);
                    }
                }
            }
        }
    }

    /// Sends one command and waits for its acknowledgement, holding the link for the
    /// whole exchange including retries. A closed link is reopened first.
    pub async fn send(&self, command: &str, options: SendOptions) -> CommandOutcome {
        let command = Command::new(command);
        let timeout = options
            .timeout
            .unwrap_or_else(|| command.class().timeout(self.settings.default_timeout()));
        let started = Instant::now();

        let mut guard = self.link.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_link().await?);
            self.open.store(true, Ordering::Release);
        }

        let mut attempts = 0;
        let mut reconnected = false;
        loop {
            let Some(link) = guard.as_mut() else {
                return Err(TransportError::LinkError("serial link closed".to_string()));
            };
            attempts += 1;
            match self.exchange(link.as_mut(), &command, options.wait_for_ack, timeout).await {
                Ok(lines) => {
                    let elapsed = started.elapsed();
                    tracing::debug!(command = %command, attempt = attempts, elapsed_ms = elapsed.as_millis() as u64, "Command acknowledged");
                    return Ok(CommandResponse { lines, elapsed, attempts });
                }
                Err(AttemptError::NoAck) if attempts > options.retries => {
                    let elapsed = started.elapsed();
                    tracing::warn!(command = %command, attempts, elapsed_ms = elapsed.as_millis() as u64, "Command timed out");
                    return Err(TransportError::Timeout {
                        command: command.text().to_string(),
                        attempts,
                        elapsed,
                    });
                }
                Err(AttemptError::NoAck) => {
                    tracing::debug!(command = %command, attempt = attempts, "Retrying unacknowledged command");
                    tokio::time::sleep(self.settings.retry_backoff() * attempts).await;
                }
                Err(AttemptError::Io(e)) => {
                    *guard = None;
                    self.open.store(false, Ordering::Release);
                    tracing::warn!(command = %command, error = %e, "Serial I/O fault");
                    if reconnected {
                        return Err(TransportError::LinkError(e.to_string()));
                    }
                    reconnected = true;
                    // The reconnect does not use up a retry.
                    attempts -= 1;
                    match self.open_link().await {
                        Ok(link) => {
                            *guard = Some(link);
                            self.open.store(true, Ordering::Release);
                        }
                        Err(reopen) => {
                            tracing::error!(error = %reopen, "Reconnect after I/O fault failed");
                            return Err(TransportError::LinkError(format!("{e}; reconnect failed: {reopen}")));
                        }
                    }
                }
            }
        }
    }
}
