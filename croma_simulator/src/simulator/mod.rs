pub mod firmware;

use async_trait::async_trait;
use croma_shared::serial_interface::{SerialInterface, SerialLink, TransportError};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use self::firmware::FirmwareModel;

pub const DEFAULT_PORT: &str = "/dev/ttyVIRTUAL0";

/// Connect-time failure the next `open` should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    Missing,
    PermissionDenied,
    Busy,
}

#[derive(Debug, Default)]
struct Faults {
    /// Commands starting with the prefix get a reply without `ok`, the given number of times.
    swallow: Vec<(String, u32)>,
    drop_probability: f64,
    unplugged: bool,
    open_failure: Option<OpenFailure>,
    latency: Duration,
}

#[derive(Debug)]
struct SimState {
    port: String,
    firmware: FirmwareModel,
    faults: Faults,
    inbox: VecDeque<String>,
    log: Vec<String>,
    /// Bumped on every open; links from an older generation are dead.
    generation: u64,
    opens: u32,
}

struct Shared {
    state: Mutex<SimState>,
    notify: Notify,
}

/// A virtual Marlin-style printer behind the serial driver traits.
///
/// Cloning yields another handle to the same printer, so tests keep one handle for
/// inspection and fault injection while the host owns another as its serial driver.
#[derive(Clone)]
pub struct VirtualPrinter {
    shared: Arc<Shared>,
}

impl Default for VirtualPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualPrinter {
    pub fn new() -> Self {
        Self::with_port(DEFAULT_PORT)
    }

    pub fn with_port(port: &str) -> Self {
        tracing::info!(port, "Virtual printer created");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    port: port.to_string(),
                    firmware: FirmwareModel::default(),
                    faults: Faults::default(),
                    inbox: VecDeque::new(),
                    log: Vec::new(),
                    generation: 0,
                    opens: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.shared)
    }

    /// Every command line received, in order, across all links.
    pub fn commands(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Number of received commands whose text starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state().log.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    pub fn open_count(&self) -> u32 {
        self.state().opens
    }

    pub fn swallow_ack(&self, prefix: &str, times: u32) {
        self.state().faults.swallow.push((prefix.to_string(), times));
    }

    /// Probability in `0.0..=1.0` that any `ok` is lost.
    pub fn set_drop_probability(&self, probability: f64) {
        self.state().faults.drop_probability = probability.clamp(0.0, 1.0);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().faults.latency = latency;
    }

    pub fn fail_next_open(&self, failure: Option<OpenFailure>) {
        self.state().faults.open_failure = failure;
    }

    /// Pulls the cable: open links fail and the port disappears until `replug`.
    pub fn unplug(&self) {
        self.state().faults.unplugged = true;
        self.shared.notify.notify_waiters();
        tracing::info!("Virtual printer unplugged");
    }

    pub fn replug(&self) {
        self.state().faults.unplugged = false;
    }

    pub fn set_temperatures(&self, nozzle: (f64, f64), bed: (f64, f64)) {
        let mut state = self.state();
        state.firmware.nozzle.current = nozzle.0;
        state.firmware.nozzle.target = nozzle.1;
        state.firmware.bed.current = bed.0;
        state.firmware.bed.target = bed.1;
    }

    pub fn nozzle_target(&self) -> f64 {
        self.state().firmware.nozzle.target
    }

    /// Starts a firmware-side SD print of `total` bytes at offset `done`.
    pub fn set_sd_progress(&self, done: u64, total: u64) {
        self.state().firmware.sd = Some((done, total));
    }

    pub fn sd_paused(&self) -> bool {
        self.state().firmware.sd_paused
    }

    /// Queues an unsolicited line, as firmware does for `echo:` or `busy:` chatter.
    pub fn push_unsolicited(&self, line: &str) {
        self.state().inbox.push_back(line.to_string());
        self.shared.notify.notify_waiters();
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, SimState> {
    // A panic while holding the lock cannot leave the model half-updated in a way tests care about.
    shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SerialInterface for VirtualPrinter {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        let mut state = self.state();
        if let Some(failure) = state.faults.open_failure.take() {
            let port = port.to_string();
            return Err(match failure {
                OpenFailure::Missing => TransportError::LinkUnavailable { port },
                OpenFailure::PermissionDenied => TransportError::PermissionDenied { port },
                OpenFailure::Busy => TransportError::LinkBusy { port },
            });
        }
        if state.faults.unplugged || port != state.port {
            return Err(TransportError::LinkUnavailable { port: port.to_string() });
        }
        state.generation += 1;
        state.opens += 1;
        state.inbox.clear();
        // Marlin greets after the USB reset.
        state.inbox.push_back("start".to_string());
        tracing::debug!(port, baud, generation = state.generation, "Virtual link opened");
        Ok(Box::new(VirtualLink {
            shared: Arc::clone(&self.shared),
            generation: state.generation,
        }))
    }

    fn port_exists(&self, port: &str) -> bool {
        let state = self.state();
        !state.faults.unplugged && port == state.port
    }

    fn available_ports(&self) -> Vec<String> {
        let state = self.state();
        if state.faults.unplugged {
            Vec::new()
        } else {
            vec![state.port.clone()]
        }
    }
}

struct VirtualLink {
    shared: Arc<Shared>,
    generation: u64,
}

impl VirtualLink {
    fn check_alive(&self, state: &SimState) -> io::Result<()> {
        if state.faults.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        if state.generation != self.generation {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link superseded by a newer open"));
        }
        Ok(())
    }
}

#[async_trait]
impl SerialLink for VirtualLink {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let latency = {
            let state = lock(&self.shared);
            self.check_alive(&state)?;
            state.faults.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = lock(&self.shared);
        self.check_alive(&state)?;
        let command = line.trim_end_matches(['\r', '\n']).to_string();
        state.log.push(command.clone());

        let mut replies = state.firmware.respond(&command);
        let swallowed = state
            .faults
            .swallow
            .iter_mut()
            .find(|(prefix, remaining)| *remaining > 0 && command.starts_with(prefix.as_str()))
            .map(|(_, remaining)| *remaining -= 1)
            .is_some();
        let dropped = state.faults.drop_probability > 0.0
            && rand::random::<f64>() < state.faults.drop_probability;
        if swallowed || dropped {
            tracing::debug!(command, swallowed, dropped, "Virtual printer withholding ok");
            replies.retain(|l| !l.starts_with("ok"));
            replies.push("echo:busy: processing".to_string());
        }
        state.inbox.extend(replies);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = lock(&self.shared);
                if let Err(e) = self.check_alive(&state) {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, e));
                }
                if let Some(line) = state.inbox.pop_front() {
                    return Ok(line);
                }
            }
            notified.await;
        }
    }

    async fn discard_input(&mut self) -> io::Result<()> {
        let mut state = lock(&self.shared);
        self.check_alive(&state)?;
        state.inbox.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(printer: &VirtualPrinter) -> Box<dyn SerialLink> {
        let mut link = printer.open(DEFAULT_PORT, 115200).await.unwrap();
        link.discard_input().await.unwrap();
        link
    }

    #[tokio::test]
    async fn answers_temperature_query() {
        let printer = VirtualPrinter::new();
        printer.set_temperatures((205.3, 210.0), (59.8, 60.0));
        let mut link = open(&printer).await;
        link.write_line("M105\n").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "ok T:205.3 /210.0 B:59.8 /60.0 @:0 B@:0");
        assert_eq!(printer.commands(), vec!["M105".to_string()]);
    }

    #[tokio::test]
    async fn swallowed_ack_only_affects_matching_commands() {
        let printer = VirtualPrinter::new();
        printer.swallow_ack("G28", 1);
        let mut link = open(&printer).await;
        link.write_line("G28\n").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "echo:busy: processing");
        link.write_line("G28\n").await.unwrap();
        assert_eq!(link.read_line().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn open_failures_are_reported_once() {
        let printer = VirtualPrinter::new();
        printer.fail_next_open(Some(OpenFailure::Busy));
        let err = printer.open(DEFAULT_PORT, 115200).await.err().unwrap();
        assert!(matches!(err, TransportError::LinkBusy { .. }));
        assert!(printer.open(DEFAULT_PORT, 115200).await.is_ok());
        let err = printer.open("/dev/nope", 115200).await.err().unwrap();
        assert!(matches!(err, TransportError::LinkUnavailable { .. }));
    }

    #[tokio::test]
    async fn unplug_breaks_open_links() {
        let printer = VirtualPrinter::new();
        let mut link = open(&printer).await;
        printer.unplug();
        assert!(link.write_line("M105\n").await.is_err());
        assert!(link.read_line().await.is_err());
        assert!(!printer.port_exists(DEFAULT_PORT));
    }

    #[tokio::test]
    async fn reopening_supersedes_old_link() {
        let printer = VirtualPrinter::new();
        let mut old = open(&printer).await;
        let _new = open(&printer).await;
        assert!(old.write_line("M105\n").await.is_err());
        assert_eq!(printer.open_count(), 2);
    }
}
