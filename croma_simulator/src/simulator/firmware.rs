//! Reply model of a Marlin-like firmware.

use croma_shared::gcode_utils::split_code;

#[derive(Debug, Clone, Copy, Default)]
pub struct Heater {
    pub current: f64,
    pub target: f64,
}

impl Heater {
    fn ambient() -> Self {
        Self { current: 22.0, target: 0.0 }
    }
}

#[derive(Debug)]
pub struct FirmwareModel {
    pub nozzle: Heater,
    pub bed: Heater,
    /// Firmware-side SD print as `(done, total)` bytes.
    pub sd: Option<(u64, u64)>,
    pub sd_paused: bool,
    pub fan_on: bool,
    pub relative: bool,
    pub message: Option<String>,
}

impl Default for FirmwareModel {
    fn default() -> Self {
        Self {
            nozzle: Heater::ambient(),
            bed: Heater::ambient(),
            sd: None,
            sd_paused: false,
            fan_on: false,
            relative: false,
            message: None,
        }
    }
}

fn param(params: &str, letter: char) -> Option<f64> {
    params
        .split_whitespace()
        .find(|w| w.starts_with(letter) || w.starts_with(letter.to_ascii_lowercase()))
        .and_then(|w| w[1..].parse().ok())
}

impl FirmwareModel {
    /// Lines the firmware sends back for one command, ending with `ok`.
    pub fn respond(&mut self, command: &str) -> Vec<String> {
        let (code, params) = split_code(command);
        let mut lines = Vec::new();
        match code.as_str() {
            "M105" => {
                return vec![format!(
                    "ok T:{:.1} /{:.1} B:{:.1} /{:.1} @:0 B@:0",
                    self.nozzle.current, self.nozzle.target, self.bed.current, self.bed.target
                )];
            }
            "M115" => lines.push(
                "FIRMWARE_NAME:Marlin 2.1.2 (Croma virtual) PROTOCOL_VERSION:1.0 MACHINE_TYPE:Virtual EXTRUDER_COUNT:1"
                    .to_string(),
            ),
            "M27" => lines.push(match self.sd {
                Some((done, total)) => format!("SD printing byte {}/{}", done, total),
                None => "Not SD printing".to_string(),
            }),
            "M104" => self.nozzle.target = param(params, 'S').unwrap_or(0.0),
            "M140" => self.bed.target = param(params, 'S').unwrap_or(0.0),
            "M109" => {
                self.nozzle.target = param(params, 'S').unwrap_or(self.nozzle.target);
                self.nozzle.current = self.nozzle.target;
                lines.push(format!("T:{:.1} /{:.1} W:0", self.nozzle.current, self.nozzle.target));
            }
            "M190" => {
                self.bed.target = param(params, 'S').unwrap_or(self.bed.target);
                self.bed.current = self.bed.target;
                lines.push(format!("B:{:.1} /{:.1} W:0", self.bed.current, self.bed.target));
            }
            "M24" => self.sd_paused = false,
            "M25" => self.sd_paused = true,
            "M106" => self.fan_on = true,
            "M107" => self.fan_on = false,
            "G90" => self.relative = false,
            "G91" => self.relative = true,
            "M117" => self.message = Some(params.trim().to_string()),
            _ => {}
        }
        lines.push("ok".to_string());
        lines
    }
}
