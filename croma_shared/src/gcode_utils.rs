//! G-code line handling shared by the host and the simulator: comment stripping,
//! command classification and acknowledgement detection.

use std::fmt;
use std::time::Duration;

/// What a command does, as far as timing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Homing,
    BedLeveling,
    HeatAndWait,
    ToolChange,
    Move { extrude: bool },
    Other,
}

impl CommandClass {
    pub fn of(line: &str) -> Self {
        let (code, params) = split_code(line);
        match code.as_str() {
            "G28" => CommandClass::Homing,
            "G29" => CommandClass::BedLeveling,
            "M109" | "M190" => CommandClass::HeatAndWait,
            "G0" | "G1" => CommandClass::Move {
                extrude: params.chars().any(|c| c.eq_ignore_ascii_case(&'E')),
            },
            c if c.len() > 1 && c.starts_with('T') => CommandClass::ToolChange,
            _ => CommandClass::Other,
        }
    }

    /// Acknowledgement budget for one attempt. `fallback` applies to unclassified commands.
    pub fn timeout(&self, fallback: Duration) -> Duration {
        match self {
            CommandClass::Homing => Duration::from_secs(60),
            CommandClass::BedLeveling => Duration::from_secs(120),
            CommandClass::HeatAndWait => Duration::from_secs(300),
            CommandClass::ToolChange => Duration::from_secs(10),
            CommandClass::Move { extrude: true } => Duration::from_secs(5),
            CommandClass::Move { extrude: false } => Duration::from_secs(3),
            CommandClass::Other => fallback,
        }
    }

    pub fn is_motion(&self) -> bool {
        matches!(self, CommandClass::Move { .. })
    }
}

/// Splits a line into its normalized command code (`G1`, `M109`, `T0`) and the parameter
/// text that follows. A leading `N<digits>` line number is skipped.
pub fn split_code(line: &str) -> (String, &str) {
    let mut rest = line.trim_start();
    if let Some(after) = rest.strip_prefix(['N', 'n']) {
        let digits = after.len() - after.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits > 0 {
            rest = after[digits..].trim_start();
        }
    }
    let mut chars = rest.char_indices();
    let Some((_, letter)) = chars.next() else {
        return (String::new(), "");
    };
    if !letter.is_ascii_alphabetic() {
        return (String::new(), rest);
    }
    let end = chars
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    let number = rest[1..end].trim_start_matches('0');
    let number = if number.is_empty() && end > 1 { "0" } else { number };
    let code = format!("{}{}", letter.to_ascii_uppercase(), number);
    (code, &rest[end..])
}

/// A single G-code line ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    text: String,
    class: CommandClass,
}

impl Command {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let text = raw.as_ref().trim_end_matches(['\r', '\n']).trim().to_string();
        let class = CommandClass::of(&text);
        Self { text, class }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn class(&self) -> CommandClass {
        self.class
    }

    /// The command with exactly one `\n` terminator.
    pub fn wire_line(&self) -> String {
        format!("{}\n", self.text)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Removes everything from the first `;` and surrounding whitespace.
pub fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => line[..idx].trim(),
        None => line.trim(),
    }
}

/// A response line acknowledges when one of its words is `ok`, in any case, optionally
/// followed by punctuation or telemetry (`ok`, `OK`, `ok:0`, `ok T:200.0 /200.0`).
pub fn is_ack(line: &str) -> bool {
    line.split_whitespace().any(|word| {
        let lower = word.to_ascii_lowercase();
        match lower.strip_prefix("ok") {
            Some(rest) => rest.chars().next().is_none_or(|c| !c.is_ascii_alphanumeric()),
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_command_code() {
        assert_eq!(CommandClass::of("G28"), CommandClass::Homing);
        assert_eq!(CommandClass::of("G28 X Y"), CommandClass::Homing);
        assert_eq!(CommandClass::of("G29"), CommandClass::BedLeveling);
        assert_eq!(CommandClass::of("M109 S210"), CommandClass::HeatAndWait);
        assert_eq!(CommandClass::of("m190 s60"), CommandClass::HeatAndWait);
        assert_eq!(CommandClass::of("T1"), CommandClass::ToolChange);
        assert_eq!(CommandClass::of("G1 X10 Y10 E0.4"), CommandClass::Move { extrude: true });
        assert_eq!(CommandClass::of("G0 X10"), CommandClass::Move { extrude: false });
        assert_eq!(CommandClass::of("G01 X1"), CommandClass::Move { extrude: false });
        assert_eq!(CommandClass::of("M104 S200"), CommandClass::Other);
        assert_eq!(CommandClass::of("G280"), CommandClass::Other);
        assert_eq!(CommandClass::of(""), CommandClass::Other);
    }

    #[test]
    fn split_code_normalizes_leading_zeros() {
        assert_eq!(split_code("g01 X1").0, "G1");
        assert_eq!(split_code("M104 S200"), ("M104".to_string(), " S200"));
        assert_eq!(split_code("G1X5E1").1, "X5E1");
    }

    #[test]
    fn line_numbers_are_ignored() {
        assert_eq!(CommandClass::of("N12 G28*35"), CommandClass::Homing);
        assert_eq!(CommandClass::of("N3 M109 S200"), CommandClass::HeatAndWait);
    }

    #[test]
    fn timeouts_follow_class() {
        let fallback = Duration::from_secs(5);
        assert_eq!(CommandClass::Homing.timeout(fallback), Duration::from_secs(60));
        assert_eq!(CommandClass::BedLeveling.timeout(fallback), Duration::from_secs(120));
        assert_eq!(CommandClass::HeatAndWait.timeout(fallback), Duration::from_secs(300));
        assert_eq!(CommandClass::ToolChange.timeout(fallback), Duration::from_secs(10));
        assert_eq!(CommandClass::Move { extrude: false }.timeout(fallback), Duration::from_secs(3));
        assert_eq!(CommandClass::Other.timeout(Duration::from_secs(4)), Duration::from_secs(4));
    }

    #[test]
    fn command_normalizes_terminator() {
        let cmd = Command::new("G1 X5\r\n");
        assert_eq!(cmd.text(), "G1 X5");
        assert_eq!(cmd.wire_line(), "G1 X5\n");
        assert!(cmd.class().is_motion());
    }

    #[test]
    fn strips_comments() {
        assert_eq!(strip_comment("G1 X1 ; move"), "G1 X1");
        assert_eq!(strip_comment("; only a comment"), "");
        assert_eq!(strip_comment("   "), "");
        assert_eq!(strip_comment("M117 hi;there;again"), "M117 hi");
    }

    #[test]
    fn ack_detection() {
        assert!(is_ack("ok"));
        assert!(is_ack("OK"));
        assert!(is_ack("ok T:205.3 /210.0 B:59.8 /60.0"));
        assert!(is_ack("ok:0"));
        assert!(is_ack("echo:busy ok"));
        assert!(!is_ack("broken"));
        assert!(!is_ack("okay"));
        assert!(!is_ack("T:205.3 /210.0"));
        assert!(!is_ack(""));
    }
}
