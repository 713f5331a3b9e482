//! A [`HostSurface`] backed by the terminal.

use std::collections::BTreeSet;
use std::io::IsTerminal;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use mqhost_core::{Error, HostSurface, Result};

use crate::colors;

/// Prints host output to stdout and loops commands back to the input queue.
pub struct ConsoleHost {
    ansi: bool,
    commands: Mutex<BTreeSet<String>>,
    loopback: mpsc::UnboundedSender<String>,
}

impl ConsoleHost {
    /// Returns the host and the receiver for commands it was asked to execute.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (loopback, receiver) = mpsc::unbounded_channel();
        let host = Self {
            ansi: std::io::stdout().is_terminal(),
            commands: Mutex::new(BTreeSet::new()),
            loopback,
        };
        (host, receiver)
    }

    /// Commands currently registered with the console, sorted.
    pub fn registered(&self) -> Vec<String> {
        self.commands.lock().iter().cloned().collect()
    }
}

impl HostSurface for ConsoleHost {
    fn send_command(&self, command: &str) {
        if self.loopback.send(command.to_string()).is_err() {
            tracing::warn!("Console input closed; dropped command {}", command);
        }
    }

    fn write_line(&self, text: &str) {
        println!("{}", colors::render(text, self.ansi));
    }

    fn parse_variables(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    fn evaluate_expression(&self, formula: &str) -> Result<f64> {
        formula
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::Host(format!("cannot evaluate '{}' in the console", formula)))
    }

    fn add_command(&self, name: &str) -> Result<()> {
        if !self.commands.lock().insert(name.to_string()) {
            return Err(Error::Host(format!("{} is already registered", name)));
        }
        Ok(())
    }

    fn remove_command(&self, name: &str) -> Result<()> {
        self.commands.lock().remove(name);
        Ok(())
    }
}

/// Split a typed line into command name and raw arguments.
///
/// Returns `None` for lines that are not commands.
pub fn split_command_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }
    match line.split_once(' ') {
        Some((name, rest)) => Some((name, rest.trim_start())),
        None => Some((line, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_line() {
        assert_eq!(split_command_line("/netrun Foo a b"), Some(("/netrun", "Foo a b")));
        assert_eq!(split_command_line("  /netlist  "), Some(("/netlist", "")));
        assert_eq!(split_command_line("hello there"), None);
    }

    #[test]
    fn test_send_command_loops_back() {
        let (host, mut receiver) = ConsoleHost::new();
        host.send_command("/netlist");
        assert_eq!(receiver.try_recv().unwrap(), "/netlist");
    }

    #[test]
    fn test_command_table() {
        let (host, _receiver) = ConsoleHost::new();
        host.add_command("/b").unwrap();
        host.add_command("/a").unwrap();
        assert!(host.add_command("/a").is_err());
        assert_eq!(host.registered(), vec!["/a", "/b"]);

        host.remove_command("/a").unwrap();
        assert_eq!(host.registered(), vec!["/b"]);
    }

    #[test]
    fn test_evaluate_numbers_only() {
        let (host, _receiver) = ConsoleHost::new();
        assert_eq!(host.evaluate_expression(" 2.5 ").unwrap(), 2.5);
        assert!(host.evaluate_expression("${Me.Level}").is_err());
    }
}
