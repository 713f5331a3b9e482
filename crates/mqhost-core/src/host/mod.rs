//! The host's call surface.
//!
//! Everything behind [`HostSurface`] must be called from inside the execution
//! context: the host is single-threaded and not reentrant from other threads.
//! Components hold a [`HostHandle`], which sanitizes output and provides the
//! prefixed message helpers used for user-facing diagnostics.

pub mod native;

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Longest line the host accepts in one write.
pub const MAX_LINE_CHARS: usize = 2047;

/// Calls the runtime makes into the host.
pub trait HostSurface: Send + Sync {
    /// Execute a command line as if typed by the user.
    fn send_command(&self, command: &str);

    /// Write a line to the host's output window. Input is already sanitized.
    fn write_line(&self, text: &str);

    /// Expand the host's variable syntax in `text`.
    fn parse_variables(&self, text: &str) -> Result<String>;

    /// Evaluate a numeric expression.
    fn evaluate_expression(&self, formula: &str) -> Result<f64>;

    /// Register `name` with the host's command table.
    fn add_command(&self, name: &str) -> Result<()>;

    /// Remove `name` from the host's command table.
    fn remove_command(&self, name: &str) -> Result<()>;
}

/// Truncate `text` to what the host can display safely.
///
/// Cuts at [`MAX_LINE_CHARS`] characters, then at the first line break if it
/// is not the very first character.
pub fn sanitize_line(text: &str) -> &str {
    let truncated = match text.char_indices().nth(MAX_LINE_CHARS) {
        Some((index, _)) => &text[..index],
        None => text,
    };

    match truncated.find(['\r', '\n']) {
        Some(index) if index > 0 => &truncated[..index],
        _ => truncated,
    }
}

/// Origin of a user-facing diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    /// The runtime itself.
    General,
    /// The plugin entry points.
    Plugin,
    /// A submodule program.
    Program,
}

impl MessageSource {
    fn tag(self) -> &'static str {
        match self {
            Self::General => "[MQHost]",
            Self::Plugin => "[MQHost Plugin]",
            Self::Program => "[MQHost Program]",
        }
    }
}

/// Severity of a user-facing diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Format a diagnostic line with the host's color codes.
pub fn format_message(source: MessageSource, severity: Severity, text: &str) -> String {
    match severity {
        Severity::Info => format!("\\ag{} \\aw{}", source.tag(), text),
        Severity::Warning => format!("\\ag{} \\ayWarning: \\aw{}", source.tag(), text),
        Severity::Error => format!("\\ag{} \\arError: \\aw{}", source.tag(), text),
    }
}

/// Shared handle to the host surface.
#[derive(Clone)]
pub struct HostHandle {
    surface: Arc<dyn HostSurface>,
}

impl HostHandle {
    pub fn new(surface: Arc<dyn HostSurface>) -> Self {
        Self { surface }
    }

    /// Write a sanitized line.
    pub fn write_line(&self, text: &str) {
        self.surface.write_line(sanitize_line(text));
    }

    /// Write a prefixed informational line.
    pub fn info(&self, source: MessageSource, text: &str) {
        self.write_line(&format_message(source, Severity::Info, text));
    }

    /// Write a prefixed warning line.
    pub fn warning(&self, source: MessageSource, text: &str) {
        self.write_line(&format_message(source, Severity::Warning, text));
    }

    /// Write a prefixed error line.
    pub fn error(&self, source: MessageSource, text: &str) {
        self.write_line(&format_message(source, Severity::Error, text));
    }

    pub fn send_command(&self, command: &str) {
        self.surface.send_command(command);
    }

    pub fn parse_variables(&self, text: &str) -> Result<String> {
        self.surface.parse_variables(text)
    }

    /// Evaluate `formula`, expanding variables first when `parse` is set.
    pub fn evaluate_expression(&self, formula: &str, parse: bool) -> Result<f64> {
        if parse {
            let parsed = self.surface.parse_variables(formula)?;
            self.surface.evaluate_expression(&parsed)
        } else {
            self.surface.evaluate_expression(formula)
        }
    }

    /// Evaluate `formula` as a condition: any non-zero value is true.
    pub fn condition(&self, formula: &str, parse: bool) -> Result<bool> {
        Ok(self.evaluate_expression(formula, parse)? != 0.0)
    }

    pub(crate) fn add_command(&self, name: &str) -> Result<()> {
        self.surface.add_command(name)
    }

    pub(crate) fn remove_command(&self, name: &str) -> Result<()> {
        self.surface.remove_command(name)
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle").finish_non_exhaustive()
    }
}

impl From<Arc<dyn HostSurface>> for HostHandle {
    fn from(surface: Arc<dyn HostSurface>) -> Self {
        Self::new(surface)
    }
}

/// Host surface that records every call, for tests and the console host's dry runs.
#[derive(Debug, Default)]
pub struct RecordingHost {
    lines: parking_lot::Mutex<Vec<String>>,
    commands_sent: parking_lot::Mutex<Vec<String>>,
    registered: parking_lot::Mutex<Vec<String>>,
    fail_remove: parking_lot::Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any written line contains `needle`.
    pub fn saw(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }

    pub fn clear_lines(&self) {
        self.lines.lock().clear();
    }

    /// Commands passed to `send_command`.
    pub fn commands_sent(&self) -> Vec<String> {
        self.commands_sent.lock().clone()
    }

    /// Command names currently registered with this host.
    pub fn registered_commands(&self) -> Vec<String> {
        self.registered.lock().clone()
    }

    /// Make `remove_command(name)` fail.
    pub fn fail_remove_of(&self, name: &str) {
        self.fail_remove.lock().push(name.to_string());
    }
}

impl HostSurface for RecordingHost {
    fn send_command(&self, command: &str) {
        self.commands_sent.lock().push(command.to_string());
    }

    fn write_line(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }

    fn parse_variables(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    fn evaluate_expression(&self, formula: &str) -> Result<f64> {
        formula
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::Host(format!("could not evaluate: {}", formula)))
    }

    fn add_command(&self, name: &str) -> Result<()> {
        self.registered.lock().push(name.to_string());
        Ok(())
    }

    fn remove_command(&self, name: &str) -> Result<()> {
        if self.fail_remove.lock().iter().any(|n| n == name) {
            return Err(Error::Host(format!("refused to remove {}", name)));
        }
        self.registered.lock().retain(|n| n != name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_truncates_long_lines() {
        let long = "x".repeat(3000);
        assert_eq!(sanitize_line(&long).chars().count(), MAX_LINE_CHARS);
    }

    #[test]
    fn test_sanitize_cuts_at_line_break() {
        assert_eq!(sanitize_line("first\nsecond"), "first");
        assert_eq!(sanitize_line("first\r\nsecond"), "first");
        // A break at position zero is kept.
        assert_eq!(sanitize_line("\nleading"), "\nleading");
        assert_eq!(sanitize_line(""), "");
    }

    #[test]
    fn test_sanitize_counts_characters_not_bytes() {
        let text = "é".repeat(2100);
        let sanitized = sanitize_line(&text);
        assert_eq!(sanitized.chars().count(), MAX_LINE_CHARS);
    }

    #[test]
    fn test_format_message() {
        assert_eq!(
            format_message(MessageSource::General, Severity::Error, "boom"),
            "\\ag[MQHost] \\arError: \\awboom"
        );
        assert_eq!(
            format_message(MessageSource::Program, Severity::Warning, "careful"),
            "\\ag[MQHost Program] \\ayWarning: \\awcareful"
        );
        assert_eq!(
            format_message(MessageSource::Plugin, Severity::Info, "hello"),
            "\\ag[MQHost Plugin] \\awhello"
        );
    }

    #[test]
    fn test_handle_sanitizes_and_evaluates() {
        let host = RecordingHost::new();
        let handle = HostHandle::new(host.clone());

        handle.write_line("one\ntwo");
        assert_eq!(host.lines(), vec!["one".to_string()]);

        assert_eq!(handle.evaluate_expression("2.5", true).unwrap(), 2.5);
        assert!(handle.condition("1", false).unwrap());
        assert!(!handle.condition("0", false).unwrap());
        assert!(handle.evaluate_expression("nope", false).is_err());
    }
}
