//! Output sinks.
//!
//! The pipeline never writes to stdout/stderr directly. Every step and every
//! deferred result writes through the [`Console`] held by the invocation
//! context, which makes the whole pipeline testable without a terminal.
//!
//! - [`TermConsole`]: the real process streams, with color detection.
//! - [`BufferConsole`]: in-memory buffers that stay readable after the
//!   invocation consumed the console.

use std::io::{self, Write};
use std::sync::Arc;

use console::Style;
use parking_lot::Mutex;

/// A pair of output streams plus a color capability.
pub trait Console: Send {
    /// The normal output stream.
    fn out(&mut self) -> &mut dyn Write;

    /// The error output stream.
    fn err(&mut self) -> &mut dyn Write;

    /// Whether styled (ANSI) output should be produced.
    fn supports_color(&self) -> bool;
}

/// Writes `text` followed by a newline to the error stream, in red when the
/// console supports color. Styling is reset after the text.
pub fn write_error_line(console: &mut dyn Console, text: &str) -> io::Result<()> {
    let style = Style::new().red().force_styling(console.supports_color());
    writeln!(console.err(), "{}", style.apply_to(text))
}

/// The process's standard streams.
pub struct TermConsole {
    out: io::Stdout,
    err: io::Stderr,
    color: bool,
}

impl TermConsole {
    /// Creates a console over stdout/stderr, detecting color support on stderr.
    pub fn new() -> Self {
        Self {
            out: io::stdout(),
            err: io::stderr(),
            color: console::colors_enabled_stderr(),
        }
    }

    /// Overrides color detection.
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }
}

impl Default for TermConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for TermConsole {
    fn out(&mut self) -> &mut dyn Write {
        &mut self.out
    }

    fn err(&mut self) -> &mut dyn Write {
        &mut self.err
    }

    fn supports_color(&self) -> bool {
        self.color
    }
}

/// A cloneable in-memory buffer.
///
/// Clones share the same storage, so a test can keep one handle while the
/// pipeline owns another.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the buffer contents as (lossy) UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A console backed by two [`SharedBuffer`]s. Color is off unless requested.
#[derive(Debug, Clone, Default)]
pub struct BufferConsole {
    out: SharedBuffer,
    err: SharedBuffer,
    color: bool,
}

impl BufferConsole {
    /// Creates an empty, colorless buffer console.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables styled output.
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Everything written to the normal stream.
    pub fn out_text(&self) -> String {
        self.out.contents()
    }

    /// Everything written to the error stream.
    pub fn err_text(&self) -> String {
        self.err.contents()
    }
}

impl Console for BufferConsole {
    fn out(&mut self) -> &mut dyn Write {
        &mut self.out
    }

    fn err(&mut self) -> &mut dyn Write {
        &mut self.err
    }

    fn supports_color(&self) -> bool {
        self.color
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_console_clones_share_storage() {
        let console = BufferConsole::new();
        let mut owned: Box<dyn Console> = Box::new(console.clone());

        writeln!(owned.out(), "hello").unwrap();
        writeln!(owned.err(), "oops").unwrap();

        assert_eq!(console.out_text(), "hello\n");
        assert_eq!(console.err_text(), "oops\n");
    }

    #[test]
    fn test_write_error_line_plain() {
        let console = BufferConsole::new();
        let mut owned = console.clone();
        write_error_line(&mut owned, "bad input").unwrap();
        assert_eq!(console.err_text(), "bad input\n");
        assert!(console.out_text().is_empty());
    }

    #[test]
    fn test_write_error_line_colored_resets() {
        let console = BufferConsole::new().with_color(true);
        let mut owned = console.clone();
        write_error_line(&mut owned, "bad input").unwrap();
        let text = console.err_text();
        assert!(text.starts_with("\u{1b}[31m"));
        assert!(text.contains("bad input"));
        assert!(text.trim_end().ends_with("\u{1b}[0m"));
    }
}
