//! Terminal output for the CLI.
//!
//! Spinner and progress rendering only happen when stderr is a TTY;
//! otherwise messages degrade to plain lines so logs stay readable.

use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colored::Colorize;

use crate::model::Dev;

const SPINNER_FRAMES: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
const SPINNER_INTERVAL: Duration = Duration::from_millis(100);

/// A terminal spinner with an updatable message.
pub struct Spinner {
    message: Arc<Mutex<String>>,
    running: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Spinner {
    /// Creates a stopped spinner.
    #[must_use]
    pub fn new(message: &str) -> Self {
        Self {
            message: Arc::new(Mutex::new(message.to_string())),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Starts rendering. Off-terminal, the message is printed once.
    pub fn start(&mut self) {
        if !std::io::stderr().is_terminal() {
            if let Ok(message) = self.message.lock() {
                eprintln!("{message}");
            }
            return;
        }

        self.running.store(true, Ordering::Relaxed);
        let message = Arc::clone(&self.message);
        let running = Arc::clone(&self.running);

        self.handle = Some(tokio::spawn(async move {
            let mut frame = 0;
            while running.load(Ordering::Relaxed) {
                if let Ok(message) = message.lock() {
                    eprint!("\r\x1b[K{} {message}", SPINNER_FRAMES[frame].to_string().cyan());
                    let _ = std::io::stderr().flush();
                }
                frame = (frame + 1) % SPINNER_FRAMES.len();
                tokio::time::sleep(SPINNER_INTERVAL).await;
            }
        }));
    }

    /// Replaces the spinner message.
    pub fn update(&self, message: &str) {
        if let Ok(mut current) = self.message.lock() {
            message.clone_into(&mut current);
        }
    }

    /// Stops rendering and clears the spinner line.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.running.store(false, Ordering::Relaxed);
            handle.abort();
            eprint!("\r\x1b[K");
            let _ = std::io::stderr().flush();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Renders the synchronization progress bar. `completion` is a
/// percentage and `scaling` shrinks the bar to fit next to the message.
#[must_use]
pub fn render_progress_bar(postfix: &str, completion: f64, scaling: f64) -> String {
    let completion = completion.clamp(0.0, 100.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let width = (100.0 * scaling) as usize;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let filled = (completion / 100.0 * width as f64) as usize;

    let bar: String = (0..width)
        .map(|i| {
            if i < filled {
                '='
            } else if i == filled {
                '>'
            } else {
                ' '
            }
        })
        .collect();

    format!("[{bar}] {completion:3.0}% {postfix}")
}

/// Prints a green success message.
pub fn success(message: &str) {
    eprintln!(" {} {message}", "✓".green());
}

/// Prints a yellow warning.
pub fn warning(message: &str) {
    eprintln!("{}", message.yellow());
}

/// Prints a red error message.
pub fn error(message: &str) {
    eprintln!(" {} {message}", "✗".red());
}

/// Prints an actionable user error: the message in red, the hint in
/// blue.
pub fn user_error(message: &str, hint: &str) {
    eprintln!(" {} {}", "✗".red(), message.red());
    for line in hint.lines() {
        eprintln!("    {}", line.blue());
    }
}

/// Prints the environment banner shown once files are synchronized.
pub fn display_context(message: &str, dev: &Dev) {
    success(message);
    eprintln!("    {} {}", "Namespace:".blue(), dev.namespace);
    eprintln!("    {}      {}", "Name:".blue(), dev.name);
    if let Some(first) = dev.forward.first() {
        eprintln!("    {}   {first}", "Forward:".blue());
        for forward in dev.forward.iter().skip(1) {
            eprintln!("               {forward}");
        }
    }
    eprintln!();
}

/// Asks a yes/no question on the terminal.
pub fn ask_yes_no(prompt: &str) -> bool {
    eprint!("{prompt}");
    let _ = std::io::stderr().flush();

    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case("y")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_bar_bounds() {
        let empty = render_progress_bar("syncing", 0.0, 0.3);
        assert!(empty.starts_with("[>"));
        assert!(empty.contains("0%"));

        let full = render_progress_bar("syncing", 100.0, 0.3);
        assert!(full.contains("==="));
        assert!(full.contains("100%"));

        let clamped = render_progress_bar("syncing", 150.0, 0.3);
        assert!(clamped.contains("100%"));
    }

    #[test]
    fn test_progress_bar_width_scaling() {
        let bar = render_progress_bar("", 50.0, 0.3);
        let inner = &bar[bar.find('[').expect("open") + 1..bar.find(']').expect("close")];
        assert_eq!(inner.len(), 30);
    }
}
