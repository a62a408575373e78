use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Front-end sink for operator-facing log lines and newly arrived files
pub trait ConsoleSink: Send + Sync {
    fn log(&self, _line: &str) {}
    fn notify_new_file(&self, _name: &str) {}
}

pub struct NoopConsole;
impl ConsoleSink for NoopConsole {}

/// Forwards console lines to `tracing`
pub struct TracingConsole;

impl ConsoleSink for TracingConsole {
    fn log(&self, line: &str) {
        tracing::info!(target: "stash::console", "{}", line);
    }
    fn notify_new_file(&self, name: &str) {
        tracing::info!(target: "stash::console", file = name, "new file in inbox");
    }
}

/// Appends timestamped lines to a file
pub struct TextConsole {
    file: Mutex<File>,
}

impl TextConsole {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl ConsoleSink for TextConsole {
    fn log(&self, line: &str) {
        self.line(line);
    }
    fn notify_new_file(&self, name: &str) {
        self.line(&format!("NEW_FILE name={}", name));
    }
}

/// Keeps everything in memory; the new-file list mirrors what a front-end
/// would display
#[derive(Default)]
pub struct MemoryConsole {
    lines: Mutex<Vec<String>>,
    new_files: Mutex<Vec<String>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn new_files(&self) -> Vec<String> {
        self.new_files.lock().clone()
    }
}

impl ConsoleSink for MemoryConsole {
    fn log(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
    fn notify_new_file(&self, name: &str) {
        self.new_files.lock().push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_console_appends() {
        let t = tempfile::tempdir().unwrap();
        let path = t.path().join("logs").join("console.log");
        let c = TextConsole::new(&path).unwrap();
        c.log("Server started");
        c.notify_new_file("a.txt");
        drop(c);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] Server started"));
        assert!(lines[1].ends_with("] NEW_FILE name=a.txt"));
    }

    #[test]
    fn test_memory_console() {
        let c = MemoryConsole::new();
        c.log("one");
        c.notify_new_file("f");
        assert_eq!(c.lines(), vec!["one".to_string()]);
        assert_eq!(c.new_files(), vec!["f".to_string()]);
    }
}
