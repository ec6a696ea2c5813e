use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use tracing::warn;

/// Append-only file log of fleet lifecycle events (spawns, readies, reaps,
/// shutdowns). Buffered; the control loop flushes it on the 15-second
/// cadence and the shutdown coordinator flushes it last thing.
#[derive(Debug)]
pub struct EventLog {
    w: Option<BufWriter<File>>,
}

impl EventLog {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let path = dir.join(format!("masterd_{}.log", Utc::now().timestamp()));
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self {
            w: Some(BufWriter::new(f)),
        })
    }

    /// A log that swallows everything; used where no filesystem is wanted.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { w: None }
    }

    pub fn line(&mut self, msg: &str) {
        let Some(w) = self.w.as_mut() else {
            return;
        };
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if let Err(e) = writeln!(w, "{ts} {msg}") {
            warn!(err = %e, "event log write failed");
        }
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.w.as_mut() {
            if let Err(e) = w.flush() {
                warn!(err = %e, "event log flush failed");
            }
        }
    }
}
