//! Output plug-ins.
//!
//! The output stage fans a finalised packet (with its alert list) out to
//! every registered logger, then returns the buffer to the pool. Loggers
//! are best-effort: an I/O failure is counted and logged, never fatal.

pub mod http_log;
pub mod unified_alert;
pub mod unified_log;

use crate::config::OutputsConfig;
use crate::packet::Packet;
use crate::stats::StatsTable;
use crate::utils::time::EngineClock;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

/// An output plug-in. Packet loggers receive finalised packets; stats
/// loggers receive read-only snapshots.
pub trait OutputPlugin: Send {
    fn name(&self) -> &'static str;

    fn log(&mut self, pkt: &Packet) -> Result<()>;

    fn log_stats(&mut self, _stats: &StatsTable) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds the configured loggers.
pub fn build_outputs(
    cfg: &OutputsConfig,
    clock: Arc<EngineClock>,
) -> Result<Vec<Box<dyn OutputPlugin>>> {
    let mut outputs: Vec<Box<dyn OutputPlugin>> = Vec::new();
    let dir = Path::new(&cfg.default_log_dir);
    if let Some(ua) = &cfg.unified_alert {
        outputs.push(Box::new(unified_alert::UnifiedAlertLogger::new(
            dir,
            ua,
            Arc::clone(&clock),
        )?));
    }
    if let Some(ul) = &cfg.unified_log {
        outputs.push(Box::new(unified_log::UnifiedLogLogger::new(
            dir,
            ul,
            Arc::clone(&clock),
        )?));
    }
    if let Some(hl) = &cfg.http_log {
        outputs.push(Box::new(http_log::HttpLogLogger::new(dir, hl)?));
    }
    Ok(outputs)
}

/// A log file rotated by size cap, named `<prefix>.<unix-seconds>`.
pub struct RotatingFile {
    dir: PathBuf,
    prefix: String,
    size_limit: u64,
    file: File,
    path: PathBuf,
    size_current: u64,
    last_open_secs: u64,
    clock: Arc<EngineClock>,
}

impl RotatingFile {
    pub fn open(
        dir: &Path,
        prefix: &str,
        size_limit: u64,
        clock: Arc<EngineClock>,
    ) -> Result<Self> {
        let secs = clock.get().secs;
        let path = dir.join(format!("{}.{}", prefix, secs));
        let file = File::create(&path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        log::info!("opened log file {}", path.display());
        Ok(RotatingFile {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            size_limit,
            file,
            path,
            size_current: 0,
            last_open_secs: secs,
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_current(&self) -> u64 {
        self.size_current
    }

    /// True when appending `len` more bytes would pass the size cap.
    pub fn would_exceed(&self, len: u64) -> bool {
        self.size_current + len > self.size_limit
    }

    /// Closes the current file and opens a successor. Successive rotations
    /// within one second get distinct names.
    pub fn rotate(&mut self) -> Result<()> {
        let now = self.clock.get();
        let secs = now.secs.max(self.last_open_secs + 1);
        let path = self.dir.join(format!("{}.{}", self.prefix, secs));
        let file = File::create(&path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        log::info!("rotated log file to {}", path.display());
        self.file = file;
        self.path = path;
        self.size_current = 0;
        self.last_open_secs = secs;
        Ok(())
    }

    /// Writes and flushes immediately so partial records are never visible
    /// to readers.
    pub fn write_record(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).context("log write failed")?;
        self.file.flush().context("log flush failed")?;
        self.size_current += bytes.len() as u64;
        Ok(())
    }
}
