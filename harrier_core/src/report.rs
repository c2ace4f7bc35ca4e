use crate::util;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report I/O error: {0}")]
    Io(String),
}

/// Everything a sink needs to describe one persisted crash.
#[derive(Debug)]
pub struct CrashRecord<'a> {
    pub orig_seed: &'a str,
    pub crash_file: &'a Path,
    pub signal: i32,
    pub pc: u64,
    pub fault_addr: u64,
    pub fingerprint: u64,
    /// Free-form blob supplied by the target capability; may be empty.
    pub report_blob: &'a [u8],
}

/// Sink that renders crash records. The engine calls it once per
/// persisted crash; rendering details are the implementation's business.
pub trait Reporter: Send + Sync {
    fn report(&self, record: &CrashRecord<'_>) -> Result<(), ReportError>;
}

/// Appends a textual block per crash to a single report file.
#[derive(Debug)]
pub struct FileReporter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileReporter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

impl Reporter for FileReporter {
    fn report(&self, record: &CrashRecord<'_>) -> Result<(), ReportError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ReportError::Io(format!("Couldn't open {:?}: {}", self.path, e)))?;

        let mut entry = format!(
            "=====================================================================\n\
             TIME: {}\n\
             SIGNAL: {}\n\
             PC: 0x{:x}\n\
             FAULT ADDRESS: 0x{:x}\n\
             STACK HASH: 0x{:016x}\n\
             ORIG SEED: {}\n\
             CRASH FILE: {}\n",
            util::unix_seconds(),
            record.signal,
            record.pc,
            record.fault_addr,
            record.fingerprint,
            record.orig_seed,
            record.crash_file.display(),
        );
        if !record.report_blob.is_empty() {
            entry.push_str(&String::from_utf8_lossy(record.report_blob));
            entry.push('\n');
        }

        file.write_all(entry.as_bytes())
            .map_err(|e| ReportError::Io(format!("Couldn't append to {:?}: {}", self.path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_reporter_appends_one_block_per_crash() {
        let dir = tempdir().unwrap();
        let report_path = dir.path().join("REPORT.TXT");
        let reporter = FileReporter::new(report_path.clone());

        let record = CrashRecord {
            orig_seed: "seed_a",
            crash_file: Path::new("/work/SIG11.PC.0.STACK.1.ADDR.0.fuzz"),
            signal: 11,
            pc: 0xdead,
            fault_addr: 0x41414141,
            fingerprint: 0xBADBAD00_0000_0001,
            report_blob: b"target said something",
        };
        reporter.report(&record).unwrap();
        reporter.report(&record).unwrap();

        let content = std::fs::read_to_string(&report_path).unwrap();
        assert_eq!(content.matches("SIGNAL: 11").count(), 2);
        assert!(content.contains("PC: 0xdead"));
        assert!(content.contains("ORIG SEED: seed_a"));
        assert!(content.contains("target said something"));
    }
}
