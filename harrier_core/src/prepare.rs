use crate::config::{FuzzConfig, PrepareMode};
use crate::corpus::{CorpusError, SeedCorpus};
use crate::feedback::{FeedbackError, FeedbackStore};
use crate::mutator::Mutator;
use crate::util;
use rand_core::RngCore;
use std::fs;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;

/// Owns a temp input file and unlinks it when dropped.
///
/// Covers every exit path of an iteration: normal reap, preparation
/// failure after the file exists, and panics.
#[derive(Debug)]
pub struct TempInput {
    path: PathBuf,
}

impl TempInput {
    fn claim(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempInput {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("Couldn't unlink temp input {:?}: {}", self.path, e);
        }
    }
}

/// Errors in the input-preparation path.
///
/// I/O and feedback failures indicate a broken environment and are fatal
/// for the worker; a misbehaving external mutator only fails the current
/// iteration unless its wait status is unexplainable.
#[derive(Error, Debug)]
pub enum PrepareError {
    #[error(transparent)]
    Seed(#[from] CorpusError),
    #[error(transparent)]
    Feedback(#[from] FeedbackError),
    #[error("Couldn't write input file {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },
    #[error("Couldn't launch external mutator: {0}")]
    ExternalSpawn(String),
    #[error("External mutator exited with status {0}")]
    ExternalStatus(i32),
    #[error("External mutator terminated with signal {0}")]
    ExternalSignal(i32),
    #[error("External mutator terminated abnormally")]
    ExternalAborted,
}

impl PrepareError {
    /// Whether the worker must stop making progress. Only the two
    /// external wait-status failures are retryable per-iteration faults.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PrepareError::ExternalStatus(_) | PrepareError::ExternalSignal(_)
        )
    }
}

/// Produces exactly one on-disk input per iteration, via the strategy the
/// configuration selects.
pub struct InputPreparer {
    cfg: Arc<FuzzConfig>,
    corpus: Arc<SeedCorpus>,
    feedback: Arc<FeedbackStore>,
    mutator: Arc<dyn Mutator>,
}

impl InputPreparer {
    pub fn new(
        cfg: Arc<FuzzConfig>,
        corpus: Arc<SeedCorpus>,
        feedback: Arc<FeedbackStore>,
        mutator: Arc<dyn Mutator>,
    ) -> Self {
        Self {
            cfg,
            corpus,
            feedback,
            mutator,
        }
    }

    /// Prepares the input for one iteration based on seed `idx`.
    ///
    /// Returns the owning temp-file guard together with the bytes that
    /// were materialized, which dynamic mode later offers back to the
    /// feedback store.
    pub fn prepare(
        &self,
        idx: usize,
        rng: &mut dyn RngCore,
    ) -> Result<(TempInput, Vec<u8>), PrepareError> {
        let path = util::temp_input_path(&self.cfg.work_dir, &self.cfg.file_extn, rng);
        match self.cfg.prepare_mode() {
            PrepareMode::Static => self.prepare_static(idx, rng, path),
            PrepareMode::Dynamic => self.prepare_dynamic(idx, rng, path),
            PrepareMode::External => self.prepare_external(idx, rng, path),
        }
    }

    fn prepare_static(
        &self,
        idx: usize,
        rng: &mut dyn RngCore,
        path: PathBuf,
    ) -> Result<(TempInput, Vec<u8>), PrepareError> {
        let mut buf = self.corpus.read_seed(idx)?;
        self.mutator.resize(&mut buf, self.cfg.max_file_sz, rng);
        self.mutator.mangle(&mut buf, rng);
        self.mutator.post_mangle(&mut buf, rng);
        let temp = write_exclusive(path, &buf)?;
        Ok((temp, buf))
    }

    fn prepare_dynamic(
        &self,
        idx: usize,
        rng: &mut dyn RngCore,
        path: PathBuf,
    ) -> Result<(TempInput, Vec<u8>), PrepareError> {
        let (mut buf, counters) =
            self.feedback
                .checkout(&self.corpus, idx, self.cfg.input_path.is_some())?;

        // The warm-up pass runs the initial buffer unmutated so its
        // baseline counters are attributable to the seed itself.
        if !counters.is_zero() {
            self.mutator.resize(&mut buf, self.cfg.max_file_sz, rng);
            self.mutator.mangle(&mut buf, rng);
        }
        let temp = write_exclusive(path, &buf)?;
        Ok((temp, buf))
    }

    fn prepare_external(
        &self,
        idx: usize,
        rng: &mut dyn RngCore,
        path: PathBuf,
    ) -> Result<(TempInput, Vec<u8>), PrepareError> {
        let mut buf = Vec::new();
        let temp = write_exclusive(path, &buf)?;

        if self.cfg.input_path.is_some() {
            buf = self.corpus.read_seed(idx)?;
            self.mutator.post_mangle(&mut buf, rng);
            fs::write(temp.path(), &buf).map_err(|e| PrepareError::Io {
                path: temp.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        // The external command must always be present in external mode;
        // prepare_mode() selects this path only when it is set.
        let command = self
            .cfg
            .external_command
            .as_ref()
            .ok_or(PrepareError::ExternalAborted)?;
        let status = Command::new(command)
            .arg(temp.path())
            .status()
            .map_err(|e| PrepareError::ExternalSpawn(e.to_string()))?;

        if status.success() {
            return Ok((temp, buf));
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => Err(PrepareError::ExternalStatus(code)),
            (None, Some(sig)) => Err(PrepareError::ExternalSignal(sig)),
            (None, None) => Err(PrepareError::ExternalAborted),
        }
    }
}

/// Writes the buffer to a fresh file with create-exclusive semantics, the
/// final authority against temp-name collisions between workers.
fn write_exclusive(path: PathBuf, bytes: &[u8]) -> Result<TempInput, PrepareError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| PrepareError::Io {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    let temp = TempInput::claim(path);
    file.write_all(bytes).map_err(|e| PrepareError::Io {
        path: temp.path().to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(temp)
}
