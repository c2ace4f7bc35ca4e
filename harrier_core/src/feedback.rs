use crate::corpus::{CorpusError, SeedCorpus};
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// On-disk name of the current best dynamic seed inside the workspace.
pub const CURRENT_BEST: &str = "CURRENT_BEST";

/// Staging name written first, then renamed over [`CURRENT_BEST`] so
/// outside readers observe the previous or the new file, never a torn
/// write.
const CURRENT_BEST_TMP: &str = ".tmp.CURRENT_BEST";

/// Errors surfaced by the feedback store.
#[derive(Error, Debug)]
pub enum FeedbackError {
    /// The best buffer exceeded the configured maximum. This is a broken
    /// internal invariant and callers treat it as fatal.
    #[error("Best seed size {size} exceeds the maximal file size {max}")]
    BestTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Seed(#[from] CorpusError),
    #[error("Feedback I/O error: {0}")]
    Io(String),
}

/// The five runtime counters reported for one target execution.
///
/// Componentwise improvement over the stored best defines "more
/// interesting".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterVector {
    pub instr_cnt: u64,
    pub branch_cnt: u64,
    pub pc_cnt: u64,
    pub path_cnt: u64,
    pub custom_cnt: u64,
}

impl CounterVector {
    pub fn is_zero(&self) -> bool {
        *self == CounterVector::default()
    }

    /// True when every component of `self` is at least the corresponding
    /// component of `other`. Ties count as covering.
    pub fn covers(&self, other: &CounterVector) -> bool {
        self.instr_cnt >= other.instr_cnt
            && self.branch_cnt >= other.branch_cnt
            && self.pc_cnt >= other.pc_cnt
            && self.path_cnt >= other.path_cnt
            && self.custom_cnt >= other.custom_cnt
    }

    /// Strict domination: covers with at least one strictly greater
    /// component.
    pub fn dominates(&self, other: &CounterVector) -> bool {
        self.covers(other) && self != other
    }
}

#[derive(Debug)]
struct BestSeed {
    bytes: Vec<u8>,
    counters: CounterVector,
}

/// Process-wide "best dynamic seed" record behind a single mutex.
///
/// Bytes and counters always change together under the lock, so any
/// reader sees a consistent pair. The buffer starts as a single zero byte
/// with zero counters; the first worker to check it out in a corpus-backed
/// run seeds it from a real file.
#[derive(Debug)]
pub struct FeedbackStore {
    state: Mutex<BestSeed>,
    work_dir: PathBuf,
    max_file_sz: usize,
}

impl FeedbackStore {
    pub fn new(work_dir: PathBuf, max_file_sz: usize) -> Self {
        Self {
            state: Mutex::new(BestSeed {
                bytes: vec![0u8],
                counters: CounterVector::default(),
            }),
            work_dir,
            max_file_sz,
        }
    }

    /// Copies the current best bytes and counters out under the lock.
    pub fn snapshot(&self) -> (Vec<u8>, CounterVector) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.bytes.clone(), state.counters)
    }

    /// The dynamic-mode checkout: under the lock, seed the best buffer
    /// from `corpus[idx]` when this run has a corpus and no counter has
    /// moved yet, then hand back a private copy together with the
    /// counters observed at copy time.
    ///
    /// A zero counter vector in the result tells the caller this is the
    /// warm-up pass and the bytes must flow to the target unmutated.
    pub fn checkout(
        &self,
        corpus: &SeedCorpus,
        idx: usize,
        have_input: bool,
    ) -> Result<(Vec<u8>, CounterVector), FeedbackError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if have_input && state.counters.is_zero() {
            state.bytes = corpus.read_seed(idx)?;
        }
        if state.bytes.len() > self.max_file_sz {
            return Err(FeedbackError::BestTooLarge {
                size: state.bytes.len(),
                max: self.max_file_sz,
            });
        }
        Ok((state.bytes.clone(), state.counters))
    }

    /// Offers a candidate observed with `counters`. Accepted when the
    /// candidate covers the stored best in every component; acceptance
    /// replaces bytes and counters together and atomically refreshes the
    /// workspace `CURRENT_BEST` file via rename.
    pub fn offer(
        &self,
        candidate: &[u8],
        counters: CounterVector,
    ) -> Result<bool, FeedbackError> {
        if candidate.len() > self.max_file_sz {
            return Err(FeedbackError::BestTooLarge {
                size: candidate.len(),
                max: self.max_file_sz,
            });
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !counters.covers(&state.counters) {
            return Ok(false);
        }
        log::info!(
            "New best feedback: size {} (was {}), counters {:?} (was {:?})",
            candidate.len(),
            state.bytes.len(),
            counters,
            state.counters
        );
        state.bytes = candidate.to_vec();
        state.counters = counters;

        let staged = self.work_dir.join(CURRENT_BEST_TMP);
        let target = self.work_dir.join(CURRENT_BEST);
        fs::write(&staged, candidate)
            .map_err(|e| FeedbackError::Io(format!("Couldn't write {:?}: {}", staged, e)))?;
        fs::rename(&staged, &target)
            .map_err(|e| FeedbackError::Io(format!("Couldn't rename over {:?}: {}", target, e)))?;
        Ok(true)
    }
}
