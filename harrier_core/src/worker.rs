use crate::classifier::{CrashClassifier, Verdict};
use crate::config::{FuzzConfig, PrepareMode};
use crate::corpus::SeedCorpus;
use crate::executor::{Target, TargetError};
use crate::feedback::{FeedbackError, FeedbackStore};
use crate::mutator::Mutator;
use crate::prepare::{InputPreparer, PrepareError};
use crate::report::{CrashRecord, Reporter};
use crate::stats::Tallies;
use crate::util;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::Thread;
use thiserror::Error;

/// Everything the workers share: configuration, corpus, feedback store,
/// tallies and the capability implementations. Construct once, wrap in an
/// `Arc`, hand to the supervisor.
pub struct Engine {
    pub cfg: Arc<FuzzConfig>,
    pub corpus: Arc<SeedCorpus>,
    pub feedback: Arc<FeedbackStore>,
    pub tallies: Arc<Tallies>,
    pub target: Arc<dyn Target>,
    pub reporter: Arc<dyn Reporter>,
    preparer: InputPreparer,
    classifier: CrashClassifier,
}

impl Engine {
    pub fn new(
        cfg: Arc<FuzzConfig>,
        corpus: Arc<SeedCorpus>,
        mutator: Arc<dyn Mutator>,
        target: Arc<dyn Target>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let feedback = Arc::new(FeedbackStore::new(cfg.work_dir.clone(), cfg.max_file_sz));
        let tallies = Arc::new(Tallies::new());
        let preparer = InputPreparer::new(
            Arc::clone(&cfg),
            Arc::clone(&corpus),
            Arc::clone(&feedback),
            mutator,
        );
        let classifier = CrashClassifier::new(Arc::clone(&cfg), Arc::clone(&tallies));
        Self {
            cfg,
            corpus,
            feedback,
            tallies,
            target,
            reporter,
            preparer,
            classifier,
        }
    }
}

/// Per-iteration failures a worker has to act on. Everything else is
/// logged in place and the loop moves on.
#[derive(Error, Debug)]
enum WorkerError {
    #[error(transparent)]
    Prepare(#[from] PrepareError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Feedback(#[from] FeedbackError),
}

impl WorkerError {
    fn is_fatal(&self) -> bool {
        match self {
            WorkerError::Prepare(e) => e.is_fatal(),
            // A target that cannot even spawn is a failed launch and the
            // iteration simply yielded nothing; a broken wait is not
            // recoverable.
            WorkerError::Target(TargetError::Spawn { .. }) => false,
            WorkerError::Target(TargetError::InputOpen { .. }) => true,
            WorkerError::Target(TargetError::Wait(_)) => true,
            WorkerError::Feedback(_) => true,
        }
    }
}

/// Claims one iteration against the global budget.
///
/// The increment only happens below the bound, so the final count stays
/// within `[mutations_max, mutations_max + threads_max - 1]` even with
/// every worker racing the limit.
fn claim_iteration(engine: &Engine) -> bool {
    let max = engine.cfg.mutations_max;
    if max == 0 {
        engine
            .tallies
            .mutations_cnt
            .fetch_add(1, Ordering::Relaxed);
        return true;
    }
    engine
        .tallies
        .mutations_cnt
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n >= max {
                None
            } else {
                Some(n + 1)
            }
        })
        .is_ok()
}

/// Body of one worker thread. Returns when the iteration budget is
/// exhausted; exits the process on unrecoverable environment faults.
pub(crate) fn worker_loop(engine: Arc<Engine>, supervisor: Thread) {
    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    let mut rng = ChaCha8Rng::from_seed(seed);

    loop {
        if !claim_iteration(&engine) {
            engine
                .tallies
                .threads_finished
                .fetch_add(1, Ordering::SeqCst);
            supervisor.unpark();
            return;
        }
        if let Err(err) = fuzz_iteration(&engine, &mut rng) {
            if err.is_fatal() {
                log::error!("Worker cannot make forward progress: {}", err);
                std::process::exit(1);
            }
            log::warn!("Iteration failed: {}", err);
        }
    }
}

/// One full pass: pick seed, prepare input, run the target, classify the
/// observation, feed results back.
fn fuzz_iteration(engine: &Engine, rng: &mut ChaCha8Rng) -> Result<(), WorkerError> {
    let started_ms = util::now_millis();
    let idx = engine.corpus.pick(rng);
    let orig_seed = engine.corpus.basename(idx);

    let (temp, bytes) = engine.preparer.prepare(idx, rng)?;
    let obs = engine.target.run(temp.path())?;

    match engine
        .classifier
        .classify(&obs, temp.path(), engine.target.as_ref())
    {
        Ok(Verdict::Saved {
            fingerprint, path, ..
        }) => {
            let record = CrashRecord {
                orig_seed: &orig_seed,
                crash_file: &path,
                signal: obs.status.signal().unwrap_or(0),
                pc: obs.crashing_pc,
                fault_addr: obs.fault_addr,
                fingerprint,
                report_blob: &obs.report_blob,
            };
            if let Err(e) = engine.reporter.report(&record) {
                log::warn!("Couldn't report crash: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => log::warn!("Crash triage failed: {}", e),
    }

    if engine.cfg.prepare_mode() == PrepareMode::Dynamic {
        engine.feedback.offer(&bytes, obs.counters)?;
    }

    log::debug!(
        "Iteration on '{}' finished in {} ms",
        orig_seed,
        util::now_millis() - started_ms
    );
    Ok(())
}
