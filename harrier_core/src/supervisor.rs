use crate::config::SANCOV_DIR;
use crate::stats::TallySnapshot;
use crate::worker::{worker_loop, Engine};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::flag;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Worker thread stack size. Generous because preparation buffers up to
/// `max_file_sz` live on the iteration path.
const WORKER_STACK_SZ: usize = 8 * 1024 * 1024;

/// How often the supervisor wakes to refresh the display and poll its
/// termination predicates.
const TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Couldn't install signal handler: {0}")]
    Signal(String),
    #[error("Couldn't start worker thread: {0}")]
    Spawn(String),
    #[error("Couldn't prepare workspace: {0}")]
    Workspace(String),
}

/// Final state of a fuzzing run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    /// The terminating signal, if the run was interrupted.
    pub received_signal: Option<i32>,
    pub tallies: TallySnapshot,
}

/// Starts the worker pool and blocks until the iteration budget is
/// exhausted or a termination signal arrives.
///
/// SIGTERM, SIGINT and SIGQUIT handlers only store the signal number;
/// the loop notices it on the next tick. Workers are detached; on an
/// interrupted run the process exits without draining them and the OS
/// reclaims everything, including any in-flight temp inputs under the
/// workspace.
pub fn run(engine: Arc<Engine>) -> Result<RunSummary, SupervisorError> {
    let received = Arc::new(AtomicUsize::new(0));
    for sig in [SIGTERM, SIGINT, SIGQUIT] {
        flag::register_usize(sig, Arc::clone(&received), sig as usize)
            .map_err(|e| SupervisorError::Signal(e.to_string()))?;
    }

    if engine.cfg.use_sancov {
        let scratch = engine.cfg.work_dir.join(SANCOV_DIR);
        fs::create_dir_all(&scratch).map_err(|e| {
            SupervisorError::Workspace(format!("Couldn't create {:?}: {}", scratch, e))
        })?;
    }

    let threads_max = engine.cfg.threads_max;
    let supervisor_thread = thread::current();
    for n in 0..threads_max {
        let engine = Arc::clone(&engine);
        let wake = supervisor_thread.clone();
        thread::Builder::new()
            .name(format!("fuzz-worker-{n}"))
            .stack_size(WORKER_STACK_SZ)
            .spawn(move || worker_loop(engine, wake))
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;
    }
    log::info!("Launched {} fuzzing threads", threads_max);

    loop {
        if engine.cfg.use_screen {
            let snap = engine.tallies.snapshot();
            log::info!(
                "Iterations {} | crashes {} (unique {}, blacklisted {}, verified {}) | timeouts {}",
                snap.mutations,
                snap.crashes,
                snap.unique_crashes,
                snap.blacklisted_crashes,
                snap.verified_crashes,
                snap.timeouts
            );
        }
        let signal = received.load(Ordering::SeqCst);
        if signal != 0 {
            log::info!("Signal {} received, terminating", signal);
            return Ok(RunSummary {
                received_signal: Some(signal as i32),
                tallies: engine.tallies.snapshot(),
            });
        }
        if engine.tallies.threads_finished.load(Ordering::SeqCst) >= threads_max as u64 {
            break;
        }
        thread::park_timeout(TICK);
    }

    Ok(RunSummary {
        received_signal: None,
        tallies: engine.tallies.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FuzzConfig, FILE_PLACEHOLDER};
    use crate::corpus::SeedCorpus;
    use crate::executor::CommandTarget;
    use crate::mutator::BitFlipMutator;
    use crate::report::FileReporter;
    use std::fs;
    use tempfile::tempdir;

    fn engine_for(cfg: FuzzConfig) -> Arc<Engine> {
        let cfg = Arc::new(cfg);
        let corpus = Arc::new(SeedCorpus::from_config(&cfg).unwrap());
        Arc::new(Engine::new(
            Arc::clone(&cfg),
            corpus,
            Arc::new(BitFlipMutator::from_config(&cfg)),
            Arc::new(CommandTarget::from_config(&cfg)),
            Arc::new(FileReporter::new(cfg.report_path())),
        ))
    }

    #[test]
    fn bounded_run_against_a_benign_target_completes_cleanly() {
        let work = tempdir().unwrap();
        let seeds = tempdir().unwrap();
        fs::write(seeds.path().join("seed"), b"0123456789abcdef").unwrap();

        let engine = engine_for(FuzzConfig {
            cmdline: vec!["true".into(), FILE_PLACEHOLDER.into()],
            input_path: Some(seeds.path().to_path_buf()),
            work_dir: work.path().to_path_buf(),
            mutations_max: 10,
            threads_max: 1,
            null_stdio: true,
            use_screen: false,
            ..FuzzConfig::default()
        });

        let summary = run(Arc::clone(&engine)).unwrap();
        assert_eq!(summary.received_signal, None);
        assert_eq!(summary.tallies.mutations, 10);
        assert_eq!(summary.tallies.crashes, 0);
        assert_eq!(summary.tallies.unique_crashes, 0);
        assert_eq!(summary.tallies.threads_finished, 1);
        assert_eq!(
            fs::read_dir(work.path()).unwrap().count(),
            0,
            "workspace must only ever hold transient temp inputs"
        );
    }

    #[test]
    fn bounded_run_lands_within_the_iteration_window() {
        let work = tempdir().unwrap();
        let seeds = tempdir().unwrap();
        fs::write(seeds.path().join("seed"), b"abcd").unwrap();
        let threads = 4u64;

        let engine = engine_for(FuzzConfig {
            cmdline: vec!["true".into()],
            input_path: Some(seeds.path().to_path_buf()),
            work_dir: work.path().to_path_buf(),
            mutations_max: 25,
            threads_max: threads as usize,
            null_stdio: true,
            use_screen: false,
            ..FuzzConfig::default()
        });

        let summary = run(engine).unwrap();
        assert!(summary.tallies.mutations >= 25);
        assert!(summary.tallies.mutations <= 25 + threads - 1);
        assert_eq!(summary.tallies.threads_finished, threads);
    }

    #[test]
    fn timeouts_are_tallied_and_leave_no_residue() {
        let work = tempdir().unwrap();
        let seeds = tempdir().unwrap();
        fs::write(seeds.path().join("seed"), b"abcd").unwrap();

        let engine = engine_for(FuzzConfig {
            cmdline: vec!["sleep".into(), "60".into()],
            input_path: Some(seeds.path().to_path_buf()),
            work_dir: work.path().to_path_buf(),
            mutations_max: 2,
            threads_max: 1,
            timeout_s: 1,
            null_stdio: true,
            use_screen: false,
            ..FuzzConfig::default()
        });

        let summary = run(engine).unwrap();
        assert_eq!(summary.tallies.timeouts, 2);
        assert_eq!(summary.tallies.crashes, 0);
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn sancov_scratch_dir_is_created_on_startup() {
        let work = tempdir().unwrap();
        let seeds = tempdir().unwrap();
        fs::write(seeds.path().join("seed"), b"abcd").unwrap();

        let engine = engine_for(FuzzConfig {
            cmdline: vec!["true".into()],
            input_path: Some(seeds.path().to_path_buf()),
            work_dir: work.path().to_path_buf(),
            mutations_max: 1,
            threads_max: 1,
            use_sancov: true,
            null_stdio: true,
            use_screen: false,
            ..FuzzConfig::default()
        });

        run(engine).unwrap();
        assert!(work.path().join(SANCOV_DIR).is_dir());
    }
}
