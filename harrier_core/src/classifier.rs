use crate::config::FuzzConfig;
use crate::executor::{Observation, RunStatus, Target};
use crate::stats::Tallies;
use crate::util;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// High bits set on the fingerprint when at most one stack frame is
/// known, so shallow crashes never collide with deep ones.
pub const SINGLE_FRAME_MASK: u64 = 0xBADBAD00_0000_0000;

/// Re-runs required before a crash counts as verified.
pub const VERIFIER_ITER: usize = 5;

/// How many of the innermost frames feed the fingerprint.
const MAJOR_FRAMES: usize = 7;

#[cfg(not(target_os = "android"))]
const CRASH_SIGNALS: [i32; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
];

// Android process teardown raises SIGABRT for unrelated reasons, so the
// sanitizer's exit signal stands in for it there.
#[cfg(target_os = "android")]
const CRASH_SIGNALS: [i32; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGUSR2,
];

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Crash persistence failed: {0}")]
    Io(String),
    #[error("Verifier re-run failed: {0}")]
    Rerun(String),
}

/// Outcome of classifying one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    NotACrash,
    Timeout,
    Blacklisted {
        fingerprint: u64,
    },
    /// Unique-save mode found the fingerprint already on disk.
    Duplicate {
        fingerprint: u64,
    },
    /// A crash file was written. `verified` is `None` when the verifier
    /// is off, otherwise whether all re-runs reproduced the fingerprint.
    Saved {
        fingerprint: u64,
        path: PathBuf,
        verified: Option<bool>,
    },
}

/// Computes the 64-bit stack fingerprint from the innermost frames.
///
/// With no backtrace at all the crashing program counter stands in as the
/// only frame. Fingerprints are only stable across runs when the target
/// disables address randomization.
pub fn stack_fingerprint(frames: &[u64], crashing_pc: u64) -> u64 {
    let frames = if frames.is_empty() {
        std::slice::from_ref(&crashing_pc)
    } else {
        frames
    };
    let top = &frames[..frames.len().min(MAJOR_FRAMES)];

    let mut bytes = Vec::with_capacity(top.len() * 8);
    for frame in top {
        bytes.extend_from_slice(&frame.to_le_bytes());
    }
    let digest = md5::compute(&bytes);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.0[..8]);
    let mut hash = u64::from_le_bytes(word);

    if frames.len() <= 1 {
        hash |= SINGLE_FRAME_MASK;
    }
    hash
}

/// Sublinear membership test over the sorted blacklist.
pub fn blacklist_contains(sorted: &[u64], fingerprint: u64) -> bool {
    sorted.binary_search(&fingerprint).is_ok()
}

/// Decides for each observation whether it is a crash, whether the crash
/// is new, and persists new ones to the workspace.
#[derive(Debug)]
pub struct CrashClassifier {
    cfg: Arc<FuzzConfig>,
    tallies: Arc<Tallies>,
}

impl CrashClassifier {
    pub fn new(cfg: Arc<FuzzConfig>, tallies: Arc<Tallies>) -> Self {
        Self { cfg, tallies }
    }

    /// Runs the decision procedure on one observation. `input_path` must
    /// still exist; the crash file content and any verifier re-runs read
    /// from it.
    pub fn classify(
        &self,
        obs: &Observation,
        input_path: &std::path::Path,
        target: &dyn Target,
    ) -> Result<Verdict, ClassifierError> {
        let signal = match obs.status {
            RunStatus::TimedOut => {
                self.tallies.timeouts_cnt.fetch_add(1, Ordering::Relaxed);
                return Ok(Verdict::Timeout);
            }
            RunStatus::Exited(_) => return Ok(Verdict::NotACrash),
            RunStatus::Signaled(sig) => sig,
        };
        if !CRASH_SIGNALS.contains(&signal) {
            return Ok(Verdict::NotACrash);
        }

        self.tallies.crashes_cnt.fetch_add(1, Ordering::Relaxed);

        let fingerprint = stack_fingerprint(&obs.frames, obs.crashing_pc);
        if blacklist_contains(&self.cfg.stackhash_blacklist, fingerprint) {
            self.tallies
                .blacklisted_crashes_cnt
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("Blacklisted stack hash 0x{:016x}, skipping", fingerprint);
            return Ok(Verdict::Blacklisted { fingerprint });
        }

        let path = self.crash_path(signal, obs, fingerprint);
        let input = fs::read(input_path)
            .map_err(|e| ClassifierError::Io(format!("Couldn't read {:?}: {}", input_path, e)))?;

        if self.cfg.save_unique {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(&input).map_err(|e| {
                        ClassifierError::Io(format!("Couldn't write {:?}: {}", path, e))
                    })?;
                    self.tallies
                        .unique_crashes_cnt
                        .fetch_add(1, Ordering::Relaxed);
                    log::info!("Unique crash saved as {:?}", path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    log::debug!("Crash with stack hash 0x{:016x} already saved", fingerprint);
                    return Ok(Verdict::Duplicate { fingerprint });
                }
                Err(e) => {
                    return Err(ClassifierError::Io(format!(
                        "Couldn't create {:?}: {}",
                        path, e
                    )))
                }
            }
        } else {
            fs::write(&path, &input)
                .map_err(|e| ClassifierError::Io(format!("Couldn't write {:?}: {}", path, e)))?;
            log::info!("Crash saved as {:?}", path);
        }

        if self.cfg.use_simplifier {
            log::debug!("Simplifier requested; stage not active for this target");
        }

        let verified = if self.cfg.use_verifier {
            let stable = self.verify(input_path, fingerprint, target)?;
            if stable {
                self.tallies
                    .verified_crashes_cnt
                    .fetch_add(1, Ordering::Relaxed);
            } else {
                log::warn!(
                    "Crash with stack hash 0x{:016x} did not reproduce, flaky",
                    fingerprint
                );
            }
            Some(stable)
        } else {
            None
        };

        Ok(Verdict::Saved {
            fingerprint,
            path,
            verified,
        })
    }

    fn crash_path(&self, signal: i32, obs: &Observation, fingerprint: u64) -> PathBuf {
        let name = if self.cfg.save_unique {
            format!(
                "SIG{}.PC.{:x}.STACK.{:x}.ADDR.{:x}.{}",
                signal, obs.crashing_pc, fingerprint, obs.fault_addr, self.cfg.file_extn
            )
        } else {
            // Timestamped so save-all never collides on the filesystem.
            format!(
                "SIG{}.PC.{:x}.STACK.{:x}.ADDR.{:x}.TIME.{}.{}",
                signal,
                obs.crashing_pc,
                fingerprint,
                obs.fault_addr,
                util::unix_seconds(),
                self.cfg.file_extn
            )
        };
        self.cfg.work_dir.join(name)
    }

    /// Re-runs the same input requiring the identical fingerprint each
    /// time. Any divergence in signal or stack marks the crash flaky.
    fn verify(
        &self,
        input_path: &std::path::Path,
        expected: u64,
        target: &dyn Target,
    ) -> Result<bool, ClassifierError> {
        for round in 0..VERIFIER_ITER {
            let obs = target
                .run(input_path)
                .map_err(|e| ClassifierError::Rerun(e.to_string()))?;
            let signal = match obs.status {
                RunStatus::Signaled(sig) if CRASH_SIGNALS.contains(&sig) => sig,
                _ => return Ok(false),
            };
            let fingerprint = stack_fingerprint(&obs.frames, obs.crashing_pc);
            if fingerprint != expected {
                log::debug!(
                    "Verifier round {}: signal {} but stack hash 0x{:016x} != 0x{:016x}",
                    round,
                    signal,
                    fingerprint,
                    expected
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}
