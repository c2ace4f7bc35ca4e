use crate::config::{FuzzConfig, FILE_PLACEHOLDER};
use crate::feedback::CounterVector;
use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use wait_timeout::ChildExt;

/// How one target execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Normal process exit with the given code. A failed exec inside the
    /// child also lands here, as a non-zero exit.
    Exited(i32),
    /// The process was terminated by the given signal.
    Signaled(i32),
    /// The per-run deadline expired and the child was killed.
    TimedOut,
}

impl RunStatus {
    pub fn signal(&self) -> Option<i32> {
        match self {
            RunStatus::Signaled(sig) => Some(*sig),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RunStatus::TimedOut)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Exited(0)
    }
}

/// Everything observed about a single target run.
///
/// Instrumented `Target` implementations fill in the program counter,
/// fault address, backtrace frames, counters and report blob; the plain
/// process-level target leaves them at their defaults.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub pid: u32,
    pub wall_ms_elapsed: u64,
    pub status: RunStatus,
    pub crashing_pc: u64,
    pub fault_addr: u64,
    /// Program counters of the top stack frames, innermost first.
    pub frames: Vec<u64>,
    pub counters: CounterVector,
    pub report_blob: Vec<u8>,
}

/// Errors from launching or supervising the target process.
#[derive(Error, Debug)]
pub enum TargetError {
    /// The target could not be spawned at all (missing binary, bad perms).
    /// Classified as a failed launch, not a crash.
    #[error("Couldn't launch '{program}': {reason}")]
    Spawn { program: String, reason: String },
    #[error("Couldn't open input {path} for stdin delivery: {reason}")]
    InputOpen { path: String, reason: String },
    #[error("Waiting for the target failed: {0}")]
    Wait(String),
}

/// Capability that runs the target once against a prepared input and
/// reports the [`Observation`]. Implementations own resource limits,
/// stdio policy, placeholder substitution, exec and the per-run timeout.
pub trait Target: Send + Sync {
    fn run(&self, input_path: &Path) -> Result<Observation, TargetError>;
}

/// Process-level target: launches the command line per run and observes
/// the exit disposition through the OS, with no instrumentation.
#[derive(Debug, Clone)]
pub struct CommandTarget {
    argv: Vec<String>,
    fuzz_stdin: bool,
    null_stdio: bool,
    timeout: Duration,
    envs: Vec<(String, String)>,
    as_limit_mib: u64,
    disable_randomization: bool,
}

impl CommandTarget {
    pub fn from_config(cfg: &FuzzConfig) -> Self {
        let envs = cfg
            .envs
            .iter()
            .filter_map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        Self {
            argv: cfg.cmdline.clone(),
            fuzz_stdin: cfg.fuzz_stdin,
            null_stdio: cfg.null_stdio,
            timeout: Duration::from_secs(cfg.timeout_s),
            envs,
            as_limit_mib: cfg.as_limit_mib,
            disable_randomization: cfg.disable_randomization,
        }
    }

    /// Builds the final argv, substituting the placeholder token with the
    /// input path. With stdin delivery the placeholder is passed through
    /// untouched; the target is not expected to open it.
    fn build_argv(&self, input_path: &Path) -> Vec<String> {
        self.argv
            .iter()
            .map(|tok| {
                if !self.fuzz_stdin && tok == FILE_PLACEHOLDER {
                    input_path.to_string_lossy().into_owned()
                } else {
                    tok.clone()
                }
            })
            .collect()
    }
}

impl Target for CommandTarget {
    fn run(&self, input_path: &Path) -> Result<Observation, TargetError> {
        let argv = self.build_argv(input_path);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));

        if self.fuzz_stdin {
            let file = File::open(input_path).map_err(|e| TargetError::InputOpen {
                path: input_path.display().to_string(),
                reason: e.to_string(),
            })?;
            cmd.stdin(Stdio::from(file));
        } else if self.null_stdio {
            cmd.stdin(Stdio::null());
        }
        if self.null_stdio {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        if self.as_limit_mib > 0 {
            let limit = self.as_limit_mib * 1024 * 1024;
            unsafe {
                cmd.pre_exec(move || {
                    let rlim = libc::rlimit {
                        rlim_cur: limit,
                        rlim_max: limit,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlim) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        // Stable fingerprints need stable addresses.
        #[cfg(target_os = "linux")]
        if self.disable_randomization {
            unsafe {
                cmd.pre_exec(|| {
                    libc::personality(libc::ADDR_NO_RANDOMIZE as libc::c_ulong);
                    Ok(())
                });
            }
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| TargetError::Spawn {
            program: argv[0].clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let status = match child
            .wait_timeout(self.timeout)
            .map_err(|e| TargetError::Wait(e.to_string()))?
        {
            Some(status) => match status.signal() {
                Some(sig) => RunStatus::Signaled(sig),
                None => RunStatus::Exited(status.code().unwrap_or(-1)),
            },
            None => {
                // Deadline expired: kill and reap so no zombie lingers.
                drop(child.kill());
                drop(child.wait());
                RunStatus::TimedOut
            }
        };

        Ok(Observation {
            pid,
            wall_ms_elapsed: started.elapsed().as_millis() as u64,
            status,
            ..Observation::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn target_for(cmdline: Vec<&str>, timeout_s: u64) -> CommandTarget {
        let cfg = FuzzConfig {
            cmdline: cmdline.into_iter().map(str::to_string).collect(),
            input_path: Some(PathBuf::from("/unused")),
            timeout_s,
            null_stdio: true,
            ..FuzzConfig::default()
        };
        CommandTarget::from_config(&cfg)
    }

    #[test]
    fn placeholder_is_substituted_exactly_once() {
        let target = target_for(vec!["cat", FILE_PLACEHOLDER, "-v"], 3);
        let argv = target.build_argv(Path::new("/work/.in.fuzz"));
        assert_eq!(argv, vec!["cat", "/work/.in.fuzz", "-v"]);
        assert_eq!(
            argv.iter().filter(|a| a.as_str() == "/work/.in.fuzz").count(),
            1
        );
    }

    #[test]
    fn placeholder_survives_when_fuzzing_stdin() {
        let cfg = FuzzConfig {
            cmdline: vec!["cat".into(), FILE_PLACEHOLDER.into()],
            input_path: Some(PathBuf::from("/unused")),
            fuzz_stdin: true,
            ..FuzzConfig::default()
        };
        let target = CommandTarget::from_config(&cfg);
        let argv = target.build_argv(Path::new("/work/.in.fuzz"));
        assert_eq!(argv[1], FILE_PLACEHOLDER);
    }

    #[test]
    fn clean_exit_is_observed() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input");
        fs::write(&input, b"data").unwrap();

        let target = target_for(vec!["true", FILE_PLACEHOLDER], 3);
        let obs = target.run(&input).unwrap();
        assert_eq!(obs.status, RunStatus::Exited(0));
        assert!(obs.pid != 0);
        assert!(obs.frames.is_empty());
    }

    #[test]
    fn nonzero_exit_is_observed() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input");
        fs::write(&input, b"data").unwrap();

        let target = target_for(vec!["false"], 3);
        let obs = target.run(&input).unwrap();
        assert_eq!(obs.status, RunStatus::Exited(1));
    }

    #[test]
    fn signal_death_is_observed() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input");
        fs::write(&input, b"data").unwrap();

        // The shell kills itself with SIGSEGV.
        let target = target_for(vec!["sh", "-c", "kill -11 $$"], 3);
        let obs = target.run(&input).unwrap();
        assert_eq!(obs.status, RunStatus::Signaled(libc::SIGSEGV));
    }

    #[test]
    fn deadline_expiry_marks_the_observation_timed_out() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input");
        fs::write(&input, b"data").unwrap();

        let target = target_for(vec!["sleep", "60"], 1);
        let started = Instant::now();
        let obs = target.run(&input).unwrap();
        assert_eq!(obs.status, RunStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input");
        fs::write(&input, b"data").unwrap();

        let target = target_for(vec!["/nonexistent/no-such-target"], 3);
        assert!(matches!(
            target.run(&input),
            Err(TargetError::Spawn { .. })
        ));
    }

    #[test]
    fn stdin_delivery_feeds_the_input_file() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input");
        let echo = dir.path().join("copy");
        fs::write(&input, b"stdin-bytes").unwrap();

        let cfg = FuzzConfig {
            cmdline: vec![
                "sh".into(),
                "-c".into(),
                format!("cat > {}", echo.display()),
            ],
            input_path: Some(PathBuf::from("/unused")),
            fuzz_stdin: true,
            timeout_s: 3,
            ..FuzzConfig::default()
        };
        let target = CommandTarget::from_config(&cfg);
        let obs = target.run(&input).unwrap();
        assert_eq!(obs.status, RunStatus::Exited(0));
        assert_eq!(fs::read(&echo).unwrap(), b"stdin-bytes");
    }
}
