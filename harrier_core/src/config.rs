use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Literal argv token replaced with the per-run input path.
pub const FILE_PLACEHOLDER: &str = "___FILE___";

/// Default name of the textual crash report inside the workspace.
pub const REPORT_FILE: &str = "HONGGFUZZ.REPORT.TXT";

/// Workspace subdirectory used as sanitizer-coverage scratch space.
pub const SANCOV_DIR: &str = "HF_SANCOV";

/// Smallest per-run timeout that leaves sanitizer-coverage runs enough
/// room to flush their data.
const SANCOV_MIN_TIMEOUT_S: u64 = 15;

/// Errors raised while building or validating a [`FuzzConfig`].
///
/// All of these are fatal at startup; none can occur once fuzzing runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No target command line given")]
    MissingCmdline,
    #[error("The command line contains more than one {FILE_PLACEHOLDER} token")]
    MultiplePlaceholders,
    #[error("The command line does not contain the {FILE_PLACEHOLDER} token and stdin fuzzing is off")]
    MissingPlaceholder,
    #[error("No input corpus given and neither dynamic feedback nor an external mutator is enabled")]
    MissingInput,
    #[error("Flip rate {0} is outside [0.0, 1.0]")]
    FlipRateRange(f64),
    #[error("At least one worker thread is required")]
    NoThreads,
    #[error("Maximal file size must be non-zero")]
    ZeroMaxFileSz,
    #[error("Sanitizer coverage and dynamic perf feedback are mutually exclusive")]
    SancovWithDynamic,
    #[error("Timeout {0}s is too small for sanitizer coverage feedback (minimum {SANCOV_MIN_TIMEOUT_S}s)")]
    SancovTimeoutTooShort(u64),
    #[error("File extension '{0}' must not contain '/'")]
    FileExtnHasSlash(String),
    #[error("Stackhash blacklist is not sorted in ascending order")]
    BlacklistUnsorted,
    #[error("Bad stackhash blacklist entry at line {line}: '{value}'")]
    BadBlacklistEntry { line: usize, value: String },
    #[error("Config I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}

/// Which feedback counters drive the dynamic "best input" loop.
///
/// An empty selection disables dynamic feedback entirely and the engine
/// falls back to static or external preparation.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct CounterSelection {
    pub instr: bool,
    pub branch: bool,
    pub unique_block: bool,
    pub unique_edge: bool,
    pub custom: bool,
}

impl CounterSelection {
    pub fn any(&self) -> bool {
        self.instr || self.branch || self.unique_block || self.unique_edge || self.custom
    }
}

/// The preparation strategy governing one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    Static,
    Dynamic,
    External,
}

/// Immutable fuzzing configuration, shared by reference after startup.
///
/// Field semantics follow the CLI surface one to one; see the binary crate
/// for the flag mapping and defaults.
#[derive(Deserialize, Debug, Clone)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FuzzConfig {
    /// Target argv template, containing at most one [`FILE_PLACEHOLDER`] token.
    pub cmdline: Vec<String>,
    /// Seed file or directory. May be absent in dynamic or external mode.
    pub input_path: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub file_extn: String,
    pub max_file_sz: usize,
    pub flip_rate: f64,
    pub threads_max: usize,
    /// Total iteration budget; 0 means unbounded.
    pub mutations_max: u64,
    pub timeout_s: u64,
    pub fuzz_stdin: bool,
    pub null_stdio: bool,
    pub save_unique: bool,
    pub use_screen: bool,
    pub use_verifier: bool,
    pub use_simplifier: bool,
    pub save_maps: bool,
    pub disable_randomization: bool,
    pub counters: CounterSelection,
    pub use_sancov: bool,
    pub external_command: Option<PathBuf>,
    pub dictionary: Vec<Vec<u8>>,
    /// Sorted ascending; see [`parse_stackhash_blacklist`].
    pub stackhash_blacklist: Vec<u64>,
    pub symbol_blacklist: Vec<String>,
    pub symbol_whitelist: Vec<String>,
    pub report_file: Option<PathBuf>,
    /// `KEY=VAL` pairs passed to the target environment.
    pub envs: Vec<String>,
    pub as_limit_mib: u64,
    pub attach_pid: Option<u32>,
    pub attach_pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub debug_level: u8,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            cmdline: Vec::new(),
            input_path: None,
            work_dir: PathBuf::from("."),
            file_extn: "fuzz".to_string(),
            max_file_sz: 1024 * 1024,
            flip_rate: 0.001,
            threads_max: 2,
            mutations_max: 0,
            timeout_s: 3,
            fuzz_stdin: false,
            null_stdio: false,
            save_unique: true,
            use_screen: true,
            use_verifier: false,
            use_simplifier: false,
            save_maps: false,
            disable_randomization: true,
            counters: CounterSelection::default(),
            use_sancov: false,
            external_command: None,
            dictionary: Vec::new(),
            stackhash_blacklist: Vec::new(),
            symbol_blacklist: Vec::new(),
            symbol_whitelist: Vec::new(),
            report_file: None,
            envs: Vec::new(),
            as_limit_mib: 0,
            attach_pid: None,
            attach_pid_file: None,
            log_file: None,
            debug_level: 3,
        }
    }
}

impl FuzzConfig {
    /// Loads a configuration from a TOML file and validates it.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        let config: FuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Selects the preparation strategy for this run.
    ///
    /// Precedence when several are requested: dynamic feedback, then the
    /// external mutator, then static seed mutation.
    pub fn prepare_mode(&self) -> PrepareMode {
        if self.counters.any() {
            PrepareMode::Dynamic
        } else if self.external_command.is_some() {
            PrepareMode::External
        } else {
            PrepareMode::Static
        }
    }

    /// Resolved path of the textual report file.
    pub fn report_path(&self) -> PathBuf {
        self.report_file
            .clone()
            .unwrap_or_else(|| self.work_dir.join(REPORT_FILE))
    }

    /// Checks the cross-field invariants. Fatal at startup on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cmdline.is_empty() {
            return Err(ConfigError::MissingCmdline);
        }
        let placeholders = self
            .cmdline
            .iter()
            .filter(|tok| tok.as_str() == FILE_PLACEHOLDER)
            .count();
        if placeholders > 1 {
            return Err(ConfigError::MultiplePlaceholders);
        }
        // Without the placeholder every run would exec the same fixed
        // argv, so the target never sees the mutated input.
        if !self.fuzz_stdin && placeholders == 0 {
            return Err(ConfigError::MissingPlaceholder);
        }
        if self.input_path.is_none() && self.prepare_mode() == PrepareMode::Static {
            return Err(ConfigError::MissingInput);
        }
        if !(0.0..=1.0).contains(&self.flip_rate) {
            return Err(ConfigError::FlipRateRange(self.flip_rate));
        }
        if self.threads_max == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.max_file_sz == 0 {
            return Err(ConfigError::ZeroMaxFileSz);
        }
        // Crash and temp file names embed the extension and join onto
        // work_dir; a separator would let them escape the workspace.
        if self.file_extn.contains('/') {
            return Err(ConfigError::FileExtnHasSlash(self.file_extn.clone()));
        }
        if self.use_sancov && self.counters.any() {
            return Err(ConfigError::SancovWithDynamic);
        }
        if self.use_sancov && self.timeout_s < SANCOV_MIN_TIMEOUT_S {
            return Err(ConfigError::SancovTimeoutTooShort(self.timeout_s));
        }
        if self.stackhash_blacklist.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::BlacklistUnsorted);
        }
        Ok(())
    }
}

/// Parses a wordlist file of NUL-delimited tokens into dictionary entries.
pub fn parse_wordlist(path: &Path) -> Result<Vec<Vec<u8>>, ConfigError> {
    let raw = fs::read(path)?;
    let words: Vec<Vec<u8>> = raw
        .split(|&b| b == 0)
        .filter(|w| !w.is_empty())
        .map(|w| w.to_vec())
        .collect();
    log::info!("Loaded {} words from the dictionary {:?}", words.len(), path);
    Ok(words)
}

/// Parses a stackhash blacklist file with one 64-bit value per line,
/// accepting decimal or `0x`-prefixed hex. The result is sorted and
/// deduplicated so lookups can bisect.
pub fn parse_stackhash_blacklist(path: &Path) -> Result<Vec<u64>, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut hashes = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let entry = line.trim();
        if entry.is_empty() {
            continue;
        }
        let parsed = match entry.strip_prefix("0x").or_else(|| entry.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => entry.parse::<u64>(),
        };
        match parsed {
            Ok(value) => hashes.push(value),
            Err(_) => {
                return Err(ConfigError::BadBlacklistEntry {
                    line: idx + 1,
                    value: entry.to_string(),
                })
            }
        }
    }
    hashes.sort_unstable();
    hashes.dedup();
    log::info!(
        "Loaded {} stackhash blacklist entries from {:?}",
        hashes.len(),
        path
    );
    Ok(hashes)
}

/// Parses a symbol list file with one name per line, skipping blanks.
pub fn parse_symbols_list(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn minimal_config() -> FuzzConfig {
        FuzzConfig {
            cmdline: vec!["/bin/true".into(), FILE_PLACEHOLDER.into()],
            input_path: Some(PathBuf::from("/tmp/seed")),
            ..FuzzConfig::default()
        }
    }

    #[test]
    fn minimal_config_validates() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn empty_cmdline_is_rejected() {
        let config = FuzzConfig {
            cmdline: Vec::new(),
            ..minimal_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingCmdline)));
    }

    #[test]
    fn duplicate_placeholder_is_rejected() {
        let config = FuzzConfig {
            cmdline: vec![
                "/bin/cat".into(),
                FILE_PLACEHOLDER.into(),
                FILE_PLACEHOLDER.into(),
            ],
            ..minimal_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MultiplePlaceholders)
        ));
    }

    #[test]
    fn missing_placeholder_without_stdin_delivery_is_rejected() {
        let config = FuzzConfig {
            cmdline: vec!["/bin/target".into()],
            ..minimal_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPlaceholder)
        ));
    }

    #[test]
    fn stdin_delivery_permits_a_placeholder_free_cmdline() {
        let config = FuzzConfig {
            cmdline: vec!["/bin/target".into()],
            fuzz_stdin: true,
            ..minimal_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_extension_with_a_separator_is_rejected() {
        let config = FuzzConfig {
            file_extn: "../../etc/pwned".into(),
            ..minimal_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FileExtnHasSlash(_))
        ));
    }

    #[test]
    fn sancov_requires_a_generous_timeout() {
        let short = FuzzConfig {
            use_sancov: true,
            timeout_s: 3,
            ..minimal_config()
        };
        assert!(matches!(
            short.validate(),
            Err(ConfigError::SancovTimeoutTooShort(3))
        ));

        let generous = FuzzConfig {
            use_sancov: true,
            timeout_s: 15,
            ..minimal_config()
        };
        assert!(generous.validate().is_ok());
    }

    #[test]
    fn static_mode_requires_an_input_path() {
        let config = FuzzConfig {
            input_path: None,
            ..minimal_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingInput)));
    }

    #[test]
    fn dynamic_mode_permits_missing_input() {
        let config = FuzzConfig {
            input_path: None,
            counters: CounterSelection {
                instr: true,
                ..CounterSelection::default()
            },
            ..minimal_config()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.prepare_mode(), PrepareMode::Dynamic);
    }

    #[test]
    fn external_mode_permits_missing_input() {
        let config = FuzzConfig {
            input_path: None,
            external_command: Some(PathBuf::from("/usr/bin/radamsa")),
            ..minimal_config()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.prepare_mode(), PrepareMode::External);
    }

    #[test]
    fn dynamic_takes_precedence_over_external() {
        let config = FuzzConfig {
            counters: CounterSelection {
                branch: true,
                ..CounterSelection::default()
            },
            external_command: Some(PathBuf::from("/usr/bin/radamsa")),
            ..minimal_config()
        };
        assert_eq!(config.prepare_mode(), PrepareMode::Dynamic);
    }

    #[test]
    fn sancov_conflicts_with_dynamic_feedback() {
        let config = FuzzConfig {
            use_sancov: true,
            counters: CounterSelection {
                instr: true,
                ..CounterSelection::default()
            },
            ..minimal_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SancovWithDynamic)
        ));
    }

    #[test]
    fn flip_rate_outside_unit_interval_is_rejected() {
        let config = FuzzConfig {
            flip_rate: 1.5,
            ..minimal_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FlipRateRange(_))
        ));
    }

    #[test]
    fn unsorted_blacklist_is_rejected() {
        let config = FuzzConfig {
            stackhash_blacklist: vec![9, 3],
            ..minimal_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BlacklistUnsorted)
        ));
    }

    #[test]
    fn wordlist_parses_nul_delimited_tokens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dict");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"GET\0POST\0\0HEAD\0").unwrap();
        drop(file);

        let words = parse_wordlist(&path).unwrap();
        assert_eq!(
            words,
            vec![b"GET".to_vec(), b"POST".to_vec(), b"HEAD".to_vec()]
        );
    }

    #[test]
    fn stackhash_blacklist_parses_sorts_and_dedups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bl");
        fs::write(&path, "0xdeadbeef\n42\n\n0x10\n42\n").unwrap();

        let hashes = parse_stackhash_blacklist(&path).unwrap();
        assert_eq!(hashes, vec![0x10, 42, 0xdeadbeef]);
    }

    #[test]
    fn stackhash_blacklist_rejects_garbage_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bl");
        fs::write(&path, "12\nnot-a-number\n").unwrap();

        assert!(matches!(
            parse_stackhash_blacklist(&path),
            Err(ConfigError::BadBlacklistEntry { line: 2, .. })
        ));
    }

    #[test]
    fn symbols_list_skips_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("symbols");
        fs::write(&path, "malloc\n\n  free  \n").unwrap();

        let symbols = parse_symbols_list(&path).unwrap();
        assert_eq!(symbols, vec!["malloc".to_string(), "free".to_string()]);
    }

    #[test]
    fn load_from_file_round_trips_a_toml_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harrier.toml");
        fs::write(
            &path,
            r#"
cmdline = ["/bin/true", "___FILE___"]
input-path = "/tmp/seeds"
threads-max = 4
timeout-s = 5
"#,
        )
        .unwrap();

        let config = FuzzConfig::load_from_file(&path).unwrap();
        assert_eq!(config.threads_max, 4);
        assert_eq!(config.timeout_s, 5);
        assert_eq!(config.prepare_mode(), PrepareMode::Static);
    }
}
