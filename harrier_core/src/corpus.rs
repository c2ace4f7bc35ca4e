use crate::config::{FuzzConfig, PrepareMode};
use crate::util;
use rand_core::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the synthetic corpus entry used when dynamic feedback runs
/// without an input corpus.
pub const DYNAMIC_SEED_NAME: &str = "DYNAMIC_FILE";

/// Name of the synthetic corpus entry used when the external mutator is
/// responsible for creating inputs from scratch.
pub const EXTERNAL_SEED_NAME: &str = "CREATED";

/// Errors that can occur while building or reading the seed corpus.
///
/// All variants except [`CorpusError::SyntheticSeed`] and the read-time
/// I/O failures are fatal at startup only.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// No input path was configured and the preparation mode requires one.
    #[error("No input file or directory specified")]
    NoInput,
    /// A directory was given but none of its entries qualified as a seed.
    #[error("Directory {0:?} contains no usable seed files")]
    NoUsableSeeds(PathBuf),
    /// The input path is neither a regular file nor a directory.
    #[error("{0:?} is not a regular file, nor a directory")]
    NotRegular(PathBuf),
    /// A seed exceeds the configured maximal file size.
    #[error("Seed {path:?} is bigger than the maximal file size ({size} > {max})")]
    SeedTooLarge {
        path: PathBuf,
        size: u64,
        max: usize,
    },
    /// A seed read back empty; an empty buffer cannot be mutated usefully.
    #[error("Seed {0:?} is empty")]
    EmptySeed(PathBuf),
    /// An attempt was made to read through a synthetic placeholder entry.
    #[error("Synthetic corpus entry '{0}' has no backing file")]
    SyntheticSeed(&'static str),
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// One corpus slot: either a real seed file or a typed placeholder that
/// keeps the corpus non-empty in dynamic and external modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedEntry {
    File(PathBuf),
    Synthetic(&'static str),
}

/// The immutable list of seed inputs mutations are derived from.
#[derive(Debug)]
pub struct SeedCorpus {
    entries: Vec<SeedEntry>,
    max_file_sz: usize,
}

impl SeedCorpus {
    /// Builds the corpus from the configuration.
    ///
    /// A directory input keeps only regular files whose size lies in
    /// `(0, max_file_sz]`. A missing input path is allowed only when
    /// dynamic feedback or the external mutator will produce inputs, in
    /// which case a single synthetic entry satisfies the non-empty
    /// invariant without ever being dereferenced as a path.
    pub fn from_config(cfg: &FuzzConfig) -> Result<Self, CorpusError> {
        let input = match &cfg.input_path {
            Some(path) => path,
            None => match cfg.prepare_mode() {
                PrepareMode::Dynamic => {
                    return Ok(Self {
                        entries: vec![SeedEntry::Synthetic(DYNAMIC_SEED_NAME)],
                        max_file_sz: cfg.max_file_sz,
                    })
                }
                PrepareMode::External => {
                    log::info!(
                        "No input corpus specified, the external command {:?} is responsible for creating the fuzz files",
                        cfg.external_command
                    );
                    return Ok(Self {
                        entries: vec![SeedEntry::Synthetic(EXTERNAL_SEED_NAME)],
                        max_file_sz: cfg.max_file_sz,
                    });
                }
                PrepareMode::Static => return Err(CorpusError::NoInput),
            },
        };

        let meta = fs::metadata(input)
            .map_err(|e| CorpusError::Io(format!("Couldn't stat {:?}: {}", input, e)))?;

        if meta.is_dir() {
            return Self::from_dir(input, cfg.max_file_sz);
        }
        if !meta.is_file() {
            return Err(CorpusError::NotRegular(input.clone()));
        }
        if meta.len() > cfg.max_file_sz as u64 {
            return Err(CorpusError::SeedTooLarge {
                path: input.clone(),
                size: meta.len(),
                max: cfg.max_file_sz,
            });
        }
        Ok(Self {
            entries: vec![SeedEntry::File(input.clone())],
            max_file_sz: cfg.max_file_sz,
        })
    }

    fn from_dir(dir: &Path, max_file_sz: usize) -> Result<Self, CorpusError> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(dir)
            .map_err(|e| CorpusError::Io(format!("Couldn't open dir {:?}: {}", dir, e)))?
        {
            let dirent = dirent
                .map_err(|e| CorpusError::Io(format!("Couldn't read dir {:?}: {}", dir, e)))?;
            let path = dirent.path();
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    log::warn!("Couldn't stat {:?}, skipping: {}", path, e);
                    continue;
                }
            };
            if !meta.is_file() {
                log::debug!("{:?} is not a regular file, skipping", path);
                continue;
            }
            if meta.len() == 0 {
                log::debug!("{:?} is empty, skipping", path);
                continue;
            }
            if meta.len() > max_file_sz as u64 {
                log::warn!(
                    "{:?} is bigger than the maximal file size ({} > {}), skipping",
                    path,
                    meta.len(),
                    max_file_sz
                );
                continue;
            }
            entries.push(SeedEntry::File(path));
        }

        if entries.is_empty() {
            return Err(CorpusError::NoUsableSeeds(dir.to_path_buf()));
        }
        log::info!("{} input files have been added to the list", entries.len());
        Ok(Self {
            entries,
            max_file_sz,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uniform random index into the seed list.
    pub fn pick(&self, rng: &mut dyn RngCore) -> usize {
        util::rnd_range(rng, 0, self.entries.len() as u64 - 1) as usize
    }

    pub fn entry(&self, idx: usize) -> &SeedEntry {
        &self.entries[idx]
    }

    /// Display name of a seed: the file basename, or the placeholder name.
    pub fn basename(&self, idx: usize) -> String {
        match &self.entries[idx] {
            SeedEntry::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
            SeedEntry::Synthetic(name) => (*name).to_string(),
        }
    }

    /// Reads a seed into a fresh buffer, enforcing the size window.
    ///
    /// Synthetic entries are guarded here: reading one is a logic error in
    /// the caller, never a filesystem access.
    pub fn read_seed(&self, idx: usize) -> Result<Vec<u8>, CorpusError> {
        let path = match &self.entries[idx] {
            SeedEntry::File(path) => path,
            SeedEntry::Synthetic(name) => return Err(CorpusError::SyntheticSeed(name)),
        };
        let bytes = fs::read(path)
            .map_err(|e| CorpusError::Io(format!("Couldn't read {:?}: {}", path, e)))?;
        if bytes.is_empty() {
            return Err(CorpusError::EmptySeed(path.clone()));
        }
        if bytes.len() > self.max_file_sz {
            return Err(CorpusError::SeedTooLarge {
                path: path.clone(),
                size: bytes.len() as u64,
                max: self.max_file_sz,
            });
        }
        Ok(bytes)
    }
}
