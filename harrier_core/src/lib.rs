pub mod classifier;
pub mod config;
pub mod corpus;
pub mod executor;
pub mod feedback;
pub mod mutator;
pub mod prepare;
pub mod report;
pub mod stats;
pub mod supervisor;
pub mod util;
pub mod worker;

pub use classifier::{CrashClassifier, ClassifierError, Verdict, SINGLE_FRAME_MASK, VERIFIER_ITER};
pub use config::{
    ConfigError, CounterSelection, FuzzConfig, PrepareMode, FILE_PLACEHOLDER, REPORT_FILE,
    SANCOV_DIR,
};
pub use corpus::{CorpusError, SeedCorpus, SeedEntry};
pub use executor::{CommandTarget, Observation, RunStatus, Target, TargetError};
pub use feedback::{CounterVector, FeedbackError, FeedbackStore, CURRENT_BEST};
pub use mutator::{BitFlipMutator, Mutator};
pub use prepare::{InputPreparer, PrepareError, TempInput};
pub use report::{CrashRecord, FileReporter, ReportError, Reporter};
pub use stats::{Tallies, TallySnapshot};
pub use supervisor::{RunSummary, SupervisorError};
pub use worker::Engine;
