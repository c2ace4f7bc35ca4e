use clap::Parser;
use harrier_core::config::{self, CounterSelection, FuzzConfig};
use harrier_core::{supervisor, BitFlipMutator, CommandTarget, Engine, FileReporter, SeedCorpus};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "harrier",
    about = "Coverage-guided fuzzer: mutates corpus inputs, supervises the target per run and keeps unique crashes",
    disable_version_flag = true,
    arg_required_else_help = true
)]
struct Cli {
    /// Path to the file corpus (file or a directory)
    #[arg(short = 'f', long = "input")]
    input: Option<PathBuf>,

    /// Null-ify children's stdin, stdout, stderr; make them quiet
    #[arg(short = 'q', long = "nullify_stdio")]
    nullify_stdio: bool,

    /// Provide fuzzing input on STDIN, instead of ___FILE___
    #[arg(short = 's', long = "stdin_input")]
    stdin_input: bool,

    /// Save all test-cases (not only the unique ones) by appending the current time-stamp to the filenames
    #[arg(short = 'u', long = "save_all")]
    save_all: bool,

    /// Log file
    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,

    /// Disable ANSI console; use simple log output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Enable crashes verifier
    #[arg(short = 'V', long = "verifier")]
    verifier: bool,

    /// Enable proc maps saving
    #[arg(short = 'M', long = "proc_maps")]
    proc_maps: bool,

    /// Enable crashes simplifier
    #[arg(short = 'S', long = "simplifier")]
    simplifier: bool,

    /// Debug level (0 - FATAL ... 4 - DEBUG)
    #[arg(short = 'd', long = "debug_level", default_value_t = 3)]
    debug_level: u8,

    /// Input file extension (e.g. 'swf')
    #[arg(short = 'e', long = "extension", default_value = "fuzz")]
    extension: String,

    /// Workspace directory to save crashes and runtime files
    #[arg(short = 'W', long = "workspace", default_value = ".")]
    workspace: PathBuf,

    /// Maximal flip rate
    #[arg(short = 'r', long = "flip_rate", default_value_t = 0.001)]
    flip_rate: f64,

    /// Wordlist file (tokens delimited by NUL-bytes)
    #[arg(short = 'w', long = "wordlist")]
    wordlist: Option<PathBuf>,

    /// Symbols blacklist file (one entry per line)
    #[arg(short = 'b', long = "symbols_bl")]
    symbols_bl: Option<PathBuf>,

    /// Symbols whitelist file (one entry per line)
    #[arg(short = 'A', long = "symbols_wl")]
    symbols_wl: Option<PathBuf>,

    /// Stackhashes blacklist file (one entry per line)
    #[arg(short = 'B', long = "stackhash_bl")]
    stackhash_bl: Option<PathBuf>,

    /// External command modifying the input corpus of files
    #[arg(short = 'c', long = "mutate_cmd")]
    mutate_cmd: Option<PathBuf>,

    /// Timeout in seconds
    #[arg(short = 't', long = "timeout", default_value_t = 3)]
    timeout: u64,

    /// Number of concurrent fuzzing threads
    #[arg(short = 'n', long = "threads", default_value_t = 2)]
    threads: usize,

    /// Number of fuzzing iterations (0 = no limit)
    #[arg(short = 'N', long = "iterations", default_value_t = 0)]
    iterations: u64,

    /// Maximal size of files processed by the fuzzer in bytes
    #[arg(short = 'F', long = "max_file_size", default_value_t = 1024 * 1024)]
    max_file_size: usize,

    /// Write report to this file
    #[arg(short = 'R', long = "report")]
    report: Option<PathBuf>,

    /// Pass this environment variable, can be used multiple times
    #[arg(short = 'E', long = "env")]
    env: Vec<String>,

    /// Per process memory limit in MiB (0 = no limit)
    #[arg(long = "rlimit_as", default_value_t = 0)]
    rlimit_as: u64,

    /// Enable sanitizer coverage feedback
    #[arg(short = 'C', long = "sancov")]
    sancov: bool,

    /// Attach to a pid (and its thread group)
    #[arg(short = 'p', long = "linux_pid")]
    linux_pid: Option<u32>,

    /// Attach to pid (and its thread group) read from file
    #[arg(short = 'P', long = "linux_file_pid")]
    linux_file_pid: Option<PathBuf>,

    /// Don't disable ASLR randomization, might be useful with MSAN
    #[arg(long = "linux_keep_aslr")]
    linux_keep_aslr: bool,

    /// Use the hardware instruction counter as feedback
    #[arg(long = "linux_perf_instr")]
    linux_perf_instr: bool,

    /// Use the hardware branch counter as feedback
    #[arg(long = "linux_perf_branch")]
    linux_perf_branch: bool,

    /// Count unique instruction pointers as feedback
    #[arg(long = "linux_perf_ip")]
    linux_perf_ip: bool,

    /// Count unique instruction pointer pairs (edges) as feedback
    #[arg(long = "linux_perf_ip_addr")]
    linux_perf_ip_addr: bool,

    /// Use a custom counter as feedback
    #[arg(long = "linux_perf_custom")]
    linux_perf_custom: bool,

    /// Target command line; use ___FILE___ where the input path belongs
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    cmdline: Vec<String>,
}

fn level_for(debug_level: u8) -> LevelFilter {
    match debug_level {
        0 | 1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn init_logging(debug_level: u8, logfile: Option<&Path>) -> Result<(), anyhow::Error> {
    let stderr = Appender::builder().build(
        "stderr",
        Box::new(
            ConsoleAppender::builder()
                .target(log4rs::append::console::Target::Stderr)
                .encoder(Box::new(PatternEncoder::new(
                    "{h({d(%Y-%m-%dT%H:%M:%S%Z)}\t{m}{n})}",
                )))
                .build(),
        ),
    );

    let mut builder = Config::builder().appender(stderr);
    let mut root = Root::builder().appender("stderr");
    if let Some(path) = logfile {
        let tofile = Appender::builder().build(
            "tofile",
            Box::new(
                FileAppender::builder()
                    .encoder(Box::new(PatternEncoder::new("{d}\t{l}\t{m}{n}")))
                    .build(path)
                    .map_err(|e| anyhow::anyhow!("Couldn't open log file {:?}: {}", path, e))?,
            ),
        );
        builder = builder.appender(tofile);
        root = root.appender("tofile");
    }
    let config = builder.build(root.build(level_for(debug_level)))?;
    log4rs::init_config(config)?;
    Ok(())
}

fn config_from_cli(cli: &Cli) -> Result<FuzzConfig, anyhow::Error> {
    let dictionary = match &cli.wordlist {
        Some(path) => config::parse_wordlist(path)?,
        None => Vec::new(),
    };
    let stackhash_blacklist = match &cli.stackhash_bl {
        Some(path) => config::parse_stackhash_blacklist(path)?,
        None => Vec::new(),
    };
    let symbol_blacklist = match &cli.symbols_bl {
        Some(path) => config::parse_symbols_list(path)?,
        None => Vec::new(),
    };
    let symbol_whitelist = match &cli.symbols_wl {
        Some(path) => config::parse_symbols_list(path)?,
        None => Vec::new(),
    };

    let config = FuzzConfig {
        cmdline: cli.cmdline.clone(),
        input_path: cli.input.clone(),
        work_dir: cli.workspace.clone(),
        file_extn: cli.extension.clone(),
        max_file_sz: cli.max_file_size,
        flip_rate: cli.flip_rate,
        threads_max: cli.threads,
        mutations_max: cli.iterations,
        timeout_s: cli.timeout,
        fuzz_stdin: cli.stdin_input,
        null_stdio: cli.nullify_stdio,
        save_unique: !cli.save_all,
        use_screen: !cli.verbose,
        use_verifier: cli.verifier,
        use_simplifier: cli.simplifier,
        save_maps: cli.proc_maps,
        disable_randomization: !cli.linux_keep_aslr,
        counters: CounterSelection {
            instr: cli.linux_perf_instr,
            branch: cli.linux_perf_branch,
            unique_block: cli.linux_perf_ip,
            unique_edge: cli.linux_perf_ip_addr,
            custom: cli.linux_perf_custom,
        },
        use_sancov: cli.sancov,
        external_command: cli.mutate_cmd.clone(),
        dictionary,
        stackhash_blacklist,
        symbol_blacklist,
        symbol_whitelist,
        report_file: cli.report.clone(),
        envs: cli.env.clone(),
        as_limit_mib: cli.rlimit_as,
        attach_pid: cli.linux_pid,
        attach_pid_file: cli.linux_file_pid.clone(),
        log_file: cli.logfile.clone(),
        debug_level: cli.debug_level,
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.debug_level, cli.logfile.as_deref())?;

    let cfg = Arc::new(config_from_cli(&cli)?);
    let corpus = Arc::new(SeedCorpus::from_config(&cfg)?);
    log::info!(
        "Fuzzing {:?} with {} seeds, {} threads, {:?} preparation",
        cfg.cmdline,
        corpus.len(),
        cfg.threads_max,
        cfg.prepare_mode()
    );

    let engine = Arc::new(Engine::new(
        Arc::clone(&cfg),
        corpus,
        Arc::new(BitFlipMutator::from_config(&cfg)),
        Arc::new(CommandTarget::from_config(&cfg)),
        Arc::new(FileReporter::new(cfg.report_path())),
    ));

    let summary = supervisor::run(engine)?;
    let tallies = summary.tallies;
    log::info!(
        "Done: {} iterations, {} crashes ({} unique, {} blacklisted, {} verified), {} timeouts",
        tallies.mutations,
        tallies.crashes,
        tallies.unique_crashes,
        tallies.blacklisted_crashes,
        tallies.verified_crashes,
        tallies.timeouts
    );
    Ok(())
}
