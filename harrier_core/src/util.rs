use rand_core::RngCore;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Program name used in temp-file names and log prefixes.
pub const PROG_NAME: &str = "harrier";

/// Returns a uniformly distributed value in the inclusive range `[lo, hi]`.
///
/// Used for seed selection and mutation decisions. The modulo bias for
/// ranges far below `u64::MAX` is negligible for fuzzing purposes.
pub fn rnd_range(rng: &mut dyn RngCore, lo: u64, hi: u64) -> u64 {
    debug_assert!(lo <= hi, "rnd_range called with lo > hi");
    if lo == 0 && hi == u64::MAX {
        return rng.next_u64();
    }
    lo + rng.next_u64() % (hi - lo + 1)
}

static PROC_START: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since the first call in this process.
///
/// Differences between two calls measure iteration latency; the absolute
/// value carries no meaning across processes.
pub fn now_millis() -> u64 {
    let start = *PROC_START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Wall-clock seconds since the Unix epoch, for filename stamping.
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builds a unique temp input path inside `work_dir`:
/// `.<prog>.<pid>.<unix_seconds>.<62-bit-hex-random>.<extn>`.
///
/// The leading dot keeps transient inputs out of the way of crash files;
/// the random component makes collisions between concurrent workers
/// practically impossible. Create-exclusive opens remain the final
/// authority.
pub fn temp_input_path(work_dir: &Path, extn: &str, rng: &mut dyn RngCore) -> PathBuf {
    let name = format!(
        ".{}.{}.{}.{:x}.{}",
        PROG_NAME,
        std::process::id(),
        unix_seconds(),
        rnd_range(rng, 0, 1u64 << 62),
        extn
    );
    work_dir.join(name)
}
