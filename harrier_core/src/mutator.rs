use crate::config::FuzzConfig;
use crate::util;
use rand_core::RngCore;

/// A `Mutator` edits input bytes in place between corpus selection and
/// target execution.
///
/// The engine never inspects how bytes change; it only sequences the three
/// phases. `resize` may grow or shrink the buffer within `[1, max_sz]`,
/// `mangle` rewrites content at some flip rate, and `post_mangle` gives
/// structure-aware implementations a final fixup pass (checksums, length
/// fields and the like). The default `post_mangle` does nothing.
pub trait Mutator: Send + Sync {
    fn resize(&self, buf: &mut Vec<u8>, max_sz: usize, rng: &mut dyn RngCore);
    fn mangle(&self, buf: &mut [u8], rng: &mut dyn RngCore);
    fn post_mangle(&self, _buf: &mut Vec<u8>, _rng: &mut dyn RngCore) {}
}

/// Byte-flipping mutator driven by `flip_rate` and an optional dictionary.
///
/// Each mangle pass rewrites roughly `flip_rate * len` positions (at least
/// one). One change in eight splices a dictionary word over the buffer
/// instead of rewriting a single byte, when a dictionary is loaded.
#[derive(Debug, Default, Clone)]
pub struct BitFlipMutator {
    flip_rate: f64,
    dictionary: Vec<Vec<u8>>,
}

/// One resize in this many mangle rounds, on average.
const RESIZE_ONE_IN: u64 = 16;
/// One dictionary splice in this many byte changes, on average.
const DICT_ONE_IN: u64 = 8;

impl BitFlipMutator {
    pub fn new(flip_rate: f64, dictionary: Vec<Vec<u8>>) -> Self {
        Self {
            flip_rate,
            dictionary,
        }
    }

    pub fn from_config(cfg: &FuzzConfig) -> Self {
        Self::new(cfg.flip_rate, cfg.dictionary.clone())
    }
}

impl Mutator for BitFlipMutator {
    fn resize(&self, buf: &mut Vec<u8>, max_sz: usize, rng: &mut dyn RngCore) {
        if max_sz == 0 || util::rnd_range(rng, 0, RESIZE_ONE_IN - 1) != 0 {
            return;
        }
        let new_sz = util::rnd_range(rng, 1, max_sz as u64) as usize;
        buf.resize(new_sz, 0);
    }

    fn mangle(&self, buf: &mut [u8], rng: &mut dyn RngCore) {
        if buf.is_empty() {
            return;
        }
        let changes = ((buf.len() as f64 * self.flip_rate) as usize).max(1);
        for _ in 0..changes {
            let off = util::rnd_range(rng, 0, buf.len() as u64 - 1) as usize;
            let use_dict =
                !self.dictionary.is_empty() && util::rnd_range(rng, 0, DICT_ONE_IN - 1) == 0;
            if use_dict {
                let word =
                    &self.dictionary[util::rnd_range(rng, 0, self.dictionary.len() as u64 - 1)
                        as usize];
                let len = word.len().min(buf.len() - off);
                buf[off..off + len].copy_from_slice(&word[..len]);
            } else {
                buf[off] = rng.next_u64() as u8;
            }
        }
    }
}
