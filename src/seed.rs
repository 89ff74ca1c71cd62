//! Deterministic seed derivation for the random streams of a run.
//!
//! Every random outcome of a run is drawn from a stream whose seed is derived from the
//! master seed, the tempering stage and a stream slot. Mutation streams are keyed by the
//! *global* particle index so that a run gives the same particles for any number of ranks.

use rand::rngs::SmallRng;
use rand::SeedableRng;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

const INIT_STREAM: u64 = 0x1;
const RESAMPLE_STREAM: u64 = 0x2;
const MUTATION_STREAM: u64 = 0x3;

/// Hashes `(master_seed, substream)` into a new seed.
pub fn derive_substream_seed(master_seed: u64, substream: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(master_seed);
    hasher.write_u64(substream);
    hasher.finish()
}

fn stream_seed(master_seed: u64, stream: u64, stage: usize, slot: usize) -> u64 {
    let intermediate = derive_substream_seed(master_seed, stream << 48 | stage as u64);
    derive_substream_seed(intermediate, slot as u64)
}

/// RNG used to draw the initial value of the particle with global index `particle`.
pub fn init_rng(master_seed: u64, particle: usize) -> SmallRng {
    SmallRng::seed_from_u64(stream_seed(master_seed, INIT_STREAM, 0, particle))
}

/// RNG shared by every rank for the resampling draw of `stage`.
pub fn resample_rng(master_seed: u64, stage: usize) -> SmallRng {
    SmallRng::seed_from_u64(stream_seed(master_seed, RESAMPLE_STREAM, stage, 0))
}

/// RNG used to mutate the particle with global index `particle` during `stage`.
pub fn mutation_rng(master_seed: u64, stage: usize, particle: usize) -> SmallRng {
    SmallRng::seed_from_u64(stream_seed(master_seed, MUTATION_STREAM, stage, particle))
}
