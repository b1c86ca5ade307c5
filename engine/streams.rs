//! Deterministic random streams.
//!
//! Each draw in a simulation is identified by a stream tag, a subject id and a
//! Monte Carlo realization id. The generator for that key is seeded from a
//! stable mix of the master seed and the key, so a draw never depends on the
//! order in which threads happen to request it.

use crate::types::HierarchicalLevel;
use rand::SeedableRng;
use rand::rngs::StdRng;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Names the purpose of a draw so that streams for different purposes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTag {
    Parameters,
    RandomEffect(HierarchicalLevel),
    Residual,
    Event,
}

impl StreamTag {
    fn code(self) -> u64 {
        match self {
            Self::Parameters => 1,
            Self::RandomEffect(HierarchicalLevel::Tree) => 2,
            Self::RandomEffect(HierarchicalLevel::Plot) => 3,
            Self::RandomEffect(HierarchicalLevel::Interval) => 4,
            Self::RandomEffect(HierarchicalLevel::Year) => 5,
            Self::Residual => 6,
            Self::Event => 7,
        }
    }
}

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Stable 64-bit seed for one (tag, subject, realization) key.
pub fn stream_seed(master_seed: u64, tag: StreamTag, subject_id: &str, realization: u32) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in subject_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    let mut seed = splitmix64(master_seed ^ hash);
    seed = splitmix64(seed ^ tag.code());
    splitmix64(seed ^ u64::from(realization))
}

pub fn stream_rng(master_seed: u64, tag: StreamTag, subject_id: &str, realization: u32) -> StdRng {
    StdRng::seed_from_u64(stream_seed(master_seed, tag, subject_id, realization))
}
