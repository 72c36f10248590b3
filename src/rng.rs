//! Seeded random streams.
//!
//! Every random decision in a run derives from one run seed. Each consumer (a day's sub-sampling,
//! a day's bucket draws, a bucket's permutation) gets its own ChaCha stream so that work can be
//! replayed independently and in any order, on any thread, with identical results.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// The purpose a random stream is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngStream {
    /// Label-0 sub-sampling draws of one input day.
    SubSample,
    /// Target-bucket draws of one source day (shuffle pass 1).
    BucketDraw,
    /// Permutation of one target bucket (shuffle pass 2).
    Permutation,
}

impl RngStream {
    fn tag(self) -> u64 {
        match self {
            Self::SubSample => 1,
            Self::BucketDraw => 2,
            Self::Permutation => 3,
        }
    }
}

/// Build the random stream for `purpose` and day/bucket `index`.
pub fn stream_rng(seed: u64, purpose: RngStream, index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream((purpose.tag() << 48) | index as u64);
    rng
}
