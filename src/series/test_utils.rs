use crate::common::types::{Sample, Timestamp};
use rand::{Rng, SeedableRng};

/// Monotonic counter samples spaced `interval` apart, with a reset to a small value at
/// `reset_at` when given.
pub fn generate_counter_samples(
    seed: u64,
    start: Timestamp,
    interval: i64,
    count: usize,
    reset_at: Option<usize>,
) -> Vec<Sample> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut value: f64 = rng.gen_range(0.0_f64..100.0).floor();
    let mut vec = Vec::with_capacity(count);
    for i in 0..count {
        if Some(i) == reset_at {
            value = rng.gen_range(0.0_f64..5.0).floor();
        } else if i > 0 {
            value += rng.gen_range(1.0..20.0_f64).floor();
        }
        vec.push(Sample::new(start + i as i64 * interval, value));
    }
    vec
}

pub fn generate_random_samples(seed: u64, start: Timestamp, interval: i64, count: usize) -> Vec<Sample> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut vec = Vec::with_capacity(count);
    for i in 0..count {
        let value: f64 = if rng.gen_bool(0.5) {
            rng.gen_range(-10000.0..10000.0)
        } else {
            rng.gen_range(0.0..100.0)
        };
        vec.push(Sample::new(start + i as i64 * interval, value));
    }
    vec
}
