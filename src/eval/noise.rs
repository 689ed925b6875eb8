//! Gaussian evaluation noise, used to weaken play on purpose.

use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::cache::PositionKey;
use crate::nn::Outputs;

/// Seed for one output of one position. Equal keys always get equal noise.
fn seed(key: &PositionKey, output: usize) -> u64 {
    let mut h: u64 = 0xCBF2_9CE4_8422_2325;
    for &b in key {
        h = (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01B3);
    }
    (h ^ output as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Add `N(0, sigma)` to every output. With `deterministic`, the noise is a
/// function of the position key only.
pub fn add_noise(outputs: &mut Outputs, key: &PositionKey, sigma: f32, deterministic: bool) {
    let Ok(normal) = Normal::new(0.0f32, sigma) else {
        log::warn!("ignoring invalid noise level {sigma}");
        return;
    };

    if deterministic {
        for (i, v) in outputs.iter_mut().enumerate() {
            let mut rng = StdRng::seed_from_u64(seed(key, i));
            *v += normal.sample(&mut rng);
        }
    } else {
        let mut rng = thread_rng();
        for v in outputs.iter_mut() {
            *v += rng.sample(normal);
        }
    }
}
