use crate::common::*;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

/// Seedable source of standard normal noise vectors.
#[derive(Debug, Clone)]
pub struct NoiseSampler {
    rng: StdRng,
}

impl NoiseSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws a `[batch_size, dim, 1, 1]` tensor of independent samples.
    pub fn sample(&mut self, batch_size: usize, dim: usize, device: Device) -> Result<Tensor> {
        ensure!(
            batch_size > 0 && dim > 0,
            "batch_size and dim must be positive, but get batch_size = {}, dim = {}",
            batch_size,
            dim
        );

        let values: Vec<f32> = (&mut self.rng)
            .sample_iter(StandardNormal)
            .take(batch_size * dim)
            .collect();
        let noise = Tensor::of_slice(&values)
            .view([batch_size as i64, dim as i64, 1, 1])
            .to_device(device);
        Ok(noise)
    }
}
