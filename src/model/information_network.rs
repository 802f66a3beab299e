use super::{
    linear::{Linear, LinearInit},
    spectral_norm::{SpectralNorm, SpectralNormInit},
};
use crate::common::*;

/// Recovers the noise vector that produced a generated region.
pub trait NoiseEstimator {
    /// Maps a `[B, 3, H, W]` region of class `class` to a `[B, n_output]`
    /// noise estimate.
    fn estimate_t(&mut self, region: &Tensor, class: usize, train: bool) -> Result<Tensor>;

    fn set_trainable(&self, _trainable: bool) {}
}

#[derive(Debug, Clone)]
pub struct InformationNetworkInit {
    pub init_gain: f64,
    pub base_channels: usize,
    pub n_classes: usize,
    pub n_output: usize,
    /// Channel factor of each convolution stage; every stage halves the
    /// spatial size.
    pub stage_factors: Vec<usize>,
}

impl InformationNetworkInit {
    pub fn new(init_gain: f64, base_channels: usize, n_classes: usize, n_output: usize) -> Self {
        Self {
            init_gain,
            base_channels,
            n_classes,
            n_output,
            stage_factors: vec![1, 2, 4, 8, 16],
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<InformationNetwork> {
        let path = path.borrow();
        let Self {
            init_gain,
            base_channels,
            n_classes,
            n_output,
            stage_factors,
        } = self;
        ensure!(n_classes > 0, "n_classes must be positive");
        ensure!(n_output > 0, "n_output must be positive");
        ensure!(!stage_factors.is_empty(), "at least one stage is required");

        let channels: Vec<_> = stage_factors
            .iter()
            .map(|&factor| base_channels * factor)
            .collect();
        let last_channels = *channels.last().unwrap();

        let convs: Vec<_> = izip!(iter::once(3).chain(channels.clone()), channels)
            .enumerate()
            .map(|(index, (in_c, out_c))| {
                SpectralNormInit::new(3, init_gain).build(
                    path / format!("conv_{}", index),
                    in_c,
                    out_c,
                )
            })
            .try_collect()?;

        let heads: Vec<_> = (0..n_classes)
            .map(|class| {
                LinearInit::new(init_gain).build(
                    path / format!("head_{}", class),
                    last_channels,
                    n_output,
                )
            })
            .try_collect()?;

        Ok(InformationNetwork { convs, heads })
    }
}

#[derive(Debug)]
pub struct InformationNetwork {
    convs: Vec<SpectralNorm>,
    heads: Vec<Linear>,
}

impl NoiseEstimator for InformationNetwork {
    fn estimate_t(&mut self, region: &Tensor, class: usize, train: bool) -> Result<Tensor> {
        let Self { convs, heads } = self;

        let (b, c, h, w) = region.size4().with_context(|| {
            format!(
                "expect region shape [B, 3, H, W], but get {:?}",
                region.size()
            )
        })?;
        ensure!(c == 3, "expect 3 region channels, but get {}", c);
        let min_size = 1i64 << convs.len();
        ensure!(
            h >= min_size && w >= min_size,
            "{} pooling stages need regions of at least {}x{}, but get {}x{}",
            convs.len(),
            min_size,
            min_size,
            h,
            w
        );
        let head = heads.get(class).ok_or_else(|| {
            format_err!(
                "class index {} is out of range for {} classes",
                class,
                heads.len()
            )
        })?;

        let xs = convs
            .iter_mut()
            .try_fold(region.shallow_clone(), |xs, conv| -> Result<_> {
                let xs = conv.forward_t(&xs, train)?.relu();
                Ok(xs.avg_pool2d(&[2, 2], &[2, 2], &[0, 0], false, true, None::<i64>))
            })?;
        let xs = xs.adaptive_avg_pool2d(&[1, 1]);
        let xs = xs.view([b, -1]);
        head.forward(&xs)
    }

    fn set_trainable(&self, trainable: bool) {
        self.convs
            .iter()
            .for_each(|conv| conv.set_trainable(trainable));
        self.heads
            .iter()
            .for_each(|head| head.set_trainable(trainable));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn information_network_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut network = InformationNetworkInit::new(1.0, 2, 3, 8).build(&root / "info")?;

        let region = Tensor::rand(&[2, 3, 128, 128], FLOAT_CPU) * 2.0 - 1.0;
        for class in 0..3 {
            let estimate = network.estimate_t(&region, class, true)?;
            assert_eq!(estimate.size(), vec![2, 8]);
        }

        // heads are independent per class
        let lhs = network.estimate_t(&region, 0, false)?;
        let rhs = network.estimate_t(&region, 1, false)?;
        ensure!(!lhs.allclose(&rhs, 1e-6, 1e-6, false));

        assert!(network.estimate_t(&region, 3, false).is_err());
        assert!(network
            .estimate_t(&Tensor::rand(&[2, 1, 128, 128], FLOAT_CPU), 0, false)
            .is_err());

        // five halvings need at least 32x32
        assert!(network
            .estimate_t(&Tensor::rand(&[2, 3, 16, 16], FLOAT_CPU), 0, false)
            .is_err());
        let estimate = network.estimate_t(&Tensor::rand(&[2, 3, 32, 32], FLOAT_CPU), 0, false)?;
        assert_eq!(estimate.size(), vec![2, 8]);

        Ok(())
    }
}
