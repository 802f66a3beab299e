use super::{
    class_generator::{ClassGenerator, ClassGeneratorInit, ClassGeneratorOutput},
    information_network::{InformationNetwork, InformationNetworkInit, NoiseEstimator},
    noise::NoiseSampler,
};
use crate::common::*;

#[derive(Debug, Clone)]
pub struct GeneratorInit {
    pub n_classes: usize,
    pub n_input: usize,
    pub init_gain: f64,
    pub base_channels: usize,
    pub image_size: usize,
}

impl GeneratorInit {
    /// Builds the class generators together with the default information
    /// conservation network.
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Generator> {
        let path = path.borrow();
        let estimator = InformationNetworkInit::new(
            self.init_gain,
            self.base_channels,
            self.n_classes,
            self.n_input,
        )
        .build(path / "information_network")?;
        self.build_with_estimator(path, estimator)
    }

    pub fn build_with_estimator<'a, E>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        estimator: E,
    ) -> Result<Generator<E>>
    where
        E: NoiseEstimator,
    {
        let path = path.borrow();
        let Self {
            n_classes,
            n_input,
            init_gain,
            base_channels,
            image_size,
        } = self;
        ensure!(n_classes > 0, "n_classes must be positive");

        let class_generators: Vec<_> = (0..n_classes)
            .map(|class| {
                ClassGeneratorInit {
                    image_size,
                    ..ClassGeneratorInit::new(class, init_gain, base_channels, n_input)
                }
                .build(path / format!("class_generator_{}", class))
            })
            .try_collect()?;

        info!(
            "generator built with {} classes, n_input = {}, base_channels = {}",
            n_classes, n_input, base_channels
        );

        Ok(Generator {
            class_generators,
            estimator,
        })
    }
}

#[derive(Debug)]
pub struct NoiseRecovery {
    /// Sampled noise in shape `[B, n_input]`.
    pub noise: Tensor,
    /// Noise recovered from the raw region in shape `[B, n_input]`.
    pub noise_estimate: Tensor,
}

#[derive(Debug)]
pub struct GeneratorOutput {
    pub fake_images: Tensor,
    /// Present only for generator updates.
    pub recovery: Option<NoiseRecovery>,
}

#[derive(Debug)]
pub struct Generator<E = InformationNetwork>
where
    E: NoiseEstimator,
{
    class_generators: Vec<ClassGenerator>,
    estimator: E,
}

impl<E> Generator<E>
where
    E: NoiseEstimator,
{
    pub fn n_classes(&self) -> usize {
        self.class_generators.len()
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    pub fn set_trainable(&self, trainable: bool) {
        self.class_generators
            .iter()
            .for_each(|generator| generator.set_trainable(trainable));
        self.estimator.set_trainable(trainable);
    }

    /// Redraws the region of class `class`. When `update_generator` is set,
    /// the sampled noise and its estimate from the raw region are returned
    /// alongside the images.
    pub fn forward_t(
        &mut self,
        real_images: &Tensor,
        mask_logits: &Tensor,
        class: usize,
        update_generator: bool,
        train: bool,
        sampler: &mut NoiseSampler,
    ) -> Result<GeneratorOutput> {
        let generator = self.class_generator_mut(class)?;
        let output = generator.forward_t(real_images, mask_logits, sampler, train)?;
        self.finish(output, class, update_generator, train)
    }

    /// Same as [`forward_t`](Self::forward_t), but with explicit
    /// `[B, n_input, 1, 1]` noise.
    pub fn forward_with_noise(
        &mut self,
        real_images: &Tensor,
        mask_logits: &Tensor,
        class: usize,
        noise: &Tensor,
        update_generator: bool,
        train: bool,
    ) -> Result<GeneratorOutput> {
        let generator = self.class_generator_mut(class)?;
        let output = generator.forward_with_noise(real_images, mask_logits, noise, train)?;
        self.finish(output, class, update_generator, train)
    }

    fn class_generator_mut(&mut self, class: usize) -> Result<&mut ClassGenerator> {
        let n_classes = self.class_generators.len();
        self.class_generators.get_mut(class).ok_or_else(|| {
            format_err!(
                "class index {} is out of range for {} classes",
                class,
                n_classes
            )
        })
    }

    fn finish(
        &mut self,
        output: ClassGeneratorOutput,
        class: usize,
        update_generator: bool,
        train: bool,
    ) -> Result<GeneratorOutput> {
        let ClassGeneratorOutput {
            fake_images,
            fake_region,
            noise,
        } = output;

        let recovery = if update_generator {
            let noise_estimate = self.estimator.estimate_t(&fake_region, class, train)?;
            Some(NoiseRecovery {
                noise,
                noise_estimate,
            })
        } else {
            None
        };

        Ok(GeneratorOutput {
            fake_images,
            recovery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct CountingEstimator {
        n_output: i64,
        num_calls: usize,
    }

    impl NoiseEstimator for CountingEstimator {
        fn estimate_t(&mut self, region: &Tensor, _class: usize, _train: bool) -> Result<Tensor> {
            self.num_calls += 1;
            let (b, _, _, _) = region.size4()?;
            Ok(Tensor::zeros(&[b, self.n_output], FLOAT_CPU))
        }
    }

    fn small_init(n_classes: usize) -> GeneratorInit {
        GeneratorInit {
            n_classes,
            n_input: 8,
            init_gain: 1.0,
            base_channels: 2,
            image_size: 128,
        }
    }

    #[test]
    fn generator_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut generator = small_init(3).build(&root / "generator")?;
        let mut sampler = NoiseSampler::new(11);
        assert_eq!(generator.n_classes(), 3);

        let images = Tensor::rand(&[2, 3, 128, 128], FLOAT_CPU) * 2.0 - 1.0;
        let logits = Tensor::randn(&[2, 3, 128, 128], FLOAT_CPU);

        for class in 0..3 {
            let GeneratorOutput {
                fake_images,
                recovery,
            } = generator.forward_t(&images, &logits, class, true, true, &mut sampler)?;
            assert_eq!(fake_images.size(), vec![2, 3, 128, 128]);
            ensure!(f64::from(fake_images.abs().max()) <= 1.0 + 1e-5);

            let NoiseRecovery {
                noise,
                noise_estimate,
            } = recovery.ok_or_else(|| format_err!("missing noise recovery"))?;
            assert_eq!(noise.size(), vec![2, 8]);
            assert_eq!(noise_estimate.size(), vec![2, 8]);
        }

        assert!(generator
            .forward_t(&images, &logits, 3, false, false, &mut sampler)
            .is_err());

        Ok(())
    }

    #[test]
    fn skip_estimator_without_generator_update_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let estimator = CountingEstimator {
            n_output: 8,
            ..Default::default()
        };
        let mut generator = small_init(2).build_with_estimator(vs.root(), estimator)?;
        let mut sampler = NoiseSampler::new(0);

        let images = Tensor::rand(&[1, 3, 128, 128], FLOAT_CPU);
        let logits = Tensor::randn(&[1, 2, 128, 128], FLOAT_CPU);

        let output = generator.forward_t(&images, &logits, 0, false, true, &mut sampler)?;
        ensure!(output.recovery.is_none());
        assert_eq!(generator.estimator().num_calls, 0);

        let output = generator.forward_t(&images, &logits, 1, true, true, &mut sampler)?;
        ensure!(output.recovery.is_some());
        assert_eq!(generator.estimator().num_calls, 1);

        Ok(())
    }

    #[test]
    fn redraw_foreground_scenario_test() -> Result<()> {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut generator = GeneratorInit {
            n_classes: 2,
            n_input: 32,
            init_gain: 1.0,
            base_channels: 32,
            image_size: 128,
        }
        .build(&root / "generator")?;
        let mut sampler = NoiseSampler::new(2);

        let images = Tensor::rand(&[1, 3, 128, 128], FLOAT_CPU) * 2.0 - 1.0;
        // saturated scores: channel 0 everywhere
        let logits = Tensor::cat(
            &[
                Tensor::full(&[1, 1, 128, 128], 100.0, FLOAT_CPU),
                Tensor::full(&[1, 1, 128, 128], -100.0, FLOAT_CPU),
            ],
            1,
        );

        let output = generator.forward_t(&images, &logits, 0, true, true, &mut sampler)?;
        ensure!(!output.fake_images.allclose(&images, 1e-3, 1e-3, false));
        let recovery = output
            .recovery
            .ok_or_else(|| format_err!("missing noise recovery"))?;
        assert_eq!(recovery.noise.size(), vec![1, 32]);
        assert_eq!(recovery.noise_estimate.size(), vec![1, 32]);

        // class 1 owns no pixels, so its redraw leaves the image intact
        let output = generator.forward_t(&images, &logits, 1, false, false, &mut sampler)?;
        ensure!(output.recovery.is_none());
        ensure!(output.fake_images.allclose(&images, 1e-5, 1e-5, false));

        Ok(())
    }

    #[test]
    fn inference_determinism_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut generator = small_init(2).build(vs.root())?;

        let images = Tensor::rand(&[2, 3, 128, 128], FLOAT_CPU);
        let logits = Tensor::randn(&[2, 2, 128, 128], FLOAT_CPU);
        let noise = NoiseSampler::new(4).sample(2, 8, Device::Cpu)?;

        let lhs = generator.forward_with_noise(&images, &logits, 1, &noise, true, false)?;
        let rhs = generator.forward_with_noise(&images, &logits, 1, &noise, true, false)?;
        ensure!(lhs.fake_images.equal(&rhs.fake_images));
        let (lhs, rhs) = match (lhs.recovery, rhs.recovery) {
            (Some(lhs), Some(rhs)) => (lhs, rhs),
            _ => bail!("missing noise recovery"),
        };
        ensure!(lhs.noise_estimate.equal(&rhs.noise_estimate));

        Ok(())
    }

    #[test]
    fn set_trainable_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = small_init(2).build(vs.root())?;

        generator.set_trainable(false);
        ensure!(vs
            .trainable_variables()
            .iter()
            .all(|var| !var.requires_grad()));

        generator.set_trainable(true);
        ensure!(vs
            .trainable_variables()
            .iter()
            .all(|var| var.requires_grad()));

        Ok(())
    }
}
