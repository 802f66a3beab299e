use super::{
    attention::{SelfAttention, SelfAttentionInit},
    input_block::{InputBlock, InputBlockInit},
    mask,
    noise::NoiseSampler,
    output_block::{OutputBlock, OutputBlockInit},
    resnet_block::{ResidualUpsamplingBlock, ResidualUpsamplingBlockInit},
};
use crate::common::*;

const INPUT_GRID_SIZE: usize = 4;

/// Channel factors and mask pooling scale of one residual upsampling block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpBlockSpec {
    pub input_factor: usize,
    pub output_factor: usize,
    pub mask_scale: usize,
}

impl UpBlockSpec {
    pub const fn new(input_factor: usize, output_factor: usize, mask_scale: usize) -> Self {
        Self {
            input_factor,
            output_factor,
            mask_scale,
        }
    }
}

/// Block schedule for 128x128 images.
pub const DEFAULT_UP_BLOCKS: [UpBlockSpec; 5] = [
    UpBlockSpec::new(16, 16, 32),
    UpBlockSpec::new(16, 8, 16),
    UpBlockSpec::new(8, 4, 8),
    UpBlockSpec::new(4, 2, 4),
    UpBlockSpec::new(2, 1, 2),
];

#[derive(Debug, Clone)]
pub struct ClassGeneratorInit {
    /// Class redrawn by this generator.
    pub class: usize,
    pub init_gain: f64,
    pub base_channels: usize,
    pub n_input: usize,
    pub image_size: usize,
    pub input_factor: usize,
    pub up_blocks: Vec<UpBlockSpec>,
    /// Number of upsampling blocks run before self-attention.
    pub attention_index: usize,
    pub output_factor: usize,
}

impl ClassGeneratorInit {
    pub fn new(class: usize, init_gain: f64, base_channels: usize, n_input: usize) -> Self {
        Self {
            class,
            init_gain,
            base_channels,
            n_input,
            image_size: 128,
            input_factor: 16,
            up_blocks: DEFAULT_UP_BLOCKS.to_vec(),
            attention_index: 4,
            output_factor: 1,
        }
    }

    /// Checks that channel factors chain and that every mask scale brings
    /// the full resolution mask down to its block's input resolution.
    pub fn validate(&self) -> Result<()> {
        let Self {
            init_gain,
            base_channels,
            n_input,
            image_size,
            input_factor,
            ref up_blocks,
            attention_index,
            output_factor,
            ..
        } = *self;

        ensure!(
            init_gain.is_finite() && init_gain > 0.0,
            "init_gain must be positive, but get {}",
            init_gain
        );
        ensure!(base_channels > 0, "base_channels must be positive");
        ensure!(n_input > 0, "n_input must be positive");
        ensure!(
            !up_blocks.is_empty(),
            "at least one upsampling block is required"
        );
        ensure!(
            attention_index <= up_blocks.len(),
            "attention_index {} exceeds the number of upsampling blocks {}",
            attention_index,
            up_blocks.len()
        );

        let final_size = INPUT_GRID_SIZE << up_blocks.len();
        ensure!(
            final_size == image_size,
            "{} upsampling blocks produce {}x{} images, but image_size is {}",
            up_blocks.len(),
            final_size,
            final_size,
            image_size
        );

        let last_factor = up_blocks.iter().enumerate().try_fold(
            input_factor,
            |prev_factor, (index, spec)| -> Result<_> {
                let UpBlockSpec {
                    input_factor,
                    output_factor,
                    mask_scale,
                } = *spec;
                ensure!(
                    input_factor > 0 && output_factor > 0,
                    "channel factors of block {} must be positive",
                    index
                );
                ensure!(
                    input_factor == prev_factor,
                    "block {} expects input factor {}, but the previous stage outputs {}",
                    index,
                    input_factor,
                    prev_factor
                );

                let feature_size = INPUT_GRID_SIZE << index;
                ensure!(
                    mask_scale * feature_size == image_size,
                    "block {} runs at {}x{}, so its mask scale must be {}, but get {}",
                    index,
                    feature_size,
                    feature_size,
                    image_size / feature_size,
                    mask_scale
                );
                Ok(output_factor)
            },
        )?;

        ensure!(
            last_factor == output_factor,
            "the last upsampling block outputs factor {}, but the output block expects {}",
            last_factor,
            output_factor
        );

        Ok(())
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<ClassGenerator> {
        self.validate()?;

        let path = path.borrow();
        let Self {
            class,
            init_gain,
            base_channels,
            n_input,
            image_size,
            input_factor,
            up_blocks,
            attention_index,
            output_factor,
        } = self;

        let input_block = InputBlockInit {
            init_gain,
            base_channels,
            output_factor: input_factor,
            n_input,
        }
        .build(path / "input_block")?;

        let attention_factor = match attention_index {
            0 => input_factor,
            index => up_blocks[index - 1].output_factor,
        };

        let blocks: Vec<_> = up_blocks
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                ResidualUpsamplingBlockInit {
                    init_gain,
                    base_channels,
                    input_factor: spec.input_factor,
                    output_factor: spec.output_factor,
                    mask_scale: spec.mask_scale,
                    n_input,
                }
                .build(path / format!("up_block_{}", index))
            })
            .try_collect()?;

        let attention = SelfAttentionInit::new(init_gain, base_channels * attention_factor)
            .build(path / "attention")?;

        let output_block = OutputBlockInit {
            init_gain,
            base_channels,
            output_factor,
            n_input,
        }
        .build(path / "output_block")?;

        debug!(
            "class generator {} with {} upsampling blocks, attention after block {}",
            class,
            blocks.len(),
            attention_index
        );

        Ok(ClassGenerator {
            class,
            n_input,
            image_size: image_size as i64,
            input_block,
            blocks,
            attention_index,
            attention,
            output_block,
        })
    }
}

#[derive(Debug)]
pub struct ClassGeneratorOutput {
    /// Composite of the redrawn region and the untouched real regions.
    pub fake_images: Tensor,
    /// Raw generator output before masking.
    pub fake_region: Tensor,
    /// Noise vectors in shape `[B, n_input]`.
    pub noise: Tensor,
}

#[derive(Debug)]
pub struct ClassGenerator {
    class: usize,
    n_input: usize,
    image_size: i64,
    input_block: InputBlock,
    blocks: Vec<ResidualUpsamplingBlock>,
    attention_index: usize,
    attention: SelfAttention,
    output_block: OutputBlock,
}

impl ClassGenerator {
    pub fn set_trainable(&self, trainable: bool) {
        self.input_block.set_trainable(trainable);
        self.blocks
            .iter()
            .for_each(|block| block.set_trainable(trainable));
        self.attention.set_trainable(trainable);
        self.output_block.set_trainable(trainable);
    }

    /// Redraws the region of this generator's class with freshly sampled noise.
    pub fn forward_t(
        &mut self,
        real_images: &Tensor,
        mask_logits: &Tensor,
        sampler: &mut NoiseSampler,
        train: bool,
    ) -> Result<ClassGeneratorOutput> {
        let (b, _, _, _) = real_images.size4().with_context(|| {
            format!(
                "expect image shape [B, 3, H, W], but get {:?}",
                real_images.size()
            )
        })?;
        let noise = sampler.sample(b as usize, self.n_input, real_images.device())?;
        self.forward_with_noise(real_images, mask_logits, &noise, train)
    }

    /// Redraws the region using the given `[B, n_input, 1, 1]` noise.
    pub fn forward_with_noise(
        &mut self,
        real_images: &Tensor,
        mask_logits: &Tensor,
        noise: &Tensor,
        train: bool,
    ) -> Result<ClassGeneratorOutput> {
        let (b, c, h, w) = real_images.size4().with_context(|| {
            format!(
                "expect image shape [B, 3, H, W], but get {:?}",
                real_images.size()
            )
        })?;
        let (mask_b, n_classes, mask_h, mask_w) = mask_logits.size4().with_context(|| {
            format!(
                "expect mask shape [B, K, H, W], but get {:?}",
                mask_logits.size()
            )
        })?;
        ensure!(c == 3, "expect 3 image channels, but get {}", c);
        ensure!(
            (h, w) == (self.image_size, self.image_size),
            "expect {}x{} images, but get {}x{}",
            self.image_size,
            self.image_size,
            h,
            w
        );
        ensure!(
            (mask_b, mask_h, mask_w) == (b, h, w),
            "mask shape {:?} does not match image shape {:?}",
            mask_logits.size(),
            real_images.size()
        );
        ensure!(
            (self.class as i64) < n_classes,
            "class index {} is out of range for {} mask classes",
            self.class,
            n_classes
        );
        ensure!(
            noise.size() == vec![b, self.n_input as i64, 1, 1],
            "expect noise shape [{}, {}, 1, 1], but get {:?}",
            b,
            self.n_input,
            noise.size()
        );

        let masks = mask::mask_probs(mask_logits)?;
        let class_mask = mask::class_mask(&masks, self.class)?;

        let fake_region = self.redraw(noise, &class_mask, train)?;
        let fake_images = mask::composite_regions(real_images, &masks, self.class, &fake_region)?;

        Ok(ClassGeneratorOutput {
            fake_images,
            fake_region,
            noise: noise.reshape(&[b, self.n_input as i64]),
        })
    }

    fn redraw(&mut self, noise: &Tensor, class_mask: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref input_block,
            ref mut blocks,
            attention_index,
            ref mut attention,
            ref mut output_block,
            ..
        } = *self;

        let xs = input_block.forward(noise)?;
        let xs = blocks
            .iter_mut()
            .enumerate()
            .try_fold(xs, |xs, (index, block)| -> Result<_> {
                let xs = if index == attention_index {
                    attention.forward_t(&xs, train)?
                } else {
                    xs
                };
                block.forward_t(&xs, noise, class_mask, train)
            })?;
        let xs = if attention_index == blocks.len() {
            attention.forward_t(&xs, train)?
        } else {
            xs
        };

        output_block.forward_t(&xs, noise, class_mask, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_init(class: usize) -> ClassGeneratorInit {
        ClassGeneratorInit::new(class, 1.0, 2, 8)
    }

    #[test]
    fn default_schedule_is_valid_test() -> Result<()> {
        ClassGeneratorInit::new(0, 1.0, 32, 32).validate()?;

        for (lhs, rhs) in DEFAULT_UP_BLOCKS.iter().tuple_windows() {
            assert_eq!(lhs.output_factor, rhs.input_factor);
        }
        Ok(())
    }

    #[test]
    fn invalid_schedule_test() {
        // broken channel chain
        let mut init = small_init(0);
        init.up_blocks[2].input_factor = 4;
        assert!(init.validate().is_err());

        // mask scale inconsistent with the block resolution
        let mut init = small_init(0);
        init.up_blocks[1].mask_scale = 8;
        assert!(init.validate().is_err());

        // image size not reachable with five doublings
        let mut init = small_init(0);
        init.image_size = 256;
        assert!(init.validate().is_err());

        // output block factor mismatch
        let mut init = small_init(0);
        init.output_factor = 2;
        assert!(init.build(nn::VarStore::new(Device::Cpu).root()).is_err());
    }

    #[test]
    fn smaller_schedule_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut generator = ClassGeneratorInit {
            image_size: 32,
            input_factor: 4,
            up_blocks: vec![
                UpBlockSpec::new(4, 2, 8),
                UpBlockSpec::new(2, 2, 4),
                UpBlockSpec::new(2, 1, 2),
            ],
            attention_index: 1,
            ..small_init(1)
        }
        .build(vs.root())?;

        let images = Tensor::rand(&[2, 3, 32, 32], FLOAT_CPU) * 2.0 - 1.0;
        let logits = Tensor::randn(&[2, 3, 32, 32], FLOAT_CPU);
        let mut sampler = NoiseSampler::new(1);
        let output = generator.forward_t(&images, &logits, &mut sampler, true)?;
        assert_eq!(output.fake_images.size(), vec![2, 3, 32, 32]);
        assert_eq!(output.noise.size(), vec![2, 8]);
        Ok(())
    }

    #[test]
    fn class_generator_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut generator = small_init(1).build(vs.root())?;

        let images = Tensor::rand(&[2, 3, 128, 128], FLOAT_CPU) * 2.0 - 1.0;
        let logits = Tensor::randn(&[2, 2, 128, 128], FLOAT_CPU);
        let mut sampler = NoiseSampler::new(5);

        let ClassGeneratorOutput {
            fake_images,
            fake_region,
            noise,
        } = generator.forward_t(&images, &logits, &mut sampler, true)?;
        assert_eq!(fake_images.size(), vec![2, 3, 128, 128]);
        assert_eq!(fake_region.size(), vec![2, 3, 128, 128]);
        assert_eq!(noise.size(), vec![2, 8]);
        ensure!(f64::from(fake_region.min()) >= -1.0 && f64::from(fake_region.max()) <= 1.0);

        // convex combination of values in [-1, 1]
        ensure!(f64::from(fake_images.abs().max()) <= 1.0 + 1e-5);

        Ok(())
    }

    #[test]
    fn fixed_noise_determinism_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut generator = small_init(0).build(vs.root())?;

        let images = Tensor::rand(&[1, 3, 128, 128], FLOAT_CPU);
        let logits = Tensor::randn(&[1, 2, 128, 128], FLOAT_CPU);
        let noise = NoiseSampler::new(9).sample(1, 8, Device::Cpu)?;

        let lhs = generator.forward_with_noise(&images, &logits, &noise, false)?;
        let rhs = generator.forward_with_noise(&images, &logits, &noise, false)?;
        ensure!(lhs.fake_images.equal(&rhs.fake_images));
        ensure!(lhs.fake_region.equal(&rhs.fake_region));

        // the same seed reproduces the same sample
        let lhs = generator.forward_t(&images, &logits, &mut NoiseSampler::new(3), false)?;
        let rhs = generator.forward_t(&images, &logits, &mut NoiseSampler::new(3), false)?;
        ensure!(lhs.fake_images.equal(&rhs.fake_images));
        ensure!(lhs.noise.equal(&rhs.noise));

        Ok(())
    }

    #[test]
    fn class_out_of_mask_range_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut generator = small_init(2).build(vs.root())?;

        let images = Tensor::rand(&[1, 3, 128, 128], FLOAT_CPU);
        let logits = Tensor::randn(&[1, 2, 128, 128], FLOAT_CPU);
        assert!(generator
            .forward_t(&images, &logits, &mut NoiseSampler::new(0), false)
            .is_err());

        let small_images = Tensor::rand(&[1, 3, 64, 64], FLOAT_CPU);
        let small_logits = Tensor::randn(&[1, 3, 64, 64], FLOAT_CPU);
        assert!(generator
            .forward_t(&small_images, &small_logits, &mut NoiseSampler::new(0), false)
            .is_err());

        Ok(())
    }
}
