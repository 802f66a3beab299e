use super::{
    batch_norm::{ConditionalBatchNorm, ConditionalBatchNormInit},
    mask,
    spectral_norm::{SpectralNorm, SpectralNormInit},
};
use crate::common::*;

/// Residual block that doubles the spatial size and fuses the class mask
/// into its main path.
#[derive(Debug, Clone)]
pub struct ResidualUpsamplingBlockInit {
    pub init_gain: f64,
    pub base_channels: usize,
    pub input_factor: usize,
    pub output_factor: usize,
    pub mask_scale: usize,
    pub n_input: usize,
}

impl ResidualUpsamplingBlockInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<ResidualUpsamplingBlock> {
        let path = path.borrow();
        let Self {
            init_gain,
            base_channels,
            input_factor,
            output_factor,
            mask_scale,
            n_input,
        } = self;
        ensure!(mask_scale > 0, "mask_scale must be positive");

        let input_channels = base_channels * input_factor;
        let output_channels = base_channels * output_factor;
        let cbn_init = ConditionalBatchNormInit {
            init_gain,
            ..Default::default()
        };

        let identity_conv = SpectralNormInit::new(1, init_gain).build(
            path / "identity_conv",
            input_channels,
            output_channels,
        )?;
        let cbn_1 = cbn_init
            .clone()
            .build(path / "cbn_1", input_channels, n_input)?;
        // the pooled mask adds one channel
        let conv_1 = SpectralNormInit::new(3, init_gain).build(
            path / "conv_1",
            input_channels + 1,
            output_channels,
        )?;
        let cbn_2 = cbn_init.build(path / "cbn_2", output_channels, n_input)?;
        let conv_2 = SpectralNormInit::new(3, init_gain).build(
            path / "conv_2",
            output_channels,
            output_channels,
        )?;

        debug!(
            "residual upsampling block channels {} -> {}, mask scale {}",
            input_channels,
            output_channels,
            mask_scale
        );

        Ok(ResidualUpsamplingBlock {
            identity_conv,
            cbn_1,
            conv_1,
            cbn_2,
            conv_2,
            mask_scale,
            input_channels: input_channels as i64,
        })
    }
}

#[derive(Debug)]
pub struct ResidualUpsamplingBlock {
    identity_conv: SpectralNorm,
    cbn_1: ConditionalBatchNorm,
    conv_1: SpectralNorm,
    cbn_2: ConditionalBatchNorm,
    conv_2: SpectralNorm,
    mask_scale: usize,
    input_channels: i64,
}

impl ResidualUpsamplingBlock {
    pub fn output_channels(&self) -> i64 {
        self.conv_2.out_dim()
    }

    pub fn set_trainable(&self, trainable: bool) {
        self.identity_conv.set_trainable(trainable);
        self.cbn_1.set_trainable(trainable);
        self.conv_1.set_trainable(trainable);
        self.cbn_2.set_trainable(trainable);
        self.conv_2.set_trainable(trainable);
    }

    pub fn forward_t(
        &mut self,
        input: &Tensor,
        noise: &Tensor,
        class_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let Self {
            ref mut identity_conv,
            ref cbn_1,
            ref mut conv_1,
            ref cbn_2,
            ref mut conv_2,
            mask_scale,
            input_channels,
        } = *self;

        let (b, c, h, w) = input.size4().with_context(|| {
            format!(
                "expect input shape [B, C, H, W], but get {:?}",
                input.size()
            )
        })?;
        ensure!(
            c == input_channels,
            "expect {} input channels, but get {}",
            input_channels,
            c
        );
        let (mask_b, mask_c, _, _) = class_mask.size4().with_context(|| {
            format!(
                "expect mask shape [B, 1, H, W], but get {:?}",
                class_mask.size()
            )
        })?;
        ensure!(
            (mask_b, mask_c) == (b, 1),
            "expect mask shape [{}, 1, H, W], but get {:?}",
            b,
            class_mask.size()
        );

        let identity = identity_conv.forward_t(&upsample(input, h, w), train)?;

        let xs = cbn_1.forward(input, noise)?.relu();
        let pooled_mask = mask::pool_mask(class_mask, mask_scale)?;
        {
            let (_, _, mask_h, mask_w) = pooled_mask.size4()?;
            ensure!(
                (mask_h, mask_w) == (h, w),
                "pooled mask size {}x{} does not match feature size {}x{}",
                mask_h,
                mask_w,
                h,
                w
            );
        }
        let xs = Tensor::cat(&[&xs, &pooled_mask], 1);
        let xs = upsample(&xs, h, w);
        let xs = conv_1.forward_t(&xs, train)?;
        let xs = cbn_2.forward(&xs, noise)?.relu();
        let xs = conv_2.forward_t(&xs, train)?;

        Ok(xs + identity)
    }
}

fn upsample(xs: &Tensor, h: i64, w: i64) -> Tensor {
    xs.upsample_bilinear2d(&[h * 2, w * 2], false, None::<f64>, None::<f64>)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_block(
        root: &nn::Path,
        input_factor: usize,
        output_factor: usize,
        mask_scale: usize,
    ) -> Result<ResidualUpsamplingBlock> {
        ResidualUpsamplingBlockInit {
            init_gain: 1.0,
            base_channels: 2,
            input_factor,
            output_factor,
            mask_scale,
            n_input: 8,
        }
        .build(root / format!("block_{}", mask_scale))
    }

    #[test]
    fn residual_upsampling_block_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut block = build_block(&root, 4, 2, 8)?;

        let input = Tensor::randn(&[2, 8, 16, 16], FLOAT_CPU);
        let noise = Tensor::randn(&[2, 8, 1, 1], FLOAT_CPU);
        let class_mask = Tensor::rand(&[2, 1, 128, 128], FLOAT_CPU);

        let output = block.forward_t(&input, &noise, &class_mask, true)?;
        assert_eq!(output.size(), vec![2, 4, 32, 32]);
        assert_eq!(block.output_channels(), 4);

        Ok(())
    }

    #[test]
    fn chained_blocks_reach_full_resolution_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let schedule = [(16, 16, 32), (16, 8, 16), (8, 4, 8), (4, 2, 4), (2, 1, 2)];
        let mut blocks: Vec<_> = schedule
            .iter()
            .map(|&(input_factor, output_factor, mask_scale)| {
                build_block(&root, input_factor, output_factor, mask_scale)
            })
            .try_collect()?;

        let noise = Tensor::randn(&[1, 8, 1, 1], FLOAT_CPU);
        let class_mask = Tensor::rand(&[1, 1, 128, 128], FLOAT_CPU);
        let output = blocks.iter_mut().try_fold(
            Tensor::randn(&[1, 32, 4, 4], FLOAT_CPU),
            |xs, block| -> Result<_> {
                let (_, _, h, w) = xs.size4()?;
                let xs = block.forward_t(&xs, &noise, &class_mask, false)?;
                assert_eq!(&xs.size()[2..], &[h * 2, w * 2]);
                Ok(xs)
            },
        )?;
        assert_eq!(output.size(), vec![1, 2, 128, 128]);

        Ok(())
    }

    #[test]
    fn class_mask_changes_output_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut block = build_block(&root, 4, 2, 8)?;

        let input = Tensor::randn(&[1, 8, 16, 16], FLOAT_CPU);
        let noise = Tensor::randn(&[1, 8, 1, 1], FLOAT_CPU);
        let empty_mask = Tensor::zeros(&[1, 1, 128, 128], FLOAT_CPU);
        let full_mask = Tensor::ones(&[1, 1, 128, 128], FLOAT_CPU);

        let lhs = block.forward_t(&input, &noise, &empty_mask, false)?;
        let rhs = block.forward_t(&input, &noise, &full_mask, false)?;
        ensure!(!lhs.allclose(&rhs, 1e-5, 1e-5, false));

        // same inputs reproduce the same output
        let again = block.forward_t(&input, &noise, &empty_mask, false)?;
        ensure!(lhs.equal(&again));

        Ok(())
    }

    #[test]
    fn mask_batch_mismatch_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut block = build_block(&root, 4, 2, 8)?;

        let input = Tensor::randn(&[2, 8, 16, 16], FLOAT_CPU);
        let noise = Tensor::randn(&[2, 8, 1, 1], FLOAT_CPU);
        let class_mask = Tensor::rand(&[1, 1, 128, 128], FLOAT_CPU);
        assert!(block
            .forward_t(&input, &noise, &class_mask, false)
            .is_err());

        let two_channel_mask = Tensor::rand(&[2, 2, 128, 128], FLOAT_CPU);
        assert!(block
            .forward_t(&input, &noise, &two_channel_mask, false)
            .is_err());

        Ok(())
    }

    #[test]
    fn mismatched_mask_scale_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let mut block = build_block(&root, 4, 2, 4)?;

        let input = Tensor::randn(&[1, 8, 16, 16], FLOAT_CPU);
        let noise = Tensor::randn(&[1, 8, 1, 1], FLOAT_CPU);
        let class_mask = Tensor::rand(&[1, 1, 128, 128], FLOAT_CPU);
        assert!(block
            .forward_t(&input, &noise, &class_mask, false)
            .is_err());

        Ok(())
    }
}
