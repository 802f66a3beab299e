use super::{
    batch_norm::{ConditionalBatchNorm, ConditionalBatchNormInit},
    spectral_norm::{SpectralNorm, SpectralNormInit},
};
use crate::common::*;

const IMAGE_CHANNELS: usize = 3;

/// Projects the final feature map to an RGB image in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct OutputBlockInit {
    pub init_gain: f64,
    pub base_channels: usize,
    pub output_factor: usize,
    pub n_input: usize,
}

impl OutputBlockInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<OutputBlock> {
        let path = path.borrow();
        let Self {
            init_gain,
            base_channels,
            output_factor,
            n_input,
        } = self;
        let channels = base_channels * output_factor;

        let cbn = ConditionalBatchNormInit {
            init_gain,
            ..Default::default()
        }
        .build(path / "cbn", channels, n_input)?;
        let conv = SpectralNormInit::new(3, init_gain).build(
            path / "conv",
            channels + 1,
            IMAGE_CHANNELS,
        )?;

        Ok(OutputBlock { cbn, conv })
    }
}

#[derive(Debug)]
pub struct OutputBlock {
    cbn: ConditionalBatchNorm,
    conv: SpectralNorm,
}

impl OutputBlock {
    pub fn set_trainable(&self, trainable: bool) {
        self.cbn.set_trainable(trainable);
        self.conv.set_trainable(trainable);
    }

    pub fn forward_t(
        &mut self,
        input: &Tensor,
        noise: &Tensor,
        class_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let Self {
            ref cbn,
            ref mut conv,
        } = *self;

        let (b, _, h, w) = input.size4().with_context(|| {
            format!(
                "expect input shape [B, C, H, W], but get {:?}",
                input.size()
            )
        })?;
        let (mask_b, mask_c, mask_h, mask_w) = class_mask.size4().with_context(|| {
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
        ensure!(
            (h, w) == (mask_h, mask_w),
            "mask size {}x{} does not match feature size {}x{}",
            mask_h,
            mask_w,
            h,
            w
        );

        let xs = cbn.forward(input, noise)?.relu();
        let xs = Tensor::cat(&[&xs, class_mask], 1);
        let xs = conv.forward_t(&xs, train)?.tanh();
        Ok(xs)
    }
}
