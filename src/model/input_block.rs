use super::{
    batch_norm::{ConditionalBatchNorm, ConditionalBatchNormInit},
    linear::{Linear, LinearInit},
};
use crate::common::*;

const GRID_SIZE: i64 = 4;

/// Projects the noise vector onto a 4x4 feature grid.
#[derive(Debug, Clone)]
pub struct InputBlockInit {
    pub init_gain: f64,
    pub base_channels: usize,
    pub output_factor: usize,
    pub n_input: usize,
}

impl InputBlockInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<InputBlock> {
        let path = path.borrow();
        let Self {
            init_gain,
            base_channels,
            output_factor,
            n_input,
        } = self;
        let output_channels = base_channels * output_factor;
        ensure!(output_channels > 0, "output channels must be positive");

        let dense = LinearInit::new(init_gain).build(
            path / "dense",
            n_input,
            output_channels * (GRID_SIZE * GRID_SIZE) as usize,
        )?;
        let cbn = ConditionalBatchNormInit {
            init_gain,
            ..Default::default()
        }
        .build(path / "cbn", output_channels, n_input)?;

        Ok(InputBlock {
            dense,
            cbn,
            n_input: n_input as i64,
            output_channels: output_channels as i64,
        })
    }
}

#[derive(Debug)]
pub struct InputBlock {
    dense: Linear,
    cbn: ConditionalBatchNorm,
    n_input: i64,
    output_channels: i64,
}

impl InputBlock {
    pub fn set_trainable(&self, trainable: bool) {
        self.dense.set_trainable(trainable);
        self.cbn.set_trainable(trainable);
    }

    pub fn forward(&self, noise: &Tensor) -> Result<Tensor> {
        let Self {
            ref dense,
            ref cbn,
            n_input,
            output_channels,
        } = *self;

        let (b, c, h, w) = noise.size4().with_context(|| {
            format!(
                "expect noise shape [B, C, 1, 1], but get {:?}",
                noise.size()
            )
        })?;
        ensure!(
            (c, h, w) == (n_input, 1, 1),
            "expect noise shape [B, {}, 1, 1], but get {:?}",
            n_input,
            noise.size()
        );

        let xs = dense.forward(&noise.reshape(&[b, n_input]))?;
        let xs = xs.view([b, output_channels, GRID_SIZE, GRID_SIZE]);
        let xs = cbn.forward(&xs, noise)?.relu();
        Ok(xs)
    }
}
