use super::conv::{Conv2D, Conv2DInit};
use crate::common::*;

#[cfg(debug_assertions)]
static NON_FINITE_WARN: Once = Once::new();

/// Instance normalization whose scale and shift are predicted from a
/// conditioning vector by 1x1 convolutions.
#[derive(Debug, Clone)]
pub struct ConditionalBatchNormInit {
    pub eps: f64,
    pub init_gain: f64,
}

impl Default for ConditionalBatchNormInit {
    fn default() -> Self {
        Self {
            eps: 1e-3,
            init_gain: 1.0,
        }
    }
}

impl ConditionalBatchNormInit {
    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        channels: usize,
        cond_channels: usize,
    ) -> Result<ConditionalBatchNorm> {
        let path = path.borrow();
        let Self { eps, init_gain } = self;
        ensure!(eps > 0.0, "eps must be positive");

        let gamma = Conv2DInit::new(1, init_gain).build(path / "gamma", cond_channels, channels)?;
        let beta = Conv2DInit::new(1, init_gain).build(path / "beta", cond_channels, channels)?;

        Ok(ConditionalBatchNorm {
            gamma,
            beta,
            channels: channels as i64,
            eps,
        })
    }
}

#[derive(Debug)]
pub struct ConditionalBatchNorm {
    gamma: Conv2D,
    beta: Conv2D,
    channels: i64,
    eps: f64,
}

impl ConditionalBatchNorm {
    pub fn set_trainable(&self, trainable: bool) {
        self.gamma.set_trainable(trainable);
        self.beta.set_trainable(trainable);
    }

    /// Normalizes `input` of shape `[B, C, H, W]` conditioned on `cond` of
    /// shape `[B, Cz, 1, 1]`.
    pub fn forward(&self, input: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let Self {
            ref gamma,
            ref beta,
            channels,
            eps,
        } = *self;

        let (b, c, _h, _w) = input.size4().with_context(|| {
            format!(
                "expect input shape [B, C, H, W], but get {:?}",
                input.size()
            )
        })?;
        let (cond_b, _cond_c, _, _) = cond.size4().with_context(|| {
            format!(
                "expect condition shape [B, C, 1, 1], but get {:?}",
                cond.size()
            )
        })?;
        ensure!(
            c == channels,
            "expect {} input channels, but get {}",
            channels,
            c
        );
        ensure!(
            b == cond_b,
            "batch size mismatch between input ({}) and condition ({})",
            b,
            cond_b
        );

        let normalized = Tensor::instance_norm(
            input,
            None::<&Tensor>, // weight
            None::<&Tensor>, // bias
            None::<&Tensor>, // running_mean
            None::<&Tensor>, // running_var
            true,            // use_input_stats
            0.0,             // momentum
            eps,
            false, // cudnn_enabled
        );

        let gamma = gamma.forward(cond)?;
        let beta = beta.forward(cond)?;
        let output = gamma * normalized + beta;

        #[cfg(debug_assertions)]
        {
            if !bool::from(output.isfinite().all()) {
                NON_FINITE_WARN.call_once(|| {
                    warn!("conditional batch norm produced non-finite values");
                });
            }
        }

        Ok(output)
    }
}
