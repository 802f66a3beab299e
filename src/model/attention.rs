use super::spectral_norm::{SpectralNorm, SpectralNormInit};
use crate::common::*;

/// Global spatial self-attention over a feature map with a learned residual
/// gate initialised to zero.
#[derive(Debug, Clone)]
pub struct SelfAttentionInit {
    pub init_gain: f64,
    pub channels: usize,
    pub key_reduction: usize,
    pub value_reduction: usize,
}

impl SelfAttentionInit {
    pub fn new(init_gain: f64, channels: usize) -> Self {
        Self {
            init_gain,
            channels,
            key_reduction: 8,
            value_reduction: 2,
        }
    }

    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<SelfAttention> {
        let path = path.borrow();
        let SelfAttentionInit {
            init_gain,
            channels,
            key_reduction,
            value_reduction,
        } = self;
        ensure!(
            key_reduction > 0 && value_reduction > 0,
            "reduction factors must be positive"
        );

        let key_channels = (channels / key_reduction).max(1);
        let value_channels = (channels / value_reduction).max(1);

        let query_conv =
            SpectralNormInit::new(1, init_gain).build(path / "query_conv", channels, key_channels)?;
        let key_conv =
            SpectralNormInit::new(1, init_gain).build(path / "key_conv", channels, key_channels)?;
        let value_conv = SpectralNormInit::new(1, init_gain).build(
            path / "value_conv",
            channels,
            value_channels,
        )?;
        let merge_conv = SpectralNormInit::new(1, init_gain).build(
            path / "merge_conv",
            value_channels,
            channels,
        )?;
        let gate = path.zeros("gate", &[1]);

        Ok(SelfAttention {
            query_conv,
            key_conv,
            value_conv,
            merge_conv,
            gate,
            channels: channels as i64,
        })
    }
}

#[derive(Debug)]
pub struct SelfAttention {
    query_conv: SpectralNorm,
    key_conv: SpectralNorm,
    value_conv: SpectralNorm,
    merge_conv: SpectralNorm,
    gate: Tensor,
    channels: i64,
}

impl SelfAttention {
    pub fn set_trainable(&self, trainable: bool) {
        self.query_conv.set_trainable(trainable);
        self.key_conv.set_trainable(trainable);
        self.value_conv.set_trainable(trainable);
        self.merge_conv.set_trainable(trainable);
        let _ = self.gate.set_requires_grad(trainable);
    }

    pub fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref mut query_conv,
            ref mut key_conv,
            ref mut value_conv,
            ref mut merge_conv,
            ref gate,
            channels,
        } = *self;

        let (b, c, h, w) = input.size4().with_context(|| {
            format!(
                "expect input shape [B, C, H, W], but get {:?}",
                input.size()
            )
        })?;
        ensure!(
            c == channels,
            "expect {} input channels, but get {}",
            channels,
            c
        );

        let query = query_conv.forward_t(input, train)?.view([b, -1, h * w]);
        let key = key_conv.forward_t(input, train)?.view([b, -1, h * w]);
        let value = value_conv.forward_t(input, train)?.view([b, -1, h * w]);

        // attention[b, p, q]: weight of position q for output position p
        let attention =
            Tensor::einsum("bkp,bkq->bpq", &[&query, &key]).softmax(-1, Kind::Float);
        let attended = Tensor::einsum("bpq,bvq->bvp", &[&attention, &value]).view([b, -1, h, w]);
        let output = merge_conv.forward_t(&attended, train)?;

        Ok(input + gate * output)
    }
}
