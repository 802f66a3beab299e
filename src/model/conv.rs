use super::init::OrthogonalInit;
use crate::common::*;

#[derive(Debug, Clone)]
pub struct Conv2DInit {
    pub ksize: usize,
    pub stride: usize,
    pub padding: usize,
    pub bias: bool,
    pub ws_init: OrthogonalInit,
}

impl Conv2DInit {
    pub fn new(ksize: usize, gain: f64) -> Self {
        Self {
            ksize,
            stride: 1,
            padding: ksize / 2,
            bias: true,
            ws_init: OrthogonalInit { gain },
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Conv2D> {
        let Self {
            ksize,
            stride,
            padding,
            bias,
            ws_init,
        } = self;

        ensure!(ksize > 0, "ksize must be positive");
        ensure!(stride > 0, "stride must be positive");
        ensure!(
            in_dim > 0 && out_dim > 0,
            "in_dim and out_dim must be positive, but get in_dim = {}, out_dim = {}",
            in_dim,
            out_dim
        );

        let path = path.borrow();
        let in_dim = in_dim as i64;
        let out_dim = out_dim as i64;
        let ksize = ksize as i64;

        let weight = ws_init.var(path, "weight", &[out_dim, in_dim, ksize, ksize])?;
        let bias = bias.then(|| path.zeros("bias", &[out_dim]));

        Ok(Conv2D {
            stride: [stride as i64; 2],
            padding: [padding as i64; 2],
            in_dim,
            out_dim,
            weight,
            bias,
        })
    }
}

#[derive(Debug)]
pub struct Conv2D {
    stride: [i64; 2],
    padding: [i64; 2],
    in_dim: i64,
    out_dim: i64,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Conv2D {
    pub fn in_dim(&self) -> i64 {
        self.in_dim
    }

    pub fn out_dim(&self) -> i64 {
        self.out_dim
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn set_trainable(&self, trainable: bool) {
        let Self { weight, bias, .. } = self;
        let _ = weight.set_requires_grad(trainable);
        if let Some(bias) = bias {
            let _ = bias.set_requires_grad(trainable);
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_with_weight(input, &self.weight)
    }

    /// Convolves with a substitute weight of the same shape as the owned one.
    pub fn forward_with_weight(&self, input: &Tensor, weight: &Tensor) -> Result<Tensor> {
        let Self {
            ref stride,
            ref padding,
            in_dim,
            ref bias,
            ..
        } = *self;

        let (_b, c, _h, _w) = input.size4().with_context(|| {
            format!(
                "expect input shape [B, C, H, W], but get {:?}",
                input.size()
            )
        })?;
        ensure!(
            c == in_dim,
            "expect {} input channels, but get {}",
            in_dim,
            c
        );

        let output = input.conv2d(weight, bias.as_ref(), stride, padding, &[1, 1], 1);
        Ok(output)
    }
}
