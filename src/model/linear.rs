use super::init::OrthogonalInit;
use crate::common::*;

#[derive(Debug, Clone)]
pub struct LinearInit {
    pub ws_init: OrthogonalInit,
    pub bias: bool,
}

impl LinearInit {
    pub fn new(gain: f64) -> Self {
        Self {
            ws_init: OrthogonalInit { gain },
            bias: true,
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Linear> {
        let Self { ws_init, bias } = self;
        ensure!(
            in_dim > 0 && out_dim > 0,
            "in_dim and out_dim must be positive, but get in_dim = {}, out_dim = {}",
            in_dim,
            out_dim
        );

        let path = path.borrow();
        let in_dim = in_dim as i64;
        let out_dim = out_dim as i64;

        let ws = ws_init.var(path, "weight", &[out_dim, in_dim])?;
        let bs = bias.then(|| path.zeros("bias", &[out_dim]));

        Ok(Linear { in_dim, ws, bs })
    }
}

#[derive(Debug)]
pub struct Linear {
    in_dim: i64,
    ws: Tensor,
    bs: Option<Tensor>,
}

impl Linear {
    pub fn set_trainable(&self, trainable: bool) {
        let _ = self.ws.set_requires_grad(trainable);
        if let Some(bs) = &self.bs {
            let _ = bs.set_requires_grad(trainable);
        }
    }

    /// Maps `[B, in_dim]` to `[B, out_dim]`.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (_b, c) = input
            .size2()
            .with_context(|| format!("expect input shape [B, C], but get {:?}", input.size()))?;
        ensure!(
            c == self.in_dim,
            "expect {} input features, but get {}",
            self.in_dim,
            c
        );

        let output = input.matmul(&self.ws.tr());
        let output = match &self.bs {
            Some(bs) => output + bs,
            None => output,
        };
        Ok(output)
    }
}
