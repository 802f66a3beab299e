use super::conv::{Conv2D, Conv2DInit};
use crate::common::*;

const NORM_EPS: f64 = 1e-12;

/// Wraps a convolution whose weight is divided by an estimate of its
/// largest singular value on every call.
#[derive(Debug, Clone)]
pub struct SpectralNormInit {
    pub conv: Conv2DInit,
}

impl SpectralNormInit {
    pub fn new(ksize: usize, gain: f64) -> Self {
        Self {
            conv: Conv2DInit::new(ksize, gain),
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<SpectralNorm> {
        let path = path.borrow();
        let conv = self.conv.build(path, in_dim, out_dim)?;

        let mut u = path.zeros_no_train("u", &[out_dim as i64]);
        tch::no_grad(|| {
            let init = Tensor::randn(&[out_dim as i64], (Kind::Float, path.device()));
            u.copy_(&normalize(&init));
        });

        Ok(SpectralNorm { conv, u })
    }
}

#[derive(Debug)]
pub struct SpectralNorm {
    conv: Conv2D,
    u: Tensor,
}

impl SpectralNorm {
    pub fn out_dim(&self) -> i64 {
        self.conv.out_dim()
    }

    /// Current estimate of the leading left singular vector.
    pub fn u(&self) -> &Tensor {
        &self.u
    }

    pub fn set_trainable(&self, trainable: bool) {
        self.conv.set_trainable(trainable);
    }

    /// Estimated largest singular value of the flattened weight.
    pub fn sigma(&self) -> Tensor {
        tch::no_grad(|| {
            let w_mat = self.weight_matrix();
            let v = normalize(&w_mat.tr().mv(&self.u));
            self.u.dot(&w_mat.mv(&v))
        })
    }

    pub fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Tensor> {
        let w_mat = self.weight_matrix();

        // the power iteration never enters the autograd graph
        let (u, v) = tch::no_grad(|| {
            if train {
                let v = normalize(&w_mat.tr().mv(&self.u));
                let u = normalize(&w_mat.mv(&v));
                self.u.copy_(&u);
                (u, v)
            } else {
                let v = normalize(&w_mat.tr().mv(&self.u));
                (self.u.copy(), v)
            }
        });

        let sigma = u.dot(&w_mat.mv(&v));
        let weight = self.conv.weight() / sigma;
        self.conv.forward_with_weight(input, &weight)
    }

    fn weight_matrix(&self) -> Tensor {
        let weight = self.conv.weight();
        weight.view([weight.size()[0], -1])
    }
}

fn normalize(xs: &Tensor) -> Tensor {
    xs / (xs.norm() + NORM_EPS)
}
