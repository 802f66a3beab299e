use crate::common::*;

/// Orthogonal initializer scaled by `gain`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrthogonalInit {
    pub gain: f64,
}

impl Default for OrthogonalInit {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

impl OrthogonalInit {
    /// Creates a trainable variable named `name` under `path`.
    pub fn var<'a>(
        &self,
        path: impl Borrow<nn::Path<'a>>,
        name: &str,
        shape: &[i64],
    ) -> Result<Tensor> {
        let path = path.borrow();
        let init = orthogonal_init(shape, self.gain, path.device())?;
        Ok(path.var_copy(name, &init))
    }
}

/// Draws a tensor whose first axis and flattened remaining axes form an
/// orthogonal matrix (semi-orthogonal when not square), multiplied by `gain`.
pub fn orthogonal_init(shape: &[i64], gain: f64, device: Device) -> Result<Tensor> {
    ensure!(
        shape.len() >= 2,
        "orthogonal init requires at least 2 dims, but get {:?}",
        shape
    );
    ensure!(
        shape.iter().all(|&size| size > 0),
        "orthogonal init does not accept empty dims {:?}",
        shape
    );
    ensure!(
        gain.is_finite() && gain > 0.0,
        "gain must be positive, but get {}",
        gain
    );

    let rows = shape[0];
    let cols: i64 = shape[1..].iter().product();

    let output = tch::no_grad(|| {
        let flat = Tensor::randn(&[rows, cols], (Kind::Float, device));
        let flat = if rows < cols { flat.tr() } else { flat };

        let (q, r) = flat.linalg_qr("reduced");
        let q = q * r.diag(0).sign();
        let q = if rows < cols { q.tr() } else { q };

        q.contiguous().view(shape) * gain
    });

    Ok(output)
}
