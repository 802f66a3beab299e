use crate::common::*;

/// Converts raw per-pixel class scores `[B, K, H, W]` into class
/// probabilities over the channel axis.
pub fn mask_probs(mask_logits: &Tensor) -> Result<Tensor> {
    let (_b, k, _h, _w) = mask_logits.size4().with_context(|| {
        format!(
            "expect mask shape [B, K, H, W], but get {:?}",
            mask_logits.size()
        )
    })?;
    ensure!(k > 0, "the mask must have at least one class channel");
    Ok(mask_logits.softmax(1, Kind::Float))
}

/// Selects the `[B, 1, H, W]` channel of class `class`.
pub fn class_mask(masks: &Tensor, class: usize) -> Result<Tensor> {
    let (_b, k, _h, _w) = masks.size4()?;
    ensure!(
        (class as i64) < k,
        "class index {} is out of range for {} classes",
        class,
        k
    );
    Ok(masks.narrow(1, class as i64, 1))
}

/// Area-averages a mask down by `scale` along both spatial axes. Trailing
/// partial windows are averaged over their valid pixels only.
pub fn pool_mask(mask: &Tensor, scale: usize) -> Result<Tensor> {
    ensure!(scale > 0, "mask scale must be positive");
    if scale == 1 {
        return Ok(mask.shallow_clone());
    }
    let scale = scale as i64;
    let pooled = mask.avg_pool2d(
        &[scale, scale],
        &[scale, scale],
        &[0, 0],
        true,  // ceil_mode
        false, // count_include_pad
        None::<i64>,
    );
    Ok(pooled)
}

/// Sums `region × mask_k` for the redrawn class and `real × mask_c` for every
/// other class.
pub fn composite_regions(
    real_images: &Tensor,
    masks: &Tensor,
    class: usize,
    region: &Tensor,
) -> Result<Tensor> {
    let (_b, k, mask_h, mask_w) = masks.size4()?;
    let (_b, _c, image_h, image_w) = real_images.size4()?;
    ensure!(
        (mask_h, mask_w) == (image_h, image_w),
        "mask size {}x{} does not match image size {}x{}",
        mask_h,
        mask_w,
        image_h,
        image_w
    );
    ensure!(
        real_images.size() == region.size(),
        "region shape {:?} does not match image shape {:?}",
        region.size(),
        real_images.size()
    );

    (0..k as usize).try_fold(real_images.zeros_like(), |canvas, index| -> Result<_> {
        let mask = class_mask(masks, index)?;
        let addon = if index == class {
            region * mask
        } else {
            real_images * mask
        };
        Ok(canvas + addon)
    })
}
