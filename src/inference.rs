use burn::prelude::*;
use image::{RgbImage, imageops::FilterType};

use crate::model::dpt::{DinoBackbone, DptDinov2, PATCH_SIZE};

/// Channel statistics the pretrained backbone was trained with.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts packed RGB bytes into a normalized tensor suitable for
/// [`DptDinov2::infer`].
///
/// The input slice must contain `width * height * 3` bytes in row-major
/// order. The output tensor is channel-first (`NCHW`), standardized with the
/// backbone's per-channel statistics.
pub fn rgb_to_input_tensor<B: Backend>(
    rgb: &[u8],
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>, String> {
    let expected_len = width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(3))
        .ok_or_else(|| "image dimensions overflowed while preparing input".to_string())?;

    if rgb.len() != expected_len {
        return Err(format!(
            "expected {expected_len} RGB bytes for {width}x{height}, got {}",
            rgb.len()
        ));
    }

    let hw = width * height;
    let mut data = vec![0.0f32; 3 * hw];

    for (idx, pixel) in rgb.chunks_exact(3).enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * hw + idx] = (value - MEAN[channel]) / STD[channel];
        }
    }

    Ok(
        Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([
            1,
            3,
            height as i32,
            width as i32,
        ]),
    )
}

/// Resizes an image so its shorter side reaches `target` and both sides land
/// on multiples of the backbone patch size, keeping the aspect ratio.
///
/// Rounding is toward the next multiple, so the shorter side never drops
/// below `target` (lower-bound fit).
pub fn fit_to_patch_grid(image: &RgbImage, target: usize) -> Result<RgbImage, String> {
    if target == 0 || target % PATCH_SIZE != 0 {
        return Err(format!(
            "target resolution {target} must be a positive multiple of {PATCH_SIZE}"
        ));
    }

    let (width, height) = (image.width() as usize, image.height() as usize);
    if width == 0 || height == 0 {
        return Err("cannot fit an empty image".to_string());
    }

    let scale = target as f32 / width.min(height) as f32;
    let fitted_width = next_patch_multiple((width as f32 * scale).round() as usize);
    let fitted_height = next_patch_multiple((height as f32 * scale).round() as usize);

    if fitted_width == width && fitted_height == height {
        return Ok(image.clone());
    }

    Ok(image::imageops::resize(
        image,
        fitted_width as u32,
        fitted_height as u32,
        FilterType::CatmullRom,
    ))
}

fn next_patch_multiple(value: usize) -> usize {
    value.max(PATCH_SIZE).div_ceil(PATCH_SIZE) * PATCH_SIZE
}

/// Runs depth inference directly from packed RGB bytes.
///
/// This helper combines [`rgb_to_input_tensor`] and [`DptDinov2::infer`],
/// making it convenient to integrate inference in external applications
/// without reimplementing the preprocessing pipeline. The image sides must
/// already be multiples of the patch size (see [`fit_to_patch_grid`]).
pub fn infer_from_rgb<B: Backend, V: DinoBackbone<B>>(
    model: &DptDinov2<B, V>,
    rgb: &[u8],
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Tensor<B, 3>, String> {
    let input = rgb_to_input_tensor::<B>(rgb, width, height, device)?;
    model.infer(input).map_err(|err| err.to_string())
}
