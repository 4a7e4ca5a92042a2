//! Pixel array <-> network tensor conversion.
//!
//! Host images are `H x W x 3` `u8` arrays in BGR order (the codec adapter's
//! layout). The network consumes and produces `1 x 3 x H x W` `f32` tensors in
//! RGB order with values in `[0, 1]`.

use anyhow::{bail, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array3, Array4, ArrayD, ArrayView4, IxDyn};

/// `H x W x 3`, BGR, `[0, 255]`.
pub type PixelArray = Array3<u8>;

/// `1 x 3 x H x W`, RGB, `[0, 1]`.
pub type ImageTensor = Array4<f32>;

pub const CHANNELS: usize = 3;

/// BGR HWC u8 -> RGB NCHW f32 with a batch dimension of 1.
pub fn normalize(pixels: &PixelArray) -> Result<ImageTensor> {
    let (h, w, c) = pixels.dim();
    if c != CHANNELS {
        bail!("expected {CHANNELS} channels, got {c}");
    }

    // Channel c of the tensor (R, G, B) reads BGR index 2 - c.
    Ok(Array4::from_shape_fn((1, CHANNELS, h, w), |(_, c, y, x)| {
        f32::from(pixels[[y, x, CHANNELS - 1 - c]]) / 255.0
    }))
}

/// RGB NCHW f32 (batch of 1) -> BGR HWC u8, clamping to `[0, 1]` before
/// scaling by 255 and rounding to nearest.
pub fn denormalize(output: ArrayView4<'_, f32>) -> Result<PixelArray> {
    let (n, c, h, w) = output.dim();
    if n != 1 || c != CHANNELS {
        bail!("expected output shape [1, {CHANNELS}, H, W], got {:?}", output.shape());
    }

    Ok(Array3::from_shape_fn((h, w, CHANNELS), |(y, x, c)| {
        quantize(output[[0, CHANNELS - 1 - c, y, x]])
    }))
}

#[inline]
fn quantize(value: f32) -> u8 {
    // NaN survives clamp; the saturating cast maps it to 0.
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// f32 NCHW -> f16 NCHW, for FP16 exports of the network.
pub fn to_f16(input: &ImageTensor) -> Result<ArrayD<f16>> {
    let contiguous = input.as_standard_layout();
    let Some(slice) = contiguous.as_slice() else {
        bail!("input tensor is not contiguous");
    };
    let mut data = vec![f16::ZERO; slice.len()];
    data.convert_from_f32_slice(slice);
    Ok(ArrayD::from_shape_vec(IxDyn(input.shape()), data)?)
}

/// f16 tensor of any rank -> f32 NCHW.
pub fn from_f16(output: ArrayD<f16>) -> Result<ImageTensor> {
    let contiguous = output.as_standard_layout();
    let Some(slice) = contiguous.as_slice() else {
        bail!("output tensor is not contiguous");
    };
    let mut data = vec![0.0f32; slice.len()];
    slice.convert_to_f32_slice(&mut data);
    let array = ArrayD::from_shape_vec(IxDyn(output.shape()), data)?;
    Ok(array.into_dimensionality()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgr_pattern(h: usize, w: usize) -> PixelArray {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| ((y * 31 + x * 7 + c * 85) % 256) as u8)
    }

    #[test]
    fn test_normalize_shape_and_channel_order() {
        let mut pixels = Array3::<u8>::zeros((2, 3, 3));
        // One pure-blue pixel in BGR order.
        pixels[[1, 2, 0]] = 255;

        let tensor = normalize(&pixels).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 2, 3]);
        assert_eq!(tensor[[0, 2, 1, 2]], 1.0); // B lands in the last RGB plane
        assert_eq!(tensor[[0, 0, 1, 2]], 0.0);
        assert_eq!(tensor.iter().filter(|v| **v != 0.0).count(), 1);
    }

    #[test]
    fn test_normalize_range() {
        let tensor = normalize(&bgr_pattern(8, 8)).unwrap();
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_every_byte_roundtrips() {
        let values: Vec<u8> = (0..=255u8).collect();
        let pixels = Array3::from_shape_fn((16, 16, 3), |(y, x, c)| {
            values[(y * 16 + x + c * 37) % 256]
        });

        let tensor = normalize(&pixels).unwrap();
        let restored = denormalize(tensor.view()).unwrap();
        assert_eq!(restored, pixels);
    }

    #[test]
    fn test_denormalize_clamps_out_of_range_values() {
        let mut tensor = Array4::<f32>::zeros((1, 3, 1, 4));
        tensor[[0, 0, 0, 0]] = -3.5;
        tensor[[0, 0, 0, 1]] = 7.0;
        tensor[[0, 0, 0, 2]] = f32::NAN;
        tensor[[0, 0, 0, 3]] = f32::INFINITY;

        let pixels = denormalize(tensor.view()).unwrap();
        // R is the last BGR channel.
        assert_eq!(pixels[[0, 0, 2]], 0);
        assert_eq!(pixels[[0, 1, 2]], 255);
        assert_eq!(pixels[[0, 2, 2]], 0);
        assert_eq!(pixels[[0, 3, 2]], 255);
    }

    #[test]
    fn test_denormalize_rounds_to_nearest() {
        let mut tensor = Array4::<f32>::zeros((1, 3, 1, 2));
        tensor[[0, 1, 0, 0]] = 100.4 / 255.0;
        tensor[[0, 1, 0, 1]] = 100.6 / 255.0;

        let pixels = denormalize(tensor.view()).unwrap();
        assert_eq!(pixels[[0, 0, 1]], 100);
        assert_eq!(pixels[[0, 1, 1]], 101);
    }

    #[test]
    fn test_denormalize_rejects_wrong_shape() {
        let tensor = Array4::<f32>::zeros((2, 3, 4, 4));
        assert!(denormalize(tensor.view()).is_err());

        let tensor = Array4::<f32>::zeros((1, 4, 4, 4));
        assert!(denormalize(tensor.view()).is_err());
    }

    #[test]
    fn test_normalize_rejects_non_rgb_array() {
        let pixels = Array3::<u8>::zeros((4, 4, 4));
        assert!(normalize(&pixels).is_err());
    }

    #[test]
    fn test_f16_roundtrip_within_precision() {
        let tensor = normalize(&bgr_pattern(4, 5)).unwrap();
        let half = to_f16(&tensor).unwrap();
        assert_eq!(half.shape(), &[1, 3, 4, 5]);

        let back = from_f16(half).unwrap();
        let restored = denormalize(back.view()).unwrap();
        assert_eq!(restored, bgr_pattern(4, 5));
    }
}
