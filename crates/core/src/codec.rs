//! Image codec adapter: files <-> BGR pixel arrays.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageError, RgbImage};
use ndarray::{Array3, Axis};

use crate::error::{Result, UpscaleError};
use crate::tensor::{PixelArray, CHANNELS};

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Decode any supported image into an 8-bit BGR array. Alpha is dropped,
/// grayscale is expanded and 16-bit samples are reduced to 8 bits.
pub fn decode_bgr(path: &Path) -> Result<PixelArray> {
    let decode_err = |source| UpscaleError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let rgb = image::ImageReader::open(path)
        .map_err(|e| decode_err(ImageError::IoError(e)))?
        .with_guessed_format()
        .map_err(|e| decode_err(ImageError::IoError(e)))?
        .decode()
        .map_err(decode_err)?
        .into_rgb8();

    Ok(rgb_to_bgr_array(rgb))
}

/// Encode a BGR array, picking the format from the file extension. The parent
/// directory must already exist.
pub fn encode_bgr(pixels: &PixelArray, path: &Path, jpeg_quality: u8) -> Result<()> {
    let encode_err = |source| UpscaleError::Encode {
        path: path.to_path_buf(),
        source,
    };

    let img = DynamicImage::ImageRgb8(bgr_array_to_rgb(pixels));

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("jpg" | "jpeg") => {
            let file = File::create(path).map_err(|e| encode_err(ImageError::IoError(e)))?;
            let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), jpeg_quality);
            img.write_with_encoder(encoder).map_err(encode_err)
        }
        _ => img.save(path).map_err(encode_err),
    }
}

fn rgb_to_bgr_array(rgb: RgbImage) -> PixelArray {
    let (width, height) = rgb.dimensions();
    let shape = (height as usize, width as usize, CHANNELS);
    let mut pixels = Array3::from_shape_vec(shape, rgb.into_raw())
        .expect("RgbImage buffer is exactly width * height * 3");
    for mut px in pixels.lanes_mut(Axis(2)) {
        px.swap(0, 2);
    }
    pixels
}

fn bgr_array_to_rgb(pixels: &PixelArray) -> RgbImage {
    let (h, w, _) = pixels.dim();
    let mut raw = Vec::with_capacity(h * w * CHANNELS);
    for px in pixels.lanes(Axis(2)) {
        raw.extend([px[2], px[1], px[0]]);
    }
    RgbImage::from_raw(w as u32, h as u32, raw).expect("buffer matches dimensions")
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::Rgb;
    use tempfile::tempdir;

    fn sample_rgb() -> RgbImage {
        RgbImage::from_fn(5, 3, |x, y| Rgb([x as u8 * 40, y as u8 * 80, 200]))
    }

    #[test]
    fn test_rgb_to_bgr_layout() {
        let pixels = rgb_to_bgr_array(sample_rgb());
        assert_eq!(pixels.dim(), (3, 5, 3));
        // (x=4, y=2) = RGB(160, 160, 200) -> BGR(200, 160, 160)
        assert_eq!(pixels[[2, 4, 0]], 200);
        assert_eq!(pixels[[2, 4, 1]], 160);
        assert_eq!(pixels[[2, 4, 2]], 160);
    }

    #[test]
    fn test_bgr_rgb_conversion_is_inverse() {
        let rgb = sample_rgb();
        assert_eq!(bgr_array_to_rgb(&rgb_to_bgr_array(rgb.clone())), rgb);
    }

    #[test]
    fn test_png_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.png");
        let pixels = rgb_to_bgr_array(sample_rgb());

        encode_bgr(&pixels, &path, DEFAULT_JPEG_QUALITY).unwrap();
        let decoded = decode_bgr(&path).unwrap();
        assert_eq!(decoded, pixels);
    }

    #[test]
    fn test_jpeg_encode_writes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.JPG");
        let pixels = rgb_to_bgr_array(sample_rgb());

        encode_bgr(&pixels, &path, 90).unwrap();
        let decoded = decode_bgr(&path).unwrap();
        assert_eq!(decoded.dim(), (3, 5, 3));
    }

    #[test]
    fn test_decode_non_image_is_decode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"definitely not pixels").unwrap();

        let err = decode_bgr(&path).unwrap_err();
        assert!(matches!(err, UpscaleError::Decode { .. }));
    }

    #[test]
    fn test_decode_missing_file_is_decode_error() {
        let err = decode_bgr(Path::new("/nonexistent/LR/a.png")).unwrap_err();
        assert!(matches!(err, UpscaleError::Decode { .. }));
    }

    #[test]
    fn test_encode_into_missing_directory_is_encode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results").join("a.png");
        let pixels = rgb_to_bgr_array(sample_rgb());

        let err = encode_bgr(&pixels, &path, DEFAULT_JPEG_QUALITY).unwrap_err();
        assert!(matches!(err, UpscaleError::Encode { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_encode_unknown_extension_is_encode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.unknownext");
        let pixels = rgb_to_bgr_array(sample_rgb());

        assert!(matches!(
            encode_bgr(&pixels, &path, DEFAULT_JPEG_QUALITY),
            Err(UpscaleError::Encode { .. })
        ));
    }
}
