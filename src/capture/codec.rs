use std::io::Write;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder, RgbImage};

use super::frame::ImageFormat;
use crate::error::{CaptureError, Result};

/// Decode an MJPEG frame into RGB pixels
pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?;
    Ok(img.to_rgb8())
}

/// Convert packed YUV 4:2:2 (Y0 U Y1 V) to RGB. `stride` is the byte length
/// of one row as the driver lays it out; 0 means rows are tightly packed.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Result<RgbImage> {
    let row = width as usize * 2;
    let stride = if stride == 0 { row } else { stride as usize };
    let needed = match height as usize {
        0 => 0,
        rows => stride * (rows - 1) + row,
    };
    if data.len() < needed || stride < row || width % 2 != 0 {
        return Err(CaptureError::CaptureFailed(format!(
            "YUYV buffer of {} bytes does not hold a {}x{} frame with stride {}",
            data.len(),
            width,
            height,
            stride
        )));
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height as usize {
        let line = &data[y * stride..y * stride + row];
        for chunk in line.chunks_exact(4) {
            let u = chunk[1] as f32 - 128.0;
            let v = chunk[3] as f32 - 128.0;
            for luma in [chunk[0], chunk[2]] {
                let luma = luma as f32;
                rgb.push((luma + 1.140 * v).clamp(0.0, 255.0) as u8);
                rgb.push((luma - 0.395 * u - 0.581 * v).clamp(0.0, 255.0) as u8);
                rgb.push((luma + 2.032 * u).clamp(0.0, 255.0) as u8);
            }
        }
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| CaptureError::CaptureFailed("YUYV conversion size mismatch".into()))
}

/// Resize only when a target is given and differs from the source
pub fn fit(img: RgbImage, size: Option<(u32, u32)>) -> RgbImage {
    match size {
        Some((width, height)) if img.dimensions() != (width, height) => {
            image::imageops::resize(&img, width, height, FilterType::Triangle)
        }
        _ => img,
    }
}

/// Encode RGB pixels into `out`
pub fn encode_rgb(img: &RgbImage, format: ImageFormat, quality: u8, out: &mut dyn Write) -> Result<()> {
    let (width, height) = img.dimensions();
    match format {
        ImageFormat::Jpeg => JpegEncoder::new_with_quality(out, quality).write_image(
            img.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?,
        ImageFormat::Png => {
            PngEncoder::new(out).write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // two pixels, luma 16 and 235, no chroma
        let data = [16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&data, 2, 1, 0).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [16, 16, 16]);
        assert_eq!(rgb.get_pixel(1, 0).0, [235, 235, 235]);
    }

    #[test]
    fn test_yuyv_short_buffer_rejected() {
        let err = yuyv_to_rgb(&[0; 6], 2, 2, 0).unwrap_err();
        assert!(matches!(err, CaptureError::CaptureFailed(_)));
    }

    #[test]
    fn test_yuyv_padded_rows_are_skipped() {
        // 2x2 frame, rows padded to 8 bytes with bright filler
        let data = [
            16, 128, 16, 128, 255, 255, 255, 255, //
            235, 128, 235, 128, 255, 255, 255, 255,
        ];
        let rgb = yuyv_to_rgb(&data, 2, 2, 8).unwrap();
        assert_eq!(rgb.get_pixel(1, 0).0, [16, 16, 16]);
        assert_eq!(rgb.get_pixel(0, 1).0, [235, 235, 235]);

        // last row needs no padding after it
        assert!(yuyv_to_rgb(&data[..12], 2, 2, 8).is_ok());
        assert!(yuyv_to_rgb(&data, 2, 2, 2).is_err());
    }

    #[test]
    fn test_encoders_emit_expected_signatures() {
        let img = RgbImage::from_pixel(8, 8, image::Rgb([200, 10, 10]));

        let mut jpeg = Vec::new();
        encode_rgb(&img, ImageFormat::Jpeg, 80, &mut jpeg).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let mut png = Vec::new();
        encode_rgb(&img, ImageFormat::Png, 80, &mut png).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_mjpeg_decodes_back_to_dimensions() {
        let img = RgbImage::from_pixel(16, 8, image::Rgb([0, 0, 255]));
        let mut jpeg = Vec::new();
        encode_rgb(&img, ImageFormat::Jpeg, 90, &mut jpeg).unwrap();

        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[test]
    fn test_fit_resizes_only_on_mismatch() {
        let img = RgbImage::new(4, 4);
        assert_eq!(fit(img.clone(), None).dimensions(), (4, 4));
        assert_eq!(fit(img.clone(), Some((4, 4))).dimensions(), (4, 4));
        assert_eq!(fit(img, Some((2, 3))).dimensions(), (2, 3));
    }
}
