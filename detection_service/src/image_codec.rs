use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, ImageReader, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageCodecError {
    #[error("Image data is empty")]
    EmptyData,
    #[error("Unrecognized image format: {0}")]
    UnknownFormat(String),
    #[error("Failed to decode image: {0}")]
    DecodeFailed(String),
    #[error("Failed to encode image: {0}")]
    EncodeFailed(String),
}

/// Decodes any supported raster format into an RGB bitmap. The format is
/// guessed from the magic bytes, never from the client supplied name.
pub fn decode_image(image_data: &[u8]) -> Result<RgbImage, ImageCodecError> {
    if image_data.is_empty() {
        return Err(ImageCodecError::EmptyData);
    }

    let image_reader = ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| ImageCodecError::UnknownFormat(e.to_string()))?;

    if image_reader.format().is_none() {
        return Err(ImageCodecError::UnknownFormat(
            "no known signature in image data".into(),
        ));
    }

    let image = image_reader
        .decode()
        .map_err(|e| ImageCodecError::DecodeFailed(e.to_string()))?;

    Ok(image.to_rgb8())
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, ImageCodecError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| ImageCodecError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

pub fn encode_png_base64(image: &RgbImage) -> Result<String, ImageCodecError> {
    Ok(STANDARD.encode(encode_png(image)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba, RgbaImage};

    #[test]
    fn test_decode_converts_to_rgb() {
        let img = RgbaImage::from_pixel(8, 4, Rgba([10, 20, 30, 128]));
        let mut data = Vec::new();
        img.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
            .unwrap();

        let decoded = decode_image(&data).unwrap();

        assert_eq!(decoded.dimensions(), (8, 4));
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_image(&[]), Err(ImageCodecError::EmptyData)));
        assert!(matches!(
            decode_image(b"hello world, not a picture"),
            Err(ImageCodecError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_png() {
        let img = RgbImage::from_pixel(32, 32, Rgb([1, 2, 3]));
        let data = encode_png(&img).unwrap();

        assert!(matches!(
            decode_image(&data[..data.len() / 2]),
            Err(ImageCodecError::DecodeFailed(_))
        ));
    }

    #[test]
    fn test_base64_payload_is_png() {
        let img = RgbImage::from_pixel(3, 2, Rgb([0, 0, 0]));
        let encoded = encode_png_base64(&img).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
    }
}
