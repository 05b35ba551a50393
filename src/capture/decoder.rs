use jpeg_decoder::Decoder;

use super::frame::{FrameShape, PixelFormat};
use crate::error::{CaptureError, Result};

/// Decode a raw device buffer into tightly packed BGR24.
pub fn decode_frame(data: &[u8], format: PixelFormat, shape: FrameShape) -> Result<Vec<u8>> {
    let pixels = shape.width as usize * shape.height as usize;
    match format {
        PixelFormat::Mjpeg => decode_mjpeg(data, shape),
        PixelFormat::Yuyv4 => {
            if data.len() < pixels * 2 {
                return Err(short_buffer(data.len(), pixels * 2));
            }
            Ok(yuyv_to_bgr(&data[..pixels * 2]))
        }
        PixelFormat::Rgb24 => {
            if data.len() < pixels * 3 {
                return Err(short_buffer(data.len(), pixels * 3));
            }
            let mut out = data[..pixels * 3].to_vec();
            for px in out.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(out)
        }
        PixelFormat::Bgr24 => {
            if data.len() < pixels * 3 {
                return Err(short_buffer(data.len(), pixels * 3));
            }
            Ok(data[..pixels * 3].to_vec())
        }
    }
}

fn decode_mjpeg(data: &[u8], shape: FrameShape) -> Result<Vec<u8>> {
    let mut decoder = Decoder::new(data);
    let decoded = decoder
        .decode()
        .map_err(|e| CaptureError::Decode(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| CaptureError::Decode("missing JPEG header".into()))?;

    if u32::from(info.width) != shape.width || u32::from(info.height) != shape.height {
        return Err(CaptureError::Decode(format!(
            "JPEG is {}x{}, stream negotiated {}x{}",
            info.width, info.height, shape.width, shape.height
        )));
    }

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => {
            let mut out = decoded;
            for px in out.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(out)
        }
        jpeg_decoder::PixelFormat::L8 => {
            Ok(decoded.iter().flat_map(|&l| [l, l, l]).collect())
        }
        other => Err(CaptureError::Decode(format!(
            "unsupported JPEG pixel format {:?}",
            other
        ))),
    }
}

/// BT.601 limited-range YUYV (4:2:2) to BGR24
pub fn yuyv_to_bgr(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        push_bgr(&mut out, y0, u, v);
        push_bgr(&mut out, y1, u, v);
    }
    out
}

fn push_bgr(out: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    out.push(b.clamp(0, 255) as u8);
    out.push(g.clamp(0, 255) as u8);
    out.push(r.clamp(0, 255) as u8);
}

fn short_buffer(actual: usize, expected: usize) -> CaptureError {
    CaptureError::Decode(format!("buffer holds {actual} bytes, need {expected}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_swaps_to_bgr() {
        let shape = FrameShape::bgr(2, 1);
        let out = decode_frame(&[1, 2, 3, 4, 5, 6], PixelFormat::Rgb24, shape).unwrap();
        assert_eq!(out, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_yuyv_black_and_white() {
        // Two black pixels then two white pixels, neutral chroma
        let data = [16, 128, 16, 128, 235, 128, 235, 128];
        let out = yuyv_to_bgr(&data);
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..6], &[0, 0, 0, 0, 0, 0]);
        assert!(out[6..].iter().all(|&v| v == 255));
    }

    #[test]
    fn test_yuyv_short_buffer() {
        let shape = FrameShape::bgr(4, 4);
        let err = decode_frame(&[0u8; 8], PixelFormat::Yuyv4, shape).unwrap_err();
        assert!(matches!(err, CaptureError::Decode(_)));
    }

    #[test]
    fn test_garbage_jpeg_is_decode_error() {
        let shape = FrameShape::bgr(2, 2);
        let err = decode_frame(&[0xde, 0xad], PixelFormat::Mjpeg, shape).unwrap_err();
        assert!(err.is_transient());
    }
}
