//! Binary PPM (P6) output for rendered RGBA float images.

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};

/// Encode `pixels` (row-major RGBA in `[0, 1]`) as P6. Alpha is dropped and
/// channels are clamped.
pub fn encode_ppm(width: u32, height: u32, pixels: &[[f32; 4]]) -> Result<Vec<u8>> {
    ensure!(
        pixels.len() == width as usize * height as usize,
        "image is {width}x{height} but {} pixels were given",
        pixels.len()
    );
    let header = format!("P6\n{width} {height}\n255\n");
    let mut out = Vec::with_capacity(header.len() + pixels.len() * 3);
    out.extend_from_slice(header.as_bytes());
    for px in pixels {
        for &c in &px[..3] {
            out.push((c.clamp(0.0, 1.0) * 255.0).round() as u8);
        }
    }
    Ok(out)
}

pub fn write_ppm(path: &Path, width: u32, height: u32, pixels: &[[f32; 4]]) -> Result<()> {
    let bytes = encode_ppm(width, height, pixels)?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_and_pixels() {
        let pixels = [[1.0, 0.0, 0.5, 1.0], [2.0, -1.0, 0.0, 0.0]];
        let bytes = encode_ppm(2, 1, &pixels).unwrap();
        let header = b"P6\n2 1\n255\n";
        assert_eq!(&bytes[..header.len()], header);
        assert_eq!(&bytes[header.len()..], &[255, 0, 128, 255, 0, 0]);
    }

    #[test]
    fn test_size_mismatch() {
        assert!(encode_ppm(2, 2, &[[0.0; 4]; 3]).is_err());
    }

    #[test]
    fn test_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ppm");
        write_ppm(&path, 1, 1, &[[0.0, 1.0, 0.0, 1.0]]).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"P6\n1 1\n255\n"));
        assert_eq!(&bytes[bytes.len() - 3..], &[0, 255, 0]);
    }
}
