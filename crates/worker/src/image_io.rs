//! Image loading and saving
//!
//! Inputs are read from the discovery location, outputs land in the output
//! location under the original base filename. Formats are inferred from the
//! file contents on read and from the extension on write.

use image::io::Reader as ImageReader;
use image::RgbImage;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use styleflow_common::{Result, StyleFlowError};

/// Load an image file as 8-bit RGB.
pub fn load_image(path: &Path) -> Result<RgbImage> {
    let file = File::open(path)
        .map_err(|e| StyleFlowError::image(format!("Failed to open {}: {}", path.display(), e)))?;

    let reader = ImageReader::new(BufReader::new(file))
        .with_guessed_format()
        .map_err(|e| StyleFlowError::image(format!("Failed to probe {}: {}", path.display(), e)))?;

    let img = reader
        .decode()
        .map_err(|e| StyleFlowError::image(format!("Failed to decode {}: {}", path.display(), e)))?;

    Ok(img.to_rgb8())
}

/// Save an RGB image; the encoder is chosen from the path's extension.
pub fn save_image(path: &Path, image: &RgbImage) -> Result<()> {
    image
        .save(path)
        .map_err(|e| StyleFlowError::image(format!("Failed to write {}: {}", path.display(), e)))
}

/// Destination for an input file: the same base filename under `output_dir`.
pub fn output_path(input: &Path, output_dir: &Path) -> Result<PathBuf> {
    let name = input.file_name().ok_or_else(|| {
        StyleFlowError::image(format!("Input {} has no file name", input.display()))
    })?;
    Ok(output_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.png");

        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(3, 1, Rgb([0, 0, 255]));
        save_image(&path, &img).unwrap();

        let loaded = load_image(&path).unwrap();
        assert_eq!(loaded.dimensions(), (4, 2));
        assert_eq!(loaded.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(loaded.get_pixel(3, 1), &Rgb([0, 0, 255]));
    }

    #[test]
    fn test_load_rejects_non_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        assert!(load_image(&path).is_err());
    }

    #[test]
    fn test_output_path_keeps_base_name() {
        let out = output_path(Path::new("/data/in/cat.jpg"), Path::new("/data/out")).unwrap();
        assert_eq!(out, PathBuf::from("/data/out/cat.jpg"));

        assert!(output_path(Path::new("/"), Path::new("/data/out")).is_err());
    }
}
