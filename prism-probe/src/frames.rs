//! Writes streamed frames to disk.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use prism_core::{CommandError, Image, ImageSink};

fn extension(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/x-exr" | "image/exr" => "exr",
        _ => "bin",
    }
}

/// Writes one frame into `dir`. Encoded images keep their format; canvases
/// are dumped as raw layers with the geometry in the file name.
pub fn write_frame(dir: &Path, index: u64, image: &Image) -> io::Result<PathBuf> {
    let path = match image {
        Image::Encoded(binary) => {
            let path = dir.join(format!("frame_{index:06}.{}", extension(&binary.mime)));
            std::fs::write(&path, &binary.data)?;
            path
        }
        Image::Canvas(canvas) => {
            let path = dir.join(format!(
                "frame_{index:06}_{}x{}_{}.raw",
                canvas.width(),
                canvas.height(),
                canvas.pixel_format()
            ));
            std::fs::write(&path, canvas.layers().concat())?;
            path
        }
    };
    Ok(path)
}

/// Image sink that numbers and saves every displayed frame.
#[derive(Debug)]
pub struct FrameWriter {
    dir: PathBuf,
    next: AtomicU64,
}

impl FrameWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            next: AtomicU64::new(0),
        }
    }
}

impl ImageSink for FrameWriter {
    fn show(&self, image: &Image) {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        match write_frame(&self.dir, index, image) {
            Ok(path) => log::debug!("wrote {}", path.display()),
            Err(e) => log::error!("failed to write frame {index}: {e}"),
        }
    }

    fn failed(&self, error: &CommandError) {
        log::error!("stream ended: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{Binary, Canvas, PixelFormat};

    #[test]
    fn test_encoded_frame_keeps_format() {
        let dir = tempfile::tempdir().unwrap();
        let image = Image::Encoded(Binary::new("image/png", vec![1, 2, 3]));
        let path = write_frame(dir.path(), 4, &image).unwrap();
        assert_eq!(path.file_name().unwrap(), "frame_000004.png");
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_canvas_frame_is_raw_layers() {
        let dir = tempfile::tempdir().unwrap();
        let canvas = Canvas::new(2, 1, PixelFormat::Rgb, vec![vec![0; 6], vec![1; 6]]).unwrap();
        let path = write_frame(dir.path(), 0, &Image::Canvas(canvas)).unwrap();
        assert_eq!(path.file_name().unwrap(), "frame_000000_2x1_Rgb.raw");
        assert_eq!(std::fs::read(path).unwrap().len(), 12);
    }

    #[test]
    fn test_writer_numbers_frames() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FrameWriter::new(dir.path().to_path_buf());
        let image = Image::Encoded(Binary::new("application/octet-stream", vec![0]));
        writer.show(&image);
        writer.show(&image);
        assert!(dir.path().join("frame_000001.bin").exists());
    }
}
