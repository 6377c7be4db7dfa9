//! Local image handling around a drawing task: the scoped download file,
//! PNG/RGBA normalization, payload encoding and result persistence.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use image::{ColorType, DynamicImage, ImageFormat, ImageReader};
use tempfile::TempPath;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse image: {0}")]
    Unparseable(String),
    #[error("cannot convert image to PNG: {0}")]
    ConversionFailed(String),
    #[error("cannot save image to {path}: {detail}")]
    Save { path: PathBuf, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub base64: String,
    pub dimensions: ImageDimensions,
}

/// A per-invocation scratch file that is removed when dropped.
#[derive(Debug)]
pub struct TempImage {
    path: TempPath,
}

impl TempImage {
    pub fn create_in(dir: &Path, prefix: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".png")
            .tempfile_in(dir)?;
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, ImageError> {
    fs::read(path).map_err(|source| ImageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Sniffs the container format from magic bytes.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    infer::get(bytes)
        .and_then(|kind| ImageFormat::from_mime_type(kind.mime_type()))
        .or_else(|| image::guess_format(bytes).ok())
}

fn decode(bytes: &[u8]) -> Result<(ImageFormat, DynamicImage), ImageError> {
    let format = detect_format(bytes)
        .ok_or_else(|| ImageError::Unparseable("unrecognised image format".to_string()))?;
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|err| ImageError::Unparseable(format!("{format:?}: {err}")))?;
    Ok((format, image))
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Rewrites `path` in place as an RGBA8 PNG unless it already is one.
pub fn normalize_image(path: &Path) -> Result<ImageDimensions, ImageError> {
    let bytes = read_bytes(path)?;
    let (format, image) = decode(&bytes)?;
    let dimensions = ImageDimensions {
        width: image.width(),
        height: image.height(),
    };

    if format == ImageFormat::Png && image.color() == ColorType::Rgba8 {
        debug!(path = %path.display(), "Image already PNG/RGBA8");
        return Ok(dimensions);
    }

    debug!(
        path = %path.display(),
        from_format = ?format,
        from_color = ?image.color(),
        "Converting image to PNG/RGBA8"
    );
    let rgba = DynamicImage::ImageRgba8(image.into_rgba8());
    let png = encode_png(&rgba).map_err(|err| ImageError::ConversionFailed(err.to_string()))?;
    fs::write(path, png).map_err(|err| ImageError::ConversionFailed(err.to_string()))?;
    Ok(dimensions)
}

/// Checks that `path` holds a PNG that decodes to RGBA8.
pub fn validate_image(path: &Path) -> Result<ImageDimensions, ImageError> {
    let bytes = read_bytes(path)?;
    let image = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
        .map_err(|err| ImageError::Unparseable(err.to_string()))?;
    if image.color() != ColorType::Rgba8 {
        return Err(ImageError::Unparseable(format!(
            "expected RGBA8 pixels, found {:?}",
            image.color()
        )));
    }
    Ok(ImageDimensions {
        width: image.width(),
        height: image.height(),
    })
}

/// Base64 of the file's bytes as stored, with the header dimensions.
pub fn encode_image(path: &Path) -> Result<EncodedImage, ImageError> {
    let bytes = read_bytes(path)?;
    let (width, height) = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|err| ImageError::Unparseable(err.to_string()))?
        .into_dimensions()
        .map_err(|err| ImageError::Unparseable(err.to_string()))?;
    Ok(EncodedImage {
        base64: general_purpose::STANDARD.encode(&bytes),
        dimensions: ImageDimensions { width, height },
    })
}

pub fn decode_base64(payload: &str) -> Result<Vec<u8>, ImageError> {
    general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|err| ImageError::Unparseable(format!("invalid base64 payload: {err}")))
}

/// Re-encodes a finished image as `<dir>/<task_id>.png`.
pub fn save_png(bytes: &[u8], dir: &Path, task_id: &str) -> Result<PathBuf, ImageError> {
    let image = image::load_from_memory(bytes)
        .map_err(|err| ImageError::Unparseable(err.to_string()))?;
    fs::create_dir_all(dir).map_err(|source| ImageError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(format!("{}.png", sanitize_file_stem(task_id)));
    image
        .save_with_format(&path, ImageFormat::Png)
        .map_err(|err| ImageError::Save {
            path: path.clone(),
            detail: err.to_string(),
        })?;
    Ok(path)
}

// Task ids come from the remote service and end up in a file name.
fn sanitize_file_stem(task_id: &str) -> String {
    let stem: String = task_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "task".to_string()
    } else {
        stem
    }
}
