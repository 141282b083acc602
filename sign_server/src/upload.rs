//! Storage and decoding of uploaded media files.
//!
use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage};
use unicode_normalization::UnicodeNormalization;

/// File extensions accepted for uploads.
pub const ALLOWED_EXTENSIONS: [&str; 7] = ["mp4", "avi", "mov", "mkv", "jpg", "jpeg", "png"];

/// Name used when sanitizing leaves nothing of the uploaded filename.
const FALLBACK_FILENAME: &str = "upload";

/// Whether the filename carries one of the [`ALLOWED_EXTENSIONS`] (case-insensitive).
pub fn has_allowed_extension(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, extension)) => ALLOWED_EXTENSIONS
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension)),
        None => false,
    }
}

/// Reduce a client-supplied filename to a safe, flat ASCII name.
///
/// Characters are decomposed first (NFKD) so accented letters keep their base letter.
/// Path separators become whitespace, whitespace runs become `_`, everything outside
/// `[A-Za-z0-9_.-]` is removed and leading or trailing dots and underscores are stripped,
/// so the result can never leave the upload directory.
pub fn secure_filename(filename: &str) -> String {
    let flattened: String = filename
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    match cleaned.trim_matches(|c| c == '.' || c == '_') {
        "" => FALLBACK_FILENAME.to_owned(),
        name => name.to_owned(),
    }
}

/// Store uploaded data under `dir` with a sanitized version of `filename`.
///
/// An existing file of the same name is replaced.
pub async fn save_upload(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf> {
    if !has_allowed_extension(filename) {
        log::warn!("Upload {filename:?} has an unexpected file extension");
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create upload directory {}", dir.display()))?;
    let path = dir.join(secure_filename(filename));
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("failed to save upload {}", path.display()))?;
    log::info!("Saved upload to {} ({} bytes)", path.display(), data.len());

    Ok(path)
}

/// Decode an uploaded image, turned upright according to its EXIF orientation.
pub fn decode_image(data: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(data)?;
    let orientation = exif::Reader::new()
        .read_from_container(&mut Cursor::new(data))
        .ok()
        .and_then(|exif| {
            exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1);
    if orientation != 1 {
        log::debug!("Applying EXIF orientation {orientation}");
    }

    Ok(apply_orientation(image, orientation).to_rgb8())
}

/// Undo the transformation described by an EXIF orientation value (1 to 8).
pub fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}
