//! Shared image decoding, grayscale statistics, naming and persistence helpers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage};
use log::warn;
use url::Url;
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

use crate::error::PipelineError;

pub const DEFAULT_IMAGE_EXTENSION: &str = "jpg";
const MAX_EXTENSION_LEN: usize = 5;

/// Near-white / near-black pixel fractions of a grayscale image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneFractions {
    pub white: f32,
    pub black: f32,
}

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xff && bytes[1] == 0xd8
}

fn decode_jpeg_non_strict(bytes: &[u8]) -> Option<DynamicImage> {
    if !looks_like_jpeg(bytes) {
        return None;
    }

    let options = DecoderOptions::new_cmd()
        .set_strict_mode(false)
        .jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(bytes, options);
    let pixels = decoder.decode().ok()?;
    let (width, height) = decoder.dimensions()?;
    let image = image::RgbaImage::from_raw(width as u32, height as u32, pixels)?;
    Some(DynamicImage::ImageRgba8(image))
}

/// Decodes with the primary `image` decoders, falling back to a lenient JPEG
/// decoder for truncated or trailing-garbage JPEGs.
pub fn decode_image_from_memory_with_fallback(bytes: &[u8]) -> Option<DynamicImage> {
    image::load_from_memory(bytes)
        .ok()
        .or_else(|| decode_jpeg_non_strict(bytes))
}

pub fn fit_to_max_edge(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }
    let clamped = max_edge.max(1);
    if width.max(height) <= clamped {
        return (width, height);
    }
    if width >= height {
        let scaled_height =
            ((u64::from(height) * u64::from(clamped)) + (u64::from(width) / 2)) / u64::from(width);
        (clamped, scaled_height.max(1) as u32)
    } else {
        let scaled_width =
            ((u64::from(width) * u64::from(clamped)) + (u64::from(height) / 2)) / u64::from(height);
        (scaled_width.max(1) as u32, clamped)
    }
}

/// Grayscale copy downscaled so neither edge exceeds `max_edge`.
pub fn downscaled_gray(image: &DynamicImage, max_edge: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    let (target_width, target_height) = fit_to_max_edge(width, height, max_edge);
    if target_width == width && target_height == height {
        return image.to_luma8();
    }
    image
        .resize(target_width, target_height, FilterType::Triangle)
        .to_luma8()
}

pub fn tone_fractions(gray: &GrayImage, white_level: u8, black_level: u8) -> Option<ToneFractions> {
    let total = gray.width() as usize * gray.height() as usize;
    if total == 0 {
        return None;
    }
    let (mut white, mut black) = (0usize, 0usize);
    for pixel in gray.pixels() {
        let level = pixel.0[0];
        if level > white_level {
            white += 1;
        } else if level < black_level {
            black += 1;
        }
    }
    Some(ToneFractions {
        white: white as f32 / total as f32,
        black: black as f32 / total as f32,
    })
}

/// Population standard deviation of the grayscale levels.
pub fn gray_std_dev(gray: &GrayImage) -> f32 {
    let total = gray.width() as usize * gray.height() as usize;
    if total == 0 {
        return 0.0;
    }
    let (sum, sum_sq) = gray.pixels().fold((0f64, 0f64), |(sum, sum_sq), pixel| {
        let level = f64::from(pixel.0[0]);
        (sum + level, sum_sq + level * level)
    });
    let mean = sum / total as f64;
    let variance = (sum_sq / total as f64 - mean * mean).max(0.0);
    variance.sqrt() as f32
}

pub fn detect_image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 8 && bytes[0..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some("png");
    }
    if bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF {
        return Some("jpg");
    }
    if bytes.len() >= 12 && bytes[0..4] == *b"RIFF" && bytes[8..12] == *b"WEBP" {
        return Some("webp");
    }
    if bytes.len() >= 6 && (&bytes[0..6] == b"GIF87a" || &bytes[0..6] == b"GIF89a") {
        return Some("gif");
    }
    if bytes.len() >= 2 && bytes[0] == b'B' && bytes[1] == b'M' {
        return Some("bmp");
    }
    None
}

fn extension_from_url(url: &str) -> Option<String> {
    let path = Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let basename = path.rsplit('/').next().unwrap_or_default();
    let (_, ext) = basename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    let usable = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|ch| ch.is_ascii_alphanumeric());
    usable.then_some(ext)
}

/// `<slug>.<ext>`, the extension taken from the URL path, else sniffed from
/// the bytes, else the default photographic extension.
pub fn derive_image_filename(url: &str, slug: &str, bytes: &[u8]) -> String {
    let ext = extension_from_url(url)
        .or_else(|| detect_image_extension(bytes).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_IMAGE_EXTENSION.to_string());
    format!("{slug}.{ext}")
}

pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Content hash -> file name for every regular file directly inside `dir`.
pub fn hash_existing_images(dir: &Path) -> HashMap<String, String> {
    let mut hashes = HashMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return hashes;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            continue;
        };
        match fs::read(&path) {
            Ok(bytes) => {
                hashes.insert(content_hash(&bytes), name);
            }
            Err(error) => warn!("Skipping unreadable image {}: {}", path.display(), error),
        }
    }
    hashes
}

/// Writes through a sibling temp file and renames into place.
pub fn write_atomic(target_path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = target_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|error| PipelineError::io(parent, error))?;
        }
    }
    let temp_path = temp_path_for(target_path);
    if temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }
    fs::write(&temp_path, bytes).map_err(|error| PipelineError::io(&temp_path, error))?;
    fs::rename(&temp_path, target_path).map_err(|error| PipelineError::io(target_path, error))
}

fn temp_path_for(target_path: &Path) -> PathBuf {
    let mut name = target_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target_path.with_file_name(name)
}
