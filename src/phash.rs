//! Perceptual image hashing.
//!
//! Two complementary 64-bit fingerprints are computed per image:
//!
//! - **pHash**: grayscale, resized to 32×32, 2-D DCT-II; the 8×8 lowest
//!   frequencies are thresholded against the median of the 63 AC terms.
//!   Robust to re-encoding, resizing and small overlays.
//! - **dHash**: grayscale, resized to 9×8; each bit records whether a pixel
//!   is darker than its right-hand neighbour. Cheap and sensitive to layout,
//!   which makes it a good confirmation for pHash candidates.
//!
//! Similar images produce hashes with a small Hamming distance.

use std::fmt;
use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat, ImageReader};

use crate::error::HashError;

const DCT_SIZE: u32 = 32;
const LOW_FREQ: usize = 8;

/// The pair of fingerprints for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash {
    pub phash: u64,
    pub dhash: u64,
}

impl PerceptualHash {
    pub fn phash_hex(&self) -> String {
        format!("{:016x}", self.phash)
    }

    pub fn dhash_hex(&self) -> String {
        format!("{:016x}", self.dhash)
    }

    pub fn from_hex(phash: &str, dhash: &str) -> Option<Self> {
        if phash.len() != 16 || dhash.len() != 16 {
            return None;
        }
        Some(Self {
            phash: u64::from_str_radix(phash, 16).ok()?,
            dhash: u64::from_str_radix(dhash, 16).ok()?,
        })
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.phash_hex(), self.dhash_hex())
    }
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// A decoded, hashed image ready to be named and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedImage {
    pub hash: PerceptualHash,
    pub width: u32,
    pub height: u32,
    /// File extension matching the encoded format (`jpg`, `png`, ...).
    pub extension: &'static str,
}

/// Turns raw bytes into a [`HashedImage`].
///
/// The orchestrator calls this on the blocking thread pool.
pub trait ImageHasher: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> Result<HashedImage, HashError>;
}

/// The production hasher: decodes with the `image` crate and computes
/// pHash + dHash.
pub struct PerceptualHasher;

impl ImageHasher for PerceptualHasher {
    fn hash(&self, bytes: &[u8]) -> Result<HashedImage, HashError> {
        let (gray, width, height, format) = decode(bytes)?;
        Ok(HashedImage {
            hash: hash_gray(&gray),
            width,
            height,
            extension: extension_for(format)
                .ok_or_else(|| HashError::InvalidImage(format!("unsupported format {:?}", format)))?,
        })
    }
}

/// Compute both hashes for encoded image bytes.
pub fn compute_hash(bytes: &[u8]) -> Result<PerceptualHash, HashError> {
    let (gray, _, _, _) = decode(bytes)?;
    Ok(hash_gray(&gray))
}

fn decode(bytes: &[u8]) -> Result<(GrayImage, u32, u32, ImageFormat), HashError> {
    if bytes.is_empty() {
        return Err(HashError::InvalidImage("empty body".to_string()));
    }
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| HashError::InvalidImage(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| HashError::InvalidImage("unrecognised format".to_string()))?;
    if extension_for(format).is_none() {
        return Err(HashError::InvalidImage(format!(
            "unsupported format {:?}",
            format
        )));
    }
    let img = reader
        .decode()
        .map_err(|e| HashError::InvalidImage(e.to_string()))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(HashError::InvalidImage("zero-sized image".to_string()));
    }
    Ok((img.to_luma8(), img.width(), img.height(), format))
}

fn extension_for(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::Png => Some("png"),
        ImageFormat::WebP => Some("webp"),
        ImageFormat::Gif => Some("gif"),
        ImageFormat::Bmp => Some("bmp"),
        ImageFormat::Tiff => Some("tiff"),
        _ => None,
    }
}

pub fn hash_gray(gray: &GrayImage) -> PerceptualHash {
    PerceptualHash {
        phash: phash(gray),
        dhash: dhash(gray),
    }
}

fn phash(gray: &GrayImage) -> u64 {
    let small = imageops::resize(gray, DCT_SIZE, DCT_SIZE, FilterType::Triangle);
    let n = DCT_SIZE as usize;

    // cos[k][i] = cos((2i + 1) k π / 2N) for the low frequencies only
    let cos: Vec<Vec<f64>> = (0..LOW_FREQ)
        .map(|k| {
            (0..n)
                .map(|i| {
                    ((2 * i + 1) as f64 * k as f64 * std::f64::consts::PI / (2 * n) as f64).cos()
                })
                .collect()
        })
        .collect();

    let pixels: Vec<f64> = small.pixels().map(|p| p.0[0] as f64).collect();

    // Rows first: row_dct[y][u] = Σx f(x, y) cos[u][x]
    let mut row_dct = vec![[0.0f64; LOW_FREQ]; n];
    for (y, row) in row_dct.iter_mut().enumerate() {
        for (u, out) in row.iter_mut().enumerate() {
            *out = (0..n).map(|x| pixels[y * n + x] * cos[u][x]).sum();
        }
    }

    let mut coeffs = [0.0f64; LOW_FREQ * LOW_FREQ];
    for v in 0..LOW_FREQ {
        for u in 0..LOW_FREQ {
            coeffs[v * LOW_FREQ + u] = (0..n).map(|y| row_dct[y][u] * cos[v][y]).sum();
        }
    }

    let mut ac: Vec<f64> = coeffs[1..].to_vec();
    ac.sort_by(|a, b| a.total_cmp(b));
    let median = ac[ac.len() / 2];

    coeffs
        .iter()
        .fold(0u64, |acc, c| (acc << 1) | u64::from(*c > median))
}

fn dhash(gray: &GrayImage) -> u64 {
    let small = imageops::resize(gray, 9, 8, FilterType::Triangle);
    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = small.get_pixel(x, y).0[0];
            let right = small.get_pixel(x + 1, y).0[0];
            hash = (hash << 1) | u64::from(left < right);
        }
    }
    hash
}
