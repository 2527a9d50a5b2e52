//! Compressed-token payloads.
//!
//! Miners ship their compressed context as a base64-encoded `.npy` array of shape
//! `(seq_len, hidden_size)`. [`decode_compressed_tokens`] turns that into a
//! [`CompressedTokens`]; [`encode_compressed_tokens`] does the reverse for clients and
//! tests. [`remote::fetch_npy`] downloads `.npy` files referenced by URL.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::constants::DEFAULT_MAX_DOWNLOAD_MB;

pub mod npy;
pub mod remote;


pub use npy::NpyArray;
pub use remote::fetch_npy;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid base64 payload: {reason}")]
    InvalidBase64 { reason: String },

    #[error("invalid .npy data: {reason}")]
    InvalidNpy { reason: String },

    #[error("unsupported .npy dtype '{dtype}' (expected f2, f4 or f8)")]
    UnsupportedDtype { dtype: String },

    #[error("expected a 2-D (seq_len, hidden) array, got shape {shape:?}")]
    InvalidShape { shape: Vec<usize> },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download failed with status {status}")]
    DownloadFailed { status: u16 },

    #[error("file size {size_mb:.2} MB exceeds the {max_mb} MB limit")]
    TooLarge { size_mb: f64, max_mb: u64 },
}

/// Miner-supplied embedding vectors, row-major `(seq_len, hidden_size)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedTokens {
    data: Vec<f32>,
    seq_len: usize,
    hidden_size: usize,
}

impl CompressedTokens {
    /// Wraps `data` as a `(seq_len, hidden_size)` array.
    pub fn new(data: Vec<f32>, seq_len: usize, hidden_size: usize) -> Result<Self, PayloadError> {
        if seq_len.checked_mul(hidden_size) != Some(data.len()) {
            return Err(PayloadError::InvalidShape {
                shape: vec![seq_len, hidden_size],
            });
        }
        Ok(Self {
            data,
            seq_len,
            hidden_size,
        })
    }

    /// Converts a parsed `.npy` array, which must be 2-D.
    pub fn from_npy(array: NpyArray) -> Result<Self, PayloadError> {
        match array.shape.as_slice() {
            &[seq_len, hidden_size] => Self::new(array.data, seq_len, hidden_size),
            _ => Err(PayloadError::InvalidShape { shape: array.shape }),
        }
    }

    #[inline]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    #[inline]
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Downloads a 2-D `.npy` array from `url`, capped at [`DEFAULT_MAX_DOWNLOAD_MB`].
    pub async fn fetch(url: &str) -> Result<Self, PayloadError> {
        Self::from_npy(fetch_npy(url, DEFAULT_MAX_DOWNLOAD_MB).await?)
    }
}

/// Decodes a base64 `.npy` payload into compressed tokens.
pub fn decode_compressed_tokens(encoded: &str) -> Result<CompressedTokens, PayloadError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| PayloadError::InvalidBase64 {
            reason: e.to_string(),
        })?;
    CompressedTokens::from_npy(npy::parse(&bytes)?)
}

/// Encodes compressed tokens as a base64 `.npy` payload (`<f4`, C order).
pub fn encode_compressed_tokens(tokens: &CompressedTokens) -> String {
    let bytes = npy::write(&[tokens.seq_len, tokens.hidden_size], &tokens.data);
    STANDARD.encode(bytes)
}
