//! Download of `.npy` arrays referenced by URL.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::CONTENT_LENGTH;
use tracing::{debug, info};

use super::PayloadError;
use super::npy::{self, NpyArray};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Downloads and parses the `.npy` file at `url`.
///
/// The advertised `content-length` is checked against `max_size_mb` before the body is
/// requested; a missing header counts as zero and the received body is checked again.
pub async fn fetch_npy(url: &str, max_size_mb: u64) -> Result<NpyArray, PayloadError> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;
    fetch_npy_with(&client, url, max_size_mb).await
}

/// [`fetch_npy`] over a caller-supplied client.
pub async fn fetch_npy_with(
    client: &reqwest::Client,
    url: &str,
    max_size_mb: u64,
) -> Result<NpyArray, PayloadError> {
    let head = client.head(url).send().await?;
    if head.status() != StatusCode::OK {
        return Err(PayloadError::DownloadFailed {
            status: head.status().as_u16(),
        });
    }

    let advertised = head
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    check_size(advertised, max_size_mb)?;
    debug!(url, bytes = advertised, "Fetching .npy file");

    let response = client.get(url).send().await?;
    if response.status() != StatusCode::OK {
        return Err(PayloadError::DownloadFailed {
            status: response.status().as_u16(),
        });
    }

    let body = response.bytes().await?;
    check_size(body.len() as u64, max_size_mb)?;

    let array = npy::parse(&body)?;
    info!(url, shape = ?array.shape, bytes = body.len(), "Downloaded .npy file");
    Ok(array)
}

fn check_size(bytes: u64, max_size_mb: u64) -> Result<(), PayloadError> {
    let size_mb = bytes as f64 / BYTES_PER_MB;
    if size_mb > max_size_mb as f64 {
        return Err(PayloadError::TooLarge {
            size_mb,
            max_mb: max_size_mb,
        });
    }
    Ok(())
}
