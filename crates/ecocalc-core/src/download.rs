//! Fetching remote rasters over HTTP.
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{EcocalcError, Result};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub fn is_url(s: &str) -> bool {
    let lower = s.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Last path segment of a URL, without query string or fragment.
pub fn url_file_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Download `url` to `target`. The body is written to `<target>.part` and
/// renamed on success, so a partial download never looks complete.
pub fn download_url(url: &str, target: &Path, skip_if_exists: bool) -> Result<()> {
    if skip_if_exists && target.exists() {
        debug!(target = %target.display(), "already downloaded");
        return Ok(());
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    info!(url, target = %target.display(), "downloading");

    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;
    let mut response = client.get(url).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(EcocalcError::Http { url: url.to_string(), status: status.as_u16() });
    }

    let part = part_path(target);
    {
        let mut out = BufWriter::new(File::create(&part)?);
        let bytes = response.copy_to(&mut out)?;
        debug!(bytes, "download complete");
    }
    fs::rename(&part, target)?;
    Ok(())
}
