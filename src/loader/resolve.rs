//! Turns a checkpoint identifier into a readable local file.
//!
//! Lookup order: the identifier as a path, then `<weights_dir>/<file name>`,
//! then a download of a published release asset to the identifier path.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::loader::LoaderError;

pub const ASSET_RELEASE_URL: &str = "https://github.com/ultralytics/assets/releases/download/v8.2.0";

/// Detection checkpoints published as release assets.
pub const RELEASE_ASSETS: &[&str] = &[
    "yolov8n.pt",
    "yolov8s.pt",
    "yolov8m.pt",
    "yolov8l.pt",
    "yolov8x.pt",
];

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct CheckpointResolver {
    weights_dir: PathBuf,
    download: bool,
}

impl CheckpointResolver {
    pub fn new(weights_dir: impl Into<PathBuf>, download: bool) -> Self {
        Self {
            weights_dir: weights_dir.into(),
            download,
        }
    }

    pub fn resolve(&self, identifier: &str) -> Result<PathBuf, LoaderError> {
        if identifier.trim().is_empty() {
            return Err(LoaderError::NotFound("empty checkpoint identifier".to_string()));
        }

        let direct = PathBuf::from(identifier);
        if direct.is_file() {
            debug!(path = %direct.display(), "using local checkpoint");
            return Ok(direct);
        }

        let file_name = direct
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LoaderError::NotFound(identifier.to_string()))?;

        let cached = self.weights_dir.join(file_name);
        if cached.is_file() {
            debug!(path = %cached.display(), "using checkpoint from weights dir");
            return Ok(cached);
        }

        if !RELEASE_ASSETS.contains(&file_name) {
            return Err(LoaderError::NotFound(identifier.to_string()));
        }
        if !self.download {
            return Err(LoaderError::NotFound(format!(
                "{} (not present locally and downloads are disabled)",
                identifier
            )));
        }

        let url = format!("{}/{}", ASSET_RELEASE_URL, file_name);
        download(&url, &direct)?;
        Ok(direct)
    }
}

fn download(url: &str, dest: &Path) -> Result<(), LoaderError> {
    info!(url, dest = %dest.display(), "downloading checkpoint");

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| LoaderError::Download(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| LoaderError::Download(e.to_string()))?;

    if !response.status().is_success() {
        return Err(LoaderError::Download(format!(
            "HTTP {}: {}",
            response.status(),
            response.status().canonical_reason().unwrap_or("")
        )));
    }

    let mut partial = dest.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let result = (|| -> Result<u64, LoaderError> {
        let mut file = fs::File::create(&partial)?;
        let written = response
            .copy_to(&mut file)
            .map_err(|e| LoaderError::Download(e.to_string()))?;
        file.flush()?;
        Ok(written)
    })();

    match result {
        Ok(written) if written > 0 => {
            fs::rename(&partial, dest)?;
            info!(bytes = written, "download complete");
            Ok(())
        }
        Ok(_) => {
            let _ = fs::remove_file(&partial);
            Err(LoaderError::Download(format!("{} returned an empty body", url)))
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}
