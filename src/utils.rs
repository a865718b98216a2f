//! Utility functions
//!
use std::{
    fs::File,
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::Result;
use reqwest::Client;

/// Directory where downloaded model files are cached.
pub fn model_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("teachable_onnx")
}

/// Path of a cached model file, downloading it first if it is missing.
pub async fn ensure_model_file(filename: &str, url: &str) -> Result<PathBuf> {
    let cache_dir = model_cache_dir();
    std::fs::create_dir_all(&cache_dir)?;

    let filepath = cache_dir.join(filename);
    if !filepath.exists() {
        log::info!("Downloading {} to {}", url, filepath.display());
        download_file(url, &filepath).await?;
    }

    Ok(filepath)
}

/// Download a file from a URL to a given filepath.
async fn download_file(url: &str, filepath: &Path) -> Result<()> {
    let resp = Client::new().get(url).send().await?.error_for_status()?;

    let mut file = File::create(filepath)?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;

    Ok(())
}
