//! Base image acquisition: fetch over HTTP into a local staging file, then
//! import into the images pool with format validation.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::backend::StorageBackend;
use crate::error::ForgeError;
use crate::storage::{StorageManager, VolumeInfo};

/// Download a response body to a file, updating the progress bar as chunks
/// arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), ForgeError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ForgeError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| ForgeError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| ForgeError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(())
}

/// Download `url` into `staging_dir`, returning the downloaded file's path.
/// A partial download never becomes visible under the final name: data lands
/// in a `.part` file that is renamed only on success.
pub async fn fetch_image(url: &str, staging_dir: &Path) -> Result<PathBuf, ForgeError> {
    let filename = url.rsplit('/').next().unwrap_or("image.img");

    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("creating staging dir {}", staging_dir.display()),
            source: e,
        })?;

    let dest = staging_dir.join(filename);
    tracing::info!(url, "downloading image");

    let response = reqwest::get(url)
        .await
        .map_err(|e| ForgeError::ImageDownload {
            message: format!("request to {url} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(ForgeError::ImageDownload {
            message: format!("HTTP {} from {url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let tmp_path = dest.with_extension("part");

    // Remove any stale .part file from a previous failed download
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "image downloaded");

    Ok(dest)
}

/// Fetch an image from a URL and import it into the images pool under
/// `name`. The staging file is removed after a successful import.
pub async fn fetch_and_import<B: StorageBackend>(
    storage: &StorageManager<B>,
    url: &str,
    name: &str,
    staging_dir: &Path,
) -> Result<VolumeInfo, ForgeError> {
    let staged = fetch_image(url, staging_dir).await?;
    let info = storage.import_image(&staged, name)?;
    if let Err(e) = tokio::fs::remove_file(&staged).await {
        tracing::warn!(path = %staged.display(), error = %e, "failed to remove staged image");
    }
    Ok(info)
}

/// Print the images pool's contents with human-readable sizes.
pub fn print_images<B: StorageBackend>(storage: &StorageManager<B>) -> Result<(), ForgeError> {
    let pool = storage.layout().images_pool.clone();
    let mut images = storage.list_volumes(&pool)?;
    if images.is_empty() {
        println!("No images in pool '{pool}'.");
        return Ok(());
    }
    images.sort_by(|a, b| a.name.cmp(&b.name));

    let total: u64 = images.iter().map(|i| i.capacity).sum();
    for image in &images {
        println!("  {}  {}", image.name, format_size(image.capacity));
    }
    println!("\n{} image(s), {} total", images.len(), format_size(total));
    Ok(())
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_pick_sensible_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
    }
}
