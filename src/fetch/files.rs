use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::Client;
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

/// Stream `url` to `dest` verbatim. Non-2xx responses are errors.
/// Returns the number of bytes written.
#[tracing::instrument(level = "debug", skip(client, dest), fields(dest = %dest.as_ref().display()))]
pub async fn download_to(client: &Client, url: &str, dest: impl AsRef<Path>) -> Result<u64> {
    let dest = dest.as_ref();
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?
        .error_for_status()
        .with_context(|| format!("GET {}", url))?;

    let mut out = fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;
    let mut body = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.with_context(|| format!("reading body from {}", url))?;
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    out.flush().await?;

    debug!(url, bytes = written, "downloaded");
    Ok(written)
}

/// Download `url` under `dest_dir`, keeping the last path segment as filename.
pub async fn download_into_dir(
    client: &Client,
    url_str: &str,
    dest_dir: impl AsRef<Path>,
) -> Result<PathBuf> {
    let url = Url::parse(url_str)?;
    let dest_path = dest_dir.as_ref().join(file_name_of(&url));
    download_to(client, url.as_str(), &dest_path).await?;
    Ok(dest_path)
}

/// Last non-empty path segment of `url`, or `download` when there is none.
pub fn file_name_of(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("download")
        .to_string()
}

/// Extract every file entry of `zip_path` into `dest_dir`, flattening nothing:
/// archive sub-directories are recreated. Returns the extracted paths sorted.
pub fn unzip(zip_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    let file =
        File::open(zip_path).with_context(|| format!("opening ZIP {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("reading ZIP archive {}", zip_path.display()))?;
    std::fs::create_dir_all(dest_dir)?;

    let mut out = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("accessing ZIP entry #{} in {}", i, zip_path.display()))?;
        if entry.is_dir() {
            continue;
        }
        // entries escaping the destination are skipped
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let target = dest_dir.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut w = File::create(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        io::copy(&mut entry, &mut w)
            .with_context(|| format!("extracting {}", target.display()))?;
        out.push(target);
    }
    out.sort();
    info!(archive = %zip_path.display(), files = out.len(), "unzipped");
    Ok(out)
}
