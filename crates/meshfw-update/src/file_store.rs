//! Scratch-directory file management
//!
//! Downloads, archive extraction and byte copies used by the retriever and the
//! transport handlers. Everything written here lands in one scratch directory
//! that the orchestrator purges at the start and end of every task.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::UpdateConfig;
use crate::error::{FirmwareUpdateError, Result};
use crate::model::DeviceHardware;

/// Progress callback receiving a fraction in `0.0..=1.0`
pub type ProgressFn<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Scratch-directory manager with an HTTP client
#[derive(Debug, Clone)]
pub struct FileStore {
    client: reqwest::Client,
    scratch_dir: PathBuf,
    chunk_size: usize,
}

impl FileStore {
    /// Create a file store from configuration
    pub fn new(config: &UpdateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("meshfw-update/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(
            client,
            config.scratch_dir.clone(),
            config.download_chunk_size,
        ))
    }

    /// Create a file store around an existing HTTP client
    pub fn with_client(client: reqwest::Client, scratch_dir: PathBuf, chunk_size: usize) -> Self {
        Self {
            client,
            scratch_dir,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Scratch directory owned by this store
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Shared HTTP client
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// HEAD the URL; any network failure counts as "does not exist"
    pub async fn check_url_exists(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            Ok(response) => {
                let exists = response.status().is_success();
                debug!(url, status = %response.status(), exists, "Probed firmware asset");
                exists
            }
            Err(e) => {
                warn!(url, error = %e, "Failed to check URL existence");
                false
            }
        }
    }

    /// Stream `url` into `<scratch>/<filename>`
    ///
    /// Progress is reported after every chunk when the server sends a content
    /// length. A short read against a known length fails with
    /// [`FirmwareUpdateError::IncompleteDownload`]; the partial file is removed
    /// on every failure path, cancellation included.
    pub async fn download(
        &self,
        url: &str,
        filename: &str,
        cancel: &CancelToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<PathBuf> {
        cancel.check()?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FirmwareUpdateError::DownloadFailed(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            warn!(url, status = %response.status(), "Download failed");
            return Err(FirmwareUpdateError::DownloadFailed(format!(
                "{} for {url}",
                response.status()
            )));
        }

        self.ensure_scratch_dir().await?;
        let target = self.scratch_path(filename);
        let content_length = response.content_length();

        match self
            .write_body(response, &target, content_length, cancel, on_progress)
            .await
        {
            Ok(bytes) => {
                info!(url, bytes, path = %target.display(), "Downloaded firmware artifact");
                Ok(target)
            }
            Err(e) => {
                remove_quietly(&target).await;
                Err(e)
            }
        }
    }

    async fn write_body(
        &self,
        mut response: reqwest::Response,
        target: &Path,
        content_length: Option<u64>,
        cancel: &CancelToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64> {
        let file = fs::File::create(target).await?;
        let mut writer = BufWriter::with_capacity(self.chunk_size, file);
        let mut received: u64 = 0;

        loop {
            cancel.check()?;
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                // A connection dropped short of the advertised length is a truncation
                Err(e) => {
                    return Err(match content_length {
                        Some(expected) if received < expected => {
                            warn!(error = %e, expected, received, "Download stream ended early");
                            FirmwareUpdateError::IncompleteDownload { expected, received }
                        }
                        _ => FirmwareUpdateError::DownloadFailed(e.to_string()),
                    });
                }
            };
            writer.write_all(&chunk).await?;
            received = received.saturating_add(chunk.len() as u64);

            if let Some(total) = content_length.filter(|t| *t > 0) {
                on_progress(received as f32 / total as f32);
            }
        }
        writer.flush().await?;

        if let Some(expected) = content_length
            && expected != received
        {
            return Err(FirmwareUpdateError::IncompleteDownload { expected, received });
        }
        Ok(received)
    }

    /// Extract the best-matching firmware image from a zip archive
    ///
    /// Entries must end with `extension` and contain the hardware target as a
    /// delimiter-bounded token; the shortest matching name wins. An entry named
    /// exactly `preferred_name` is taken ahead of that ordering. `cancel` is
    /// observed between chunks of the copy.
    pub async fn extract_firmware(
        &self,
        archive: &Path,
        hardware: &DeviceHardware,
        extension: &str,
        preferred_name: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        let target = hardware.target().to_ascii_lowercase();
        if target.is_empty() {
            return Ok(None);
        }
        self.ensure_scratch_dir().await?;

        let archive = archive.to_path_buf();
        let scratch = self.scratch_dir.clone();
        let extension = extension.to_ascii_lowercase();
        let preferred = preferred_name.map(str::to_ascii_lowercase);
        let cancel = cancel.clone();
        let chunk_size = self.chunk_size.max(1);

        tokio::task::spawn_blocking(move || {
            let wanted = EntryQuery {
                target: &target,
                extension: &extension,
                preferred: preferred.as_deref(),
            };
            extract_blocking(&archive, &scratch, &wanted, chunk_size, &cancel)
        })
        .await
        .map_err(|e| FirmwareUpdateError::ExtractionFailed(e.to_string()))?
    }

    /// Byte-for-byte copy between two files, checking `cancel` between chunks
    ///
    /// A failed or cancelled copy removes the partial destination.
    pub async fn copy(&self, source: &Path, destination: &Path, cancel: &CancelToken) -> Result<u64> {
        cancel.check()?;
        let mut input = fs::File::open(source).await?;
        let bytes = match self.copy_chunks(&mut input, destination, cancel).await {
            Ok(bytes) => bytes,
            Err(e) => {
                remove_quietly(destination).await;
                return Err(e);
            }
        };
        info!(
            source = %source.display(),
            destination = %destination.display(),
            bytes,
            "Copied firmware file"
        );
        Ok(bytes)
    }

    async fn copy_chunks(
        &self,
        input: &mut fs::File,
        destination: &Path,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let mut output = fs::File::create(destination).await?;
        let mut buffer = vec![0u8; self.chunk_size.max(1)];
        let mut bytes: u64 = 0;
        loop {
            cancel.check()?;
            let read = input.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            output
                .write_all(buffer.get(..read).unwrap_or_default())
                .await?;
            bytes = bytes.saturating_add(read as u64);
        }
        output.flush().await?;
        output.sync_all().await?;
        Ok(bytes)
    }

    /// Copy a user-supplied file into scratch storage under `filename`
    pub async fn import(&self, source: &Path, filename: &str, cancel: &CancelToken) -> Result<PathBuf> {
        self.ensure_scratch_dir().await?;
        let target = self.scratch_path(filename);
        self.copy(source, &target, cancel).await?;
        Ok(target)
    }

    /// Recursively clear and recreate the scratch directory; failures are logged only
    pub async fn purge_all(&self) {
        if fs::try_exists(&self.scratch_dir).await.unwrap_or(false)
            && let Err(e) = fs::remove_dir_all(&self.scratch_dir).await
        {
            warn!(dir = %self.scratch_dir.display(), error = %e, "Failed to cleanup temp directory");
        }
        if let Err(e) = fs::create_dir_all(&self.scratch_dir).await {
            warn!(dir = %self.scratch_dir.display(), error = %e, "Failed to recreate temp directory");
        }
    }

    /// Remove a single file; failures are logged only
    pub async fn remove(&self, path: &Path) {
        remove_quietly(path).await;
    }

    fn scratch_path(&self, filename: &str) -> PathBuf {
        let name = Path::new(filename)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "firmware.bin".into());
        self.scratch_dir.join(name)
    }

    async fn ensure_scratch_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.scratch_dir).await?;
        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed scratch file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
    }
}

/// Whether a lowercased archive entry name is a firmware image for `target`
///
/// The target must appear preceded by `-` or `_` and followed by `-`, `_` or
/// `.`, or start the name followed by `-` or `.`.
pub fn is_firmware_entry(name: &str, target: &str, extension: &str) -> bool {
    if target.is_empty() || !name.ends_with(extension) {
        return false;
    }
    let bytes = name.as_bytes();
    name.match_indices(target).any(|(start, _)| {
        let end = start + target.len();
        let after = bytes.get(end).copied();
        if start == 0 {
            return matches!(after, Some(b'-' | b'.'));
        }
        let before = bytes.get(start - 1).copied();
        matches!(before, Some(b'-' | b'_')) && matches!(after, Some(b'-' | b'_' | b'.'))
    })
}

/// Pick the winning entry among candidate names
pub fn select_entry<'a>(
    names: impl IntoIterator<Item = &'a str>,
    target: &str,
    extension: &str,
    preferred: Option<&str>,
) -> Option<&'a str> {
    let mut best: Option<&'a str> = None;
    for name in names {
        let lower = name.to_ascii_lowercase();
        if !is_firmware_entry(&lower, target, extension) {
            continue;
        }
        if preferred.is_some_and(|p| entry_file_name(&lower) == p) {
            return Some(name);
        }
        if best.is_none_or(|b| name.len() < b.len()) {
            best = Some(name);
        }
    }
    best
}

fn entry_file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Lowercased entry criteria for [`extract_blocking`]
struct EntryQuery<'a> {
    target: &'a str,
    extension: &'a str,
    preferred: Option<&'a str>,
}

fn extract_blocking(
    archive: &Path,
    scratch: &Path,
    query: &EntryQuery<'_>,
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<Option<PathBuf>> {
    let (target, extension) = (query.target, query.extension);
    let file = std::fs::File::open(archive)
        .map_err(|e| FirmwareUpdateError::ExtractionFailed(format!("{}: {e}", archive.display())))?;
    let mut zip = zip::ZipArchive::new(file)?;

    let names: Vec<String> = (0..zip.len())
        .filter_map(|i| {
            let entry = zip.by_index(i).ok()?;
            (!entry.is_dir()).then(|| entry.name().to_string())
        })
        .collect();

    let Some(chosen) = select_entry(names.iter().map(String::as_str), target, extension, query.preferred)
    else {
        debug!(pio_target = target, extension, entries = names.len(), "No matching firmware entry");
        return Ok(None);
    };

    cancel.check()?;
    let mut entry = zip.by_name(chosen)?;
    let out_path = scratch.join(entry_file_name(chosen));
    let bytes = match copy_entry(&mut entry, &out_path, chunk_size, cancel) {
        Ok(bytes) => bytes,
        Err(e) => {
            if let Err(remove) = std::fs::remove_file(&out_path) {
                debug!(path = %out_path.display(), error = %remove, "No partial entry to remove");
            }
            return Err(e);
        }
    };
    info!(entry = chosen, bytes, path = %out_path.display(), "Extracted firmware entry");
    Ok(Some(out_path))
}

fn copy_entry(
    entry: &mut impl Read,
    out_path: &Path,
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut output = std::fs::File::create(out_path)?;
    let mut buffer = vec![0u8; chunk_size];
    let mut bytes: u64 = 0;
    loop {
        cancel.check()?;
        let read = entry.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        output.write_all(buffer.get(..read).unwrap_or_default())?;
        bytes = bytes.saturating_add(read as u64);
    }
    output.flush()?;
    Ok(bytes)
}
