//! Writing archived records and downloaded assets to disk.
use anyhow::{Context, Result};
use async_compression::tokio::write::GzipEncoder;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

/// Suffix appended (never substituted) when a file is gzip-compressed.
pub const GZIP_SUFFIX: &str = "gz";

/// Read buffer for stream copies.
const COPY_CHUNK: usize = 8 * 1024;

/// Content types that gain nothing from another round of compression.
pub const ALREADY_COMPRESSED_CONTENT_TYPES: &[&str] = &[
    "application/gzip",
    "application/octet-stream",
    "application/zip",
    "application/x-7z-compressed",
    "application/x-bzip2",
    "application/x-rar-compressed",
    "application/x-xz",
    "application/zstd",
];

/// File extensions (lowercase) of already-compressed formats.
pub const ALREADY_COMPRESSED_EXTENSIONS: &[&str] = &[
    "zip", "gz", "tgz", "bz", "bz2", "xz", "zst", "jar", "cbz", "7z", "rar", "sitx",
];

/// Final on-disk path for `path`: `<path>.gz` when compressing.
pub fn output_path(path: &Path, compress: bool) -> PathBuf {
    if !compress {
        return path.to_path_buf();
    }
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(GZIP_SUFFIX);
    PathBuf::from(name)
}

/// Whether a release asset should be gzipped. Already-compressed content is
/// stored verbatim regardless of the global preference.
pub fn should_compress_asset(gzip: bool, content_type: Option<&str>, name: &str) -> bool {
    if !gzip {
        return false;
    }
    if let Some(ct) = content_type {
        let essence = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
        if ALREADY_COMPRESSED_CONTENT_TYPES.contains(&essence.as_str()) {
            return false;
        }
    }
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    !ALREADY_COMPRESSED_EXTENSIONS.contains(&extension.as_str())
}

/// Create `dir` and its parents; an existing directory is fine.
pub async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create directory {}", dir.display()))
}

/// Serialise `record` as JSON to `path` (or `path.gz`). Returns the path written.
pub async fn write_record<T: Serialize + ?Sized>(
    path: &Path,
    record: &T,
    compress: bool,
) -> Result<PathBuf> {
    let body = serde_json::to_vec(record).context("failed to encode record")?;
    write_stream(&body[..], path, compress)
        .await
        .map(|(written, _)| written)
}

/// Copy `source` to `path` (or `path.gz`) in bounded chunks. Returns the
/// path written and the number of uncompressed bytes copied.
pub async fn write_stream<R>(source: R, path: &Path, compress: bool) -> Result<(PathBuf, u64)>
where
    R: AsyncRead + Unpin,
{
    let target = output_path(path, compress);
    let file = File::create(&target)
        .await
        .with_context(|| format!("failed to create {}", target.display()))?;
    let mut reader = BufReader::with_capacity(COPY_CHUNK, source);

    let copied = if compress {
        copy_into(&mut reader, GzipEncoder::new(BufWriter::new(file))).await
    } else {
        copy_into(&mut reader, BufWriter::new(file)).await
    }
    .with_context(|| format!("failed to write {}", target.display()))?;

    debug!(path = %target.display(), bytes = copied, compress, "wrote artifact");
    Ok((target, copied))
}

async fn copy_into<R, W>(reader: &mut R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(reader, &mut writer).await?;
    // shutdown finishes the gzip trailer and flushes the buffered file
    writer.shutdown().await?;
    Ok(copied)
}
