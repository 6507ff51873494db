use async_zip::{tokio::write::ZipFileWriter, Compression, ZipDateTime, ZipEntryBuilder};
use flate2::write::GzEncoder;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::compat::FuturesAsyncWriteCompatExt;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::response_utils::BUF_SIZE;
use crate::errors::ServeError;
use crate::utils::get_file_mtime_and_mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 3] = [Self::Zip, Self::Tar, Self::TarGz];

    /// Parses the `format` query value, ignoring case.
    pub fn from_query(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.extension().eq_ignore_ascii_case(value))
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::Tar => "application/x-tar",
            Self::TarGz => "application/gzip",
        }
    }
}

/// One archive download: which directory, in which format, and the token
/// that stops it.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub format: ArchiveFormat,
    pub dir: PathBuf,
    pub serve_root: PathBuf,
    pub allow_symlink: bool,
    pub cancel: CancellationToken,
}

impl ArchiveJob {
    /// Streams the archive into `writer` and shuts it down.
    ///
    /// Tar variants run on the blocking pool and reach the async writer
    /// through a `SyncIoBridge`.
    pub async fn run<W>(self, writer: W) -> Result<(), ServeError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match self.format {
            ArchiveFormat::Zip => {
                let mut writer = writer;
                stream_zip(&mut writer, &self).await?;
                writer.shutdown().await?;
                Ok(())
            }
            ArchiveFormat::Tar | ArchiveFormat::TarGz => {
                let bridge = SyncIoBridge::new(writer);
                tokio::task::spawn_blocking(move || -> Result<(), ServeError> {
                    let out = BufWriter::with_capacity(BUF_SIZE, bridge);
                    let out = match self.format {
                        ArchiveFormat::TarGz => stream_tar_gz(out, &self)?,
                        _ => stream_tar(out, &self)?,
                    };
                    let mut bridge = out.into_inner().map_err(|e| e.into_error())?;
                    bridge.shutdown()?;
                    Ok(())
                })
                .await
                .map_err(io::Error::other)?
            }
        }
    }

    fn entries(&self) -> ArchiveEntries<'_> {
        ArchiveEntries {
            job: self,
            it: WalkDir::new(&self.dir)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter(),
        }
    }
}

/// A regular file to put into the archive.
#[derive(Debug)]
struct ArchiveEntry {
    path: PathBuf,
    /// Path relative to the archived directory.
    rel_path: PathBuf,
}

impl ArchiveEntry {
    fn name(&self) -> String {
        self.rel_path
            .to_string_lossy()
            .replace(MAIN_SEPARATOR, "/")
    }
}

/// Depth-first walk yielding regular files, checking the cancel token before
/// every entry.
struct ArchiveEntries<'a> {
    job: &'a ArchiveJob,
    it: walkdir::IntoIter,
}

impl Iterator for ArchiveEntries<'_> {
    type Item = Result<ArchiveEntry, ServeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.job.cancel.is_cancelled() {
                return Some(Err(ServeError::Cancelled));
            }
            let entry = match self.it.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(io::Error::from(err).into())),
            };
            let is_dir = entry.file_type().is_dir();
            if entry.path_is_symlink()
                && !self.job.allow_symlink
                && !is_root_contained(entry.path(), &self.job.serve_root)
            {
                if is_dir {
                    self.it.skip_current_dir();
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let rel_path = match entry.path().strip_prefix(&self.job.dir) {
                Ok(v) => v.to_path_buf(),
                Err(_) => continue,
            };
            return Some(Ok(ArchiveEntry {
                path: entry.into_path(),
                rel_path,
            }));
        }
    }
}

fn is_root_contained(path: &Path, serve_root: &Path) -> bool {
    std::fs::canonicalize(path)
        .map(|v| v.starts_with(serve_root))
        .unwrap_or_default()
}

/// Writes a zip of `job.dir` into `writer`, one deflated entry per file.
pub async fn stream_zip<W: AsyncWrite + Unpin>(
    writer: &mut W,
    job: &ArchiveJob,
) -> Result<(), ServeError> {
    let mut writer = ZipFileWriter::with_tokio(writer);
    for entry in job.entries() {
        let entry = entry?;
        let mut file = tokio::fs::File::open(&entry.path).await?;
        let meta = file.metadata().await?;
        let (datetime, mode) = get_file_mtime_and_mode(&meta)?;
        let builder = ZipEntryBuilder::new(entry.name().into(), Compression::Deflate)
            .unix_permissions(mode as u16)
            .last_modification_date(ZipDateTime::from_chrono(&datetime));
        let mut file_writer = writer.write_entry_stream(builder).await?.compat_write();
        tokio::io::copy(&mut file, &mut file_writer).await?;
        file_writer.into_inner().close().await?;
    }
    writer.close().await?;
    Ok(())
}

/// Writes a tarball of `job.dir` into `writer` and returns the writer once the
/// end-of-archive blocks are out.
pub fn stream_tar<W: Write>(writer: W, job: &ArchiveJob) -> Result<W, ServeError> {
    let mut builder = tar::Builder::new(writer);
    for entry in job.entries() {
        let entry = entry?;
        let file = std::fs::File::open(&entry.path)?;
        let meta = file.metadata()?;
        let (datetime, mode) = get_file_mtime_and_mode(&meta)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.len());
        header.set_mode(mode & 0o7777);
        header.set_mtime(datetime.timestamp().max(0) as u64);
        builder.append_data(&mut header, &entry.rel_path, file.take(meta.len()))?;
    }
    Ok(builder.into_inner()?)
}

/// Same as [`stream_tar`], gzip-compressed at the best level.
///
/// The tar stream is finished before the gzip trailer is written; a tar
/// failure is returned as is.
pub fn stream_tar_gz<W: Write>(writer: W, job: &ArchiveJob) -> Result<W, ServeError> {
    let encoder = GzEncoder::new(writer, flate2::Compression::best());
    let encoder = stream_tar(encoder, job)?;
    Ok(encoder.finish()?)
}
