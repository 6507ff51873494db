use anyhow::{anyhow, Result};
#[cfg(feature = "tls")]
use anyhow::Context;
use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
#[cfg(feature = "tls")]
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::{
    borrow::Cow,
    fs::Metadata,
    path::{Path, PathBuf},
};

const URI_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn encode_uri(v: &str) -> String {
    let parts: Vec<_> = v
        .split('/')
        .map(|v| utf8_percent_encode(v, URI_SEGMENT).to_string())
        .collect();
    parts.join("/")
}

pub fn decode_uri(v: &str) -> Option<Cow<'_, str>> {
    percent_decode(v.as_bytes()).decode_utf8().ok()
}

pub fn get_file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|v| v.to_str())
        .unwrap_or_default()
}

/// Modification time and permission bits, as stored in archive headers.
pub fn get_file_mtime_and_mode(meta: &Metadata) -> std::io::Result<(DateTime<Utc>, u32)> {
    let datetime: DateTime<Utc> = meta.modified()?.into();
    #[cfg(unix)]
    {
        use std::os::unix::prelude::MetadataExt;
        Ok((datetime, meta.mode()))
    }
    #[cfg(not(unix))]
    Ok((datetime, 0o644))
}

/// Directory holding the saved configuration and the users file.
///
/// `$XDG_CONFIG_HOME` wins, otherwise `~/.config`.
pub fn config_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("Cannot determine the user configuration directory"))?;
    Ok(PathBuf::from(home).join(".config"))
}

/// Parses a `Range` header holding a single byte range.
///
/// Returns `None` when the header is malformed, asks for several ranges or
/// cannot be satisfied.
pub fn parse_range(range: &str, size: u64) -> Option<(u64, u64)> {
    let range = range.strip_prefix("bytes=")?.trim();
    if range.contains(',') || size == 0 {
        return None;
    }
    let (start, end) = range.split_once('-')?;
    let (start, end) = match (start.trim(), end.trim()) {
        ("", "") => return None,
        ("", suffix) => {
            let suffix: u64 = suffix.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            (size.saturating_sub(suffix), size - 1)
        }
        (start, "") => (start.parse().ok()?, size - 1),
        (start, end) => {
            let end: u64 = end.parse().ok()?;
            (start.parse().ok()?, end.min(size - 1))
        }
    };
    if start > end || start >= size {
        return None;
    }
    Some((start, end))
}

#[cfg(feature = "tls")]
pub fn load_certs<T: AsRef<Path>>(filename: T) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = std::fs::File::open(filename.as_ref())
        .with_context(|| format!("Failed to access `{}`", filename.as_ref().display()))?;
    let mut reader = std::io::BufReader::new(cert_file);

    let mut certs = vec![];
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.with_context(|| "Failed to load certificate")?;
        certs.push(cert)
    }
    if certs.is_empty() {
        anyhow::bail!("No supported certificate in file");
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
pub fn load_private_key<T: AsRef<Path>>(filename: T) -> Result<PrivateKeyDer<'static>> {
    let key_file = std::fs::File::open(filename.as_ref())
        .with_context(|| format!("Failed to access `{}`", filename.as_ref().display()))?;
    let mut reader = std::io::BufReader::new(key_file);

    let key = rustls_pemfile::private_key(&mut reader)
        .with_context(|| "Failed to load private key")?
        .ok_or_else(|| anyhow!("No supported private key in file"))?;
    Ok(key)
}
