use anyhow::Result;
use headers::{CacheControl, ContentLength, ContentType, ETag, HeaderMapExt, LastModified};
use http_body_util::combinators::BoxBody;
use hyper::{
    body::Bytes,
    header::{HeaderValue, ALLOW, CONTENT_DISPOSITION, EXPIRES, PRAGMA},
    StatusCode,
};
use std::fs::Metadata;
use std::path::Path;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::http_utils::body_full;
use crate::utils::encode_uri;

pub type Response = hyper::Response<BoxBody<Bytes, anyhow::Error>>;

pub const BUF_SIZE: usize = 65536;
pub const INDEX_NAME: &str = "index.html";

pub fn status_forbid(res: &mut Response) {
    *res.status_mut() = StatusCode::FORBIDDEN;
    *res.body_mut() = body_full("Forbidden");
}

pub fn status_not_found(res: &mut Response) {
    *res.status_mut() = StatusCode::NOT_FOUND;
    *res.body_mut() = body_full("Not Found");
}

pub fn status_method_not_allowed(res: &mut Response) {
    *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
    res.headers_mut().insert(ALLOW, HeaderValue::from_static("GET"));
    *res.body_mut() = body_full("Method Not Allowed");
}

pub fn status_unauthorized(res: &mut Response) {
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    *res.body_mut() = body_full("Unauthorized");
}

/// Generic 500; never says more than that to the client.
pub fn status_internal_error(res: &mut Response) {
    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    *res.body_mut() = body_full("Internal Server Error");
}

pub fn set_content_disposition(res: &mut Response, inline: bool, filename: &str) -> Result<()> {
    let kind = if inline { "inline" } else { "attachment" };
    let filename: String = filename
        .chars()
        .map(|ch| {
            if (ch.is_ascii_control() && ch != '\t') || ch == '"' {
                ' '
            } else {
                ch
            }
        })
        .collect();
    let value = if filename.is_ascii() {
        HeaderValue::from_str(&format!("{kind}; filename=\"{filename}\"",))?
    } else {
        HeaderValue::from_str(&format!(
            "{kind}; filename=\"{}\"; filename*=UTF-8''{}",
            filename.replace(|c: char| !c.is_ascii(), "_"),
            encode_uri(&filename),
        ))?
    };
    res.headers_mut().insert(CONTENT_DISPOSITION, value);
    Ok(())
}

/// Headers telling browsers and proxies not to keep a copy of a download.
pub fn set_no_cache(res: &mut Response) {
    res.headers_mut()
        .typed_insert(CacheControl::new().with_no_cache());
    res.headers_mut()
        .insert(PRAGMA, HeaderValue::from_static("no-cache"));
    res.headers_mut()
        .insert(EXPIRES, HeaderValue::from_static("0"));
}

pub fn set_html_response(res: &mut Response, content: String) {
    res.headers_mut()
        .typed_insert(ContentType::from(mime_guess::mime::TEXT_HTML_UTF_8));
    res.headers_mut()
        .typed_insert(ContentLength(content.len() as u64));
    res.headers_mut()
        .typed_insert(CacheControl::new().with_no_cache());
    res.headers_mut().insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    *res.body_mut() = body_full(content);
}

pub fn to_timestamp(time: &SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn extract_cache_headers(meta: &Metadata) -> Option<(ETag, LastModified)> {
    let mtime = meta.modified().ok().or_else(|| meta.created().ok())?;
    let timestamp = to_timestamp(&mtime);
    let size = meta.len();
    let etag = format!(r#""{timestamp}-{size}""#).parse::<ETag>().ok()?;
    let last_modified = LastModified::from(mtime);
    Some((etag, last_modified))
}

/// Guesses a content type from the extension, sniffing the first KiB to
/// tell text from binary and pick a charset.
pub async fn get_content_type(path: &Path) -> Result<String> {
    let mut buffer: Vec<u8> = vec![];
    fs::File::open(path)
        .await?
        .take(1024)
        .read_to_end(&mut buffer)
        .await?;
    let mime = mime_guess::from_path(path).first();
    let is_text = content_inspector::inspect(&buffer).is_text();
    let content_type = if is_text {
        let mut detector = chardetng::EncodingDetector::new();
        detector.feed(&buffer, buffer.len() < 1024);
        let (enc, confident) = detector.guess_assess(None, true);
        let charset = if confident {
            format!("; charset={}", enc.name())
        } else {
            "".into()
        };
        match mime {
            Some(m) => format!("{m}{charset}"),
            None => format!("text/plain{charset}"),
        }
    } else {
        match mime {
            Some(m) => m.to_string(),
            None => "application/octet-stream".into(),
        }
    };
    Ok(content_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition() {
        let mut res = Response::default();
        set_content_disposition(&mut res, false, "photos.tar.gz").unwrap();
        assert_eq!(
            res.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"photos.tar.gz\""
        );

        set_content_disposition(&mut res, false, "fotos\u{e9}.zip").unwrap();
        assert_eq!(
            res.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"fotos_.zip\"; filename*=UTF-8''fotos%C3%A9.zip"
        );
    }

    #[test]
    fn test_no_cache() {
        let mut res = Response::default();
        set_no_cache(&mut res);
        assert_eq!(res.headers().get("cache-control").unwrap(), "no-cache");
        assert_eq!(res.headers().get(PRAGMA).unwrap(), "no-cache");
        assert_eq!(res.headers().get(EXPIRES).unwrap(), "0");
    }

    #[test]
    fn test_method_not_allowed() {
        let mut res = Response::default();
        status_method_not_allowed(&mut res);
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers().get(ALLOW).unwrap(), "GET");
    }
}
