use futures_util::{stream, StreamExt, TryStreamExt};
use headers::{
    AcceptRanges, ContentLength, HeaderMap, HeaderMapExt, IfModifiedSince, IfNoneMatch, IfRange,
};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{HeaderValue, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use hyper::{http::request::Parts, Method, StatusCode};
use std::collections::HashMap;
use std::io::{self, ErrorKind, SeekFrom};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::args::Args;
use crate::auth::{check_auth, www_authenticate, AuthState, UserStore};
use crate::errors::ServeError;
use crate::utils::{get_file_name, parse_range};

use super::archive::{ArchiveFormat, ArchiveJob};
use super::listing::{is_serve_root, list_dir, Listing};
use super::resolve::resolve_path;
use super::response_utils::{
    extract_cache_headers, get_content_type, set_content_disposition, set_html_response,
    set_no_cache, status_forbid, status_internal_error, status_method_not_allowed,
    status_not_found, status_unauthorized, Response, BUF_SIZE, INDEX_NAME,
};

pub struct Server {
    args: Args,
    users: Arc<UserStore>,
    shutdown: CancellationToken,
}

impl Server {
    /// `shutdown` is the parent of every archive job's token.
    pub fn init(args: Args, users: Arc<UserStore>, shutdown: CancellationToken) -> Self {
        Self {
            args,
            users,
            shutdown,
        }
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub async fn call<B>(
        self: Arc<Self>,
        req: hyper::Request<B>,
        addr: Option<SocketAddr>,
    ) -> Result<Response, hyper::Error> {
        let (parts, _) = req.into_parts();
        let remote = addr
            .map(|v| v.ip().to_string())
            .unwrap_or_else(|| "-".to_string());

        let user = match check_auth(&self.users, &parts.headers) {
            AuthState::Anonymous => None,
            AuthState::User(name) => Some(name),
            AuthState::Rejected => {
                // Failed attempts stay out of the log.
                let mut res = error_response(&ServeError::Unauthorized);
                if let Err(err) = www_authenticate(&mut res) {
                    error!("Failed to set auth challenge, {err}");
                }
                return Ok(res);
            }
        };

        let res = match self.handle(&parts, &remote).await {
            Ok(res) => res,
            Err(err) => {
                if err.is_logged() {
                    error!(
                        "Error handling {} {} from {remote}: {err}",
                        parts.method, parts.uri
                    );
                }
                error_response(&err)
            }
        };

        let user = user.map(|v| format!("{v}: ")).unwrap_or_default();
        info!(
            "{user}{} {} from {remote} - {}",
            parts.method,
            parts.uri,
            res.status().as_u16()
        );
        Ok(res)
    }

    pub async fn handle(&self, req: &Parts, remote: &str) -> Result<Response, ServeError> {
        if req.method != Method::GET {
            return Err(ServeError::MethodNotAllowed);
        }
        let req_path = req.uri.path();
        let path = resolve_path(&self.args.serve_path, req_path)?;

        let meta = match fs::metadata(&path).await {
            Ok(v) => v,
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Err(ServeError::NotFound)
            }
            Err(err) => return Err(err.into()),
        };
        if !self.is_root_contained(&path).await {
            return Err(ServeError::NotFound);
        }

        if !meta.is_dir() {
            return self.handle_send_file(&path, &req.headers).await;
        }

        if !req_path.ends_with('/') {
            return Ok(redirect_to_dir(req));
        }

        let index = path.join(INDEX_NAME);
        let has_index = fs::metadata(&index)
            .await
            .map(|v| v.is_file())
            .unwrap_or_default();
        if has_index && self.is_root_contained(&index).await {
            return self.handle_send_file(&index, &req.headers).await;
        }

        if self.args.disallow_listings {
            return Err(ServeError::Forbidden);
        }

        let query_params: HashMap<String, String> = req
            .uri
            .query()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        match query_params
            .get("format")
            .and_then(|v| ArchiveFormat::from_query(v))
        {
            Some(format) => self.handle_archive_dir(&path, format, req, remote).await,
            None => self.handle_ls_dir(&path).await,
        }
    }

    pub async fn handle_ls_dir(&self, path: &Path) -> Result<Response, ServeError> {
        let items = list_dir(path).await?;
        let show_parent_link = !is_serve_root(path, &self.args.serve_path).await?;
        let name = match get_file_name(path) {
            "" => "/",
            v => v,
        };
        let listing = Listing::new(name, show_parent_link, items);
        let mut res = Response::default();
        set_html_response(&mut res, listing.render_html());
        Ok(res)
    }

    /// Answers with a body fed by an archive job running in its own task.
    ///
    /// Headers go out before the walk starts, so a failed job can only abort
    /// the body. Dropping the body cancels the job.
    pub async fn handle_archive_dir(
        &self,
        path: &Path,
        format: ArchiveFormat,
        req: &Parts,
        remote: &str,
    ) -> Result<Response, ServeError> {
        let mut res = Response::default();
        let name = match get_file_name(path) {
            "" => "archive",
            v => v,
        };
        set_content_disposition(&mut res, false, &format!("{name}.{}", format.extension()))
            .map_err(io::Error::other)?;
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
        set_no_cache(&mut res);

        let cancel = self.shutdown.child_token();
        let job = ArchiveJob {
            format,
            dir: path.to_path_buf(),
            serve_root: self.args.serve_path.clone(),
            allow_symlink: self.args.allow_symlink,
            cancel: cancel.clone(),
        };
        let (writer, reader) = tokio::io::duplex(BUF_SIZE);
        let (tx, rx) = oneshot::channel();
        let dir = path.display().to_string();
        let request = format!("{} {} from {remote}", req.method, req.uri);
        let job_cancel = cancel.clone();
        tokio::spawn(async move {
            let ret = job.run(writer).await;
            match &ret {
                Ok(()) => debug!("Finished {} of {dir}", format.extension()),
                Err(ServeError::Cancelled) => debug!("Archiving {dir} cancelled"),
                Err(ServeError::Io(err))
                    if job_cancel.is_cancelled() || err.kind() == ErrorKind::BrokenPipe =>
                {
                    debug!("Archiving {dir} stopped, client went away")
                }
                Err(err) => error!("Error handling {request}: failed to archive {dir}, {err}"),
            }
            let _ = tx.send(ret.map_err(anyhow::Error::from));
        });

        let drop_guard = cancel.drop_guard();
        let outcome = stream::once(async move {
            let _guard = drop_guard;
            rx.await
        })
        .filter_map(|ret| async move {
            match ret {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(Err::<Frame<Bytes>, _>(err)),
                Err(_) => Some(Err(anyhow::anyhow!("archive task went away"))),
            }
        });
        let body = ReaderStream::with_capacity(reader, BUF_SIZE)
            .map_ok(Frame::data)
            .map_err(anyhow::Error::from)
            .chain(outcome);
        *res.body_mut() = BodyExt::boxed(StreamBody::new(body));
        Ok(res)
    }

    pub async fn handle_send_file(
        &self,
        path: &Path,
        headers: &HeaderMap<HeaderValue>,
    ) -> Result<Response, ServeError> {
        let mut res = Response::default();
        let mut file = fs::File::open(path).await?;
        let meta = file.metadata().await?;
        let size = meta.len();
        let mut use_range = headers.contains_key(RANGE);
        if let Some((etag, last_modified)) = extract_cache_headers(&meta) {
            if let Some(if_modified_since) = headers.typed_get::<IfModifiedSince>() {
                if !if_modified_since.is_modified(last_modified.into()) {
                    *res.status_mut() = StatusCode::NOT_MODIFIED;
                    return Ok(res);
                }
            }
            if let Some(if_none_match) = headers.typed_get::<IfNoneMatch>() {
                if !if_none_match.precondition_passes(&etag) {
                    *res.status_mut() = StatusCode::NOT_MODIFIED;
                    return Ok(res);
                }
            }
            if use_range {
                use_range = headers
                    .typed_get::<IfRange>()
                    .map(|if_range| !if_range.is_modified(Some(&etag), Some(&last_modified)))
                    .unwrap_or(true);
            }
            res.headers_mut().typed_insert(last_modified);
            res.headers_mut().typed_insert(etag);
        }

        let content_type = get_content_type(path).await.map_err(io::Error::other)?;
        res.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&content_type).map_err(io::Error::other)?,
        );
        set_content_disposition(&mut res, true, get_file_name(path)).map_err(io::Error::other)?;
        res.headers_mut().typed_insert(AcceptRanges::bytes());

        // Multi-range requests get the whole file.
        let range = headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| use_range && !v.contains(','));
        let (start, len) = match range {
            Some(range) => match parse_range(range, size) {
                Some((start, end)) => {
                    *res.status_mut() = StatusCode::PARTIAL_CONTENT;
                    res.headers_mut().insert(
                        CONTENT_RANGE,
                        header_value(format!("bytes {start}-{end}/{size}"))?,
                    );
                    (start, end - start + 1)
                }
                None => {
                    *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                    res.headers_mut()
                        .insert(CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
                    return Ok(res);
                }
            },
            None => (0, size),
        };

        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        res.headers_mut().typed_insert(ContentLength(len));
        let reader_stream = ReaderStream::with_capacity(file.take(len), BUF_SIZE);
        let stream_body = StreamBody::new(
            reader_stream
                .map_ok(Frame::data)
                .map_err(anyhow::Error::from),
        );
        *res.body_mut() = BodyExt::boxed(stream_body);
        Ok(res)
    }

    async fn is_root_contained(&self, path: &Path) -> bool {
        if self.args.allow_symlink {
            return true;
        }
        fs::canonicalize(path)
            .await
            .ok()
            .map(|v| v.starts_with(&self.args.serve_path))
            .unwrap_or_default()
    }
}

fn error_response(err: &ServeError) -> Response {
    let mut res = Response::default();
    match err {
        ServeError::NotFound => status_not_found(&mut res),
        ServeError::MethodNotAllowed => status_method_not_allowed(&mut res),
        ServeError::Forbidden => status_forbid(&mut res),
        ServeError::Unauthorized => status_unauthorized(&mut res),
        _ => status_internal_error(&mut res),
    }
    debug_assert_eq!(res.status(), err.status());
    res
}

/// Directory links in a listing are relative, so directories are only served
/// under a path ending in `/`.
fn redirect_to_dir(req: &Parts) -> Response {
    // A leading `//` would make the location scheme-relative.
    let mut location = format!("/{}/", req.uri.path().trim_start_matches('/'));
    if let Some(query) = req.uri.query() {
        location.push('?');
        location.push_str(query);
    }
    let mut res = Response::default();
    *res.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(v) = HeaderValue::from_str(&location) {
        res.headers_mut().insert(LOCATION, v);
    }
    res
}

fn header_value(value: String) -> Result<HeaderValue, ServeError> {
    HeaderValue::from_str(&value).map_err(|err| io::Error::other(err).into())
}
