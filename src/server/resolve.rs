use std::path::{Component, Path, PathBuf};

use crate::errors::ServeError;
use crate::utils::decode_uri;

/// Maps a request path onto the filesystem below `root`.
///
/// `.` segments are dropped and `..` pops the previous segment; popping past
/// `root` is a `PathEscape`. The result is always `root` itself or a
/// syntactic descendant of it.
pub fn resolve_path(root: &Path, req_path: &str) -> Result<PathBuf, ServeError> {
    let decoded = decode_uri(req_path).ok_or(ServeError::PathEscape)?;
    let relative = relative_path(&decoded)?;
    if relative.as_os_str().is_empty() {
        return Ok(root.to_path_buf());
    }
    Ok(root.join(relative))
}

fn relative_path(path: &str) -> Result<PathBuf, ServeError> {
    let path = path.trim_start_matches(['/', '\\']);
    let path = if cfg!(windows) {
        path.replace('/', "\\")
    } else {
        path.to_string()
    };
    let mut parts: Vec<&std::ffi::OsStr> = vec![];
    for comp in Path::new(&path).components() {
        match comp {
            Component::Normal(v) => parts.push(v),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ServeError::PathEscape);
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(ServeError::PathEscape),
        }
    }
    Ok(parts.iter().collect())
}
