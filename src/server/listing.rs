use std::io::{self, ErrorKind};
use std::path::Path;
use tokio::fs;
use xml::escape::escape_str_pcdata;

use super::archive::ArchiveFormat;
use super::path_item::{PathItem, PathType};
use super::response_utils::to_timestamp;
use crate::utils::encode_uri;

const LISTING_HTML: &str = include_str!("../../assets/listing.html");

/// One level of a directory, split and sorted for rendering.
#[derive(Debug, Clone)]
pub struct Listing {
    pub name: String,
    pub show_parent_link: bool,
    pub dirs: Vec<PathItem>,
    pub files: Vec<PathItem>,
}

impl Listing {
    pub fn new(name: &str, show_parent_link: bool, items: Vec<PathItem>) -> Self {
        let (mut dirs, mut files): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|v| v.is_dir());
        dirs.sort_by(|v1, v2| v1.sort_by_name(v2));
        files.sort_by(|v1, v2| v1.sort_by_name(v2));
        Self {
            name: name.to_string(),
            show_parent_link,
            dirs,
            files,
        }
    }

    pub fn render_html(&self) -> String {
        let mut content = String::new();
        if self.show_parent_link {
            content.push_str("<p><a href=\"../\">Go back</a></p>\n");
        }
        content.push_str("<h3>Directories</h3>\n");
        let formats: Vec<String> = ArchiveFormat::ALL
            .iter()
            .map(|v| {
                format!(
                    "<a href=\"?format={ext}\">{ext}</a>",
                    ext = v.extension()
                )
            })
            .collect();
        content.push_str(&format!(
            "<p class=\"dl\">You can download this directory as {}, {} or {} file.</p>\n",
            formats[0], formats[1], formats[2]
        ));
        for item in &self.dirs {
            content.push_str(&format!(
                "<p><a href=\"{}/\">{}</a></p>\n",
                encode_uri(&item.name),
                escape_str_pcdata(&item.name)
            ));
        }
        if !self.files.is_empty() {
            content.push_str("<h3>Files</h3>\n");
            for item in &self.files {
                content.push_str(&format!(
                    "<p><a href=\"{}\">{}</a> <span class=\"meta\">{} &middot; {}</span></p>\n",
                    encode_uri(&item.name),
                    escape_str_pcdata(&item.name),
                    item.size_display(),
                    item.mtime_display(),
                ));
            }
        }

        let title = escape_str_pcdata(&self.name);
        match LISTING_HTML.split_once("__CONTENT__") {
            Some((head, tail)) => {
                format!("{}{}{}", head.replace("__TITLE__", &title), content, tail)
            }
            None => content,
        }
    }
}

/// Reads one level of `dir`.
///
/// Entries that disappear between the directory read and their stat are
/// skipped; any other error fails the whole listing.
pub async fn list_dir(dir: &Path) -> io::Result<Vec<PathItem>> {
    let mut items = vec![];
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        match to_pathitem(&entry.path()).await {
            Ok(item) => items.push(item),
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

async fn to_pathitem(path: &Path) -> io::Result<PathItem> {
    let link_meta = fs::symlink_metadata(path).await?;
    let is_symlink = link_meta.is_symlink();
    // A dangling symlink is listed as a file.
    let meta = if is_symlink {
        fs::metadata(path).await.unwrap_or(link_meta)
    } else {
        link_meta
    };
    let path_type = PathType::new(is_symlink, meta.is_dir());
    let mtime = match meta.modified().ok().or_else(|| meta.created().ok()) {
        Some(v) => to_timestamp(&v),
        None => 0,
    };
    let size = if path_type.is_dir() { 0 } else { meta.len() };
    let name = path
        .file_name()
        .map(|v| v.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(PathItem {
        path_type,
        name,
        mtime,
        size,
    })
}

/// Whether `dir` is the server root, compared by canonical path.
pub async fn is_serve_root(dir: &Path, serve_root: &Path) -> io::Result<bool> {
    let (dir, root) = tokio::join!(fs::canonicalize(dir), fs::canonicalize(serve_root));
    Ok(dir? == root?)
}
