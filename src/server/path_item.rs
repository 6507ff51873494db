use chrono::{LocalResult, TimeZone, Utc};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PathType {
    Dir,
    SymlinkDir,
    File,
    SymlinkFile,
}

impl PathType {
    pub fn new(is_symlink: bool, is_dir: bool) -> Self {
        match (is_symlink, is_dir) {
            (true, true) => Self::SymlinkDir,
            (false, true) => Self::Dir,
            (true, false) => Self::SymlinkFile,
            (false, false) => Self::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir | Self::SymlinkDir)
    }
}

/// One entry of a directory listing, read fresh from disk.
#[derive(Debug, Clone)]
pub struct PathItem {
    pub path_type: PathType,
    pub name: String,
    /// Milliseconds since the unix epoch.
    pub mtime: u64,
    pub size: u64,
}

impl PathItem {
    pub fn is_dir(&self) -> bool {
        self.path_type.is_dir()
    }

    /// Byte-wise, case-sensitive name order.
    pub fn sort_by_name(&self, other: &Self) -> Ordering {
        self.name.as_bytes().cmp(other.name.as_bytes())
    }

    pub fn mtime_display(&self) -> String {
        match Utc.timestamp_millis_opt(self.mtime as i64) {
            LocalResult::Single(v) => format!("{}", v.format("%Y-%m-%d %H:%M:%S")),
            _ => String::new(),
        }
    }

    pub fn size_display(&self) -> String {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
        let mut size = self.size as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{} {}", self.size, UNITS[0])
        } else {
            format!("{size:.1} {}", UNITS[unit])
        }
    }
}
