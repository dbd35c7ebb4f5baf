use std::fmt::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::ledger::ItemRecord;
use crate::types::ItemKind;

/// Decides where an item lives, relative to the library root.
///
/// Implementations must be pure: the same record always maps to the same
/// path, with no filesystem access. Collisions are resolved by the download
/// engine, not here.
pub trait PathMapper: Send + Sync {
    fn map(&self, item: &ItemRecord) -> PathBuf;
}

/// Default mapper: `<date folders>/<id>.<ext>`, e.g. `2020/01/02/AF1Q.jpg`.
#[derive(Debug, Clone)]
pub struct DateFolderMapper {
    folder_structure: String,
}

impl Default for DateFolderMapper {
    fn default() -> Self {
        Self::new("%Y/%m/%d")
    }
}

impl DateFolderMapper {
    /// `folder_structure` is a date format such as `"%Y/%m/%d"`. The special
    /// value `"none"` (case-insensitive) disables date-based folders.
    pub fn new(folder_structure: &str) -> Self {
        // Accept the Python-style {:%Y/%m/%d} wrapper too.
        let format_str = folder_structure
            .strip_prefix("{:")
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(folder_structure);
        Self {
            folder_structure: format_str.to_string(),
        }
    }
}

impl PathMapper for DateFolderMapper {
    fn map(&self, item: &ItemRecord) -> PathBuf {
        let filename = format!(
            "{}.{}",
            clean_filename(&item.id),
            extension_for(item.mime_type.as_deref(), item.kind)
        );

        if self.folder_structure.eq_ignore_ascii_case("none") {
            return PathBuf::from(filename);
        }

        let date_path = expand_date_format(&self.folder_structure, &item.captured_at);
        let mut path = PathBuf::new();
        for component in date_path.split('/') {
            if !component.is_empty() && component != "." && component != ".." {
                path.push(component);
            }
        }
        path.join(filename)
    }
}

/// Expand date format tokens (%Y, %m, %d, %H, %M, %S) in a single pass.
fn expand_date_format(format_str: &str, date: &DateTime<Utc>) -> String {
    let mut result = String::with_capacity(format_str.len() + 8);
    let mut chars = format_str.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('Y') => {
                    chars.next();
                    let _ = write!(result, "{:04}", date.year());
                }
                Some('m') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.month());
                }
                Some('d') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.day());
                }
                Some('H') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.hour());
                }
                Some('M') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.minute());
                }
                Some('S') => {
                    chars.next();
                    let _ = write!(result, "{:02}", date.second());
                }
                _ => result.push(c), // Unknown token, keep the %
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Mime types the library API reports, mapped to file extensions.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/jpg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/heic", "heic"),
    ("image/heif", "heif"),
    ("image/bmp", "bmp"),
    ("image/tiff", "tif"),
    ("image/x-adobe-dng", "dng"),
    ("image/x-canon-cr2", "cr2"),
    ("image/x-nikon-nef", "nef"),
    ("image/x-sony-arw", "arw"),
    ("video/mp4", "mp4"),
    ("video/quicktime", "mov"),
    ("video/x-msvideo", "avi"),
    ("video/x-matroska", "mkv"),
    ("video/webm", "webm"),
    ("video/3gpp", "3gp"),
    ("video/mpeg", "mpg"),
    ("video/x-m4v", "m4v"),
];

/// File extension for an item, falling back to the kind when the mime type
/// is missing or unknown.
pub fn extension_for(mime_type: Option<&str>, kind: ItemKind) -> &'static str {
    let known = mime_type.and_then(|mime| {
        MIME_EXTENSIONS
            .iter()
            .find(|(m, _)| m.eq_ignore_ascii_case(mime.trim()))
            .map(|(_, ext)| *ext)
    });
    known.unwrap_or(match kind {
        ItemKind::Photo => "jpg",
        ItemKind::Video => "mp4",
    })
}

/// Clean a filename by removing characters that are invalid on common
/// filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect()
}

/// Add a string suffix before the file extension.
///
/// For example, `"photo.jpg"` with suffix `"abc"` becomes `"photo-abc.jpg"`.
pub fn insert_suffix(path: &str, suffix: &str) -> String {
    match path.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => {
            let (stem, ext) = path.split_at(dot_pos);
            let mut result = String::with_capacity(stem.len() + 1 + suffix.len() + ext.len());
            result.push_str(stem);
            result.push('-');
            result.push_str(suffix);
            result.push_str(ext);
            result
        }
        _ => {
            let mut result = String::with_capacity(path.len() + 1 + suffix.len());
            result.push_str(path);
            result.push('-');
            result.push_str(suffix);
            result
        }
    }
}

/// `path` with the item id inserted before the extension of its file name.
pub fn with_id_suffix(path: &Path, id: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(insert_suffix(&name, &clean_filename(id)))
}
