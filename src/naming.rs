//! Where a URL lands inside the cache directory.

use std::path::{Component, Path, PathBuf};

use reqwest::Url;
use sha2::{Digest, Sha256};

/// Suffix of files that are still being written.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Hex SHA-256 of the URL.
pub fn url_digest(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

fn last_segment(url: &str) -> Option<String> {
    match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string)),
        Err(_) => {
            let without_query = url.split(['?', '#']).next().unwrap_or(url);
            without_query.rsplit('/').next().map(str::to_string)
        }
    }
}

fn usable_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.ends_with(PARTIAL_SUFFIX)
        && !name.contains(['/', '\\', ':', '\0'])
}

/// The URL's last path segment, or a digest of the whole URL when that
/// segment can't be used as a file name.
pub fn file_name_for_url(url: &str) -> String {
    match last_segment(url) {
        Some(name) if usable_file_name(&name) => name,
        _ => url_digest(url),
    }
}

/// `<cache_dir>/<prefix>/<file name>`. Only plain components of the prefix
/// are kept, so it can't escape the cache directory.
pub fn cache_path(cache_dir: &Path, folder_prefix: Option<&str>, url: &str) -> PathBuf {
    let mut path = cache_dir.to_path_buf();
    if let Some(prefix) = folder_prefix {
        for component in Path::new(prefix).components() {
            if let Component::Normal(part) = component {
                path.push(part);
            }
        }
    }
    path.push(file_name_for_url(url));
    path
}

/// Sibling path a file is written to before being renamed into place.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}
