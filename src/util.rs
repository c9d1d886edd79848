use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Build a `file://` URI from an absolute path.
pub fn to_file_uri(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if cfg!(windows) {
        format!("file:///{}", raw.replace('\\', "/"))
    } else {
        format!("file://{raw}")
    }
}

/// Extract the path from a `file://` URI; returns the input unchanged as a
/// path when it carries no scheme.
pub fn from_file_uri(uri: &str) -> PathBuf {
    let stripped = uri.strip_prefix("file://").unwrap_or(uri);
    PathBuf::from(stripped)
}

/// Single line of `content` at a zero-based index, trimmed, for use as a
/// human-readable reference context.
pub fn line_at(content: &str, line: u64) -> Option<String> {
    content
        .lines()
        .nth(line as usize)
        .map(|value| value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_uri_round_trip() {
        let path = Path::new("/workspace/src/auth.py");
        let uri = to_file_uri(path);
        assert_eq!(uri, "file:///workspace/src/auth.py");
        assert_eq!(from_file_uri(&uri), path);
    }

    #[test]
    fn from_file_uri_accepts_plain_paths() {
        assert_eq!(from_file_uri("/tmp/x.py"), PathBuf::from("/tmp/x.py"));
    }

    #[test]
    fn line_at_bounds() {
        let content = "a\nb\nc";
        assert_eq!(line_at(content, 0).as_deref(), Some("a"));
        assert_eq!(line_at(content, 2).as_deref(), Some("c"));
        assert_eq!(line_at(content, 3), None);
    }
}
