use ignore::WalkBuilder;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Languages we can hand off to a backend, keyed by file extension.
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
}

static LANGUAGE_SPECS: &[LanguageSpec] = &[
    LanguageSpec {
        name: "python",
        extensions: &["py"],
    },
    LanguageSpec {
        name: "typescript",
        extensions: &["ts", "tsx"],
    },
    LanguageSpec {
        name: "javascript",
        extensions: &["js", "jsx"],
    },
    LanguageSpec {
        name: "bash",
        extensions: &["sh", "bash"],
    },
    LanguageSpec {
        name: "go",
        extensions: &["go"],
    },
];

pub fn language_specs() -> &'static [LanguageSpec] {
    LANGUAGE_SPECS
}

/// Resolve a path to a backend language tag by extension. `None` means no
/// capability: callers return empty results rather than failing.
pub fn detect_language(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    for spec in LANGUAGE_SPECS {
        if spec.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
            return Some(spec.name);
        }
    }
    None
}

pub fn is_source_file(path: &Path) -> bool {
    detect_language(path).is_some()
}

fn workspace_walker(root: &Path) -> ignore::Walk {
    // Hidden directories stay skipped; gitignore rules apply as usual.
    WalkBuilder::new(root)
        .ignore(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .parents(true)
        .require_git(false)
        .build()
}

/// Find a file anywhere under the workspace by its exact file name.
/// Traversal order decides ties; the first match wins.
pub fn find_file_by_name(root: &Path, file_name: &str) -> Option<PathBuf> {
    for entry in workspace_walker(root) {
        let entry = match entry {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("walk error: {err}");
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        if entry.file_name().to_string_lossy() == file_name {
            return Some(entry.into_path());
        }
    }
    None
}

/// Heuristic fallback tier: scan supported source files for a declaration
/// of `symbol` and return the first file that contains one. Used only when
/// no session-backed result pinned down a file.
pub fn find_declaration(root: &Path, symbol: &str) -> Option<PathBuf> {
    let pattern = declaration_pattern(symbol)?;
    for entry in workspace_walker(root) {
        let entry = match entry {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("walk error: {err}");
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if !is_source_file(path) {
            continue;
        }
        // One unreadable file never aborts the scan.
        let content = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("skipping {}: {err}", path.display());
                continue;
            }
        };
        if pattern.is_match(&content) {
            return Some(entry.into_path());
        }
    }
    None
}

/// Declaration keywords across the supported languages, anchored to the
/// symbol name on a word boundary.
fn declaration_pattern(symbol: &str) -> Option<Regex> {
    let escaped = regex::escape(symbol);
    Regex::new(&format!(
        r"(?m)^\s*(?:export\s+)?(?:async\s+)?(?:def|class|function|func|interface|type|const|let|var)\s+{escaped}\b"
    ))
    .ok()
}
