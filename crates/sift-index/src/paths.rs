//! Root-relative path normalisation.
//!
//! Every component compares paths in the same form: relative to the project
//! root, `/`-separated, with no leading `./` and no trailing slash. Manifest
//! keys, git diff output, watcher events and scanner results all pass through
//! [`normalize_to_relative`] before they are compared.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Normalise `path` to the root-relative form used as manifest keys.
///
/// Absolute paths under `root` have the root stripped. Paths outside the root
/// are kept, but still get forward slashes.
pub fn normalize_to_relative(path: impl AsRef<Path>, root: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let root = root.as_ref();

    let candidate = match path.strip_prefix(root) {
        Ok(stripped) => stripped.to_path_buf(),
        Err(_) => {
            // Lexical fallback for roots written with a different separator
            // or a trailing slash.
            let path_str = to_forward_slashes(&path.to_string_lossy());
            let root_str = to_forward_slashes(&root.to_string_lossy());
            let root_str = root_str.trim_end_matches('/');
            match path_str.strip_prefix(root_str) {
                Some(rest) if !root_str.is_empty() && (rest.is_empty() || rest.starts_with('/')) => {
                    PathBuf::from(rest.trim_start_matches('/'))
                }
                _ => PathBuf::from(path_str),
            }
        }
    };

    clean(&to_forward_slashes(&candidate.to_string_lossy()))
}

/// Normalise a path that is already relative (e.g. git output) without a root.
pub fn normalize_relative_str(path: &str) -> String {
    clean(&to_forward_slashes(path))
}

fn to_forward_slashes(s: &str) -> String {
    s.replace('\\', "/")
}

fn clean(s: &str) -> String {
    let mut out = s;
    while let Some(rest) = out.strip_prefix("./") {
        out = rest;
    }
    let out = out.trim_end_matches('/');
    // Collapse duplicate separators
    let mut collapsed = String::with_capacity(out.len());
    let mut prev_slash = false;
    for ch in out.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        collapsed.push(ch);
    }
    collapsed
}

/// Derived per-project index directory:
/// `<index_root>/<project-name>-<first 8 hex chars of sha256(root)>`.
pub fn index_dir_for(root: &Path, index_root: &Path) -> PathBuf {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());

    let mut hasher = Sha256::new();
    hasher.update(root.to_string_lossy().as_bytes());
    let digest = hex::encode(hasher.finalize());

    index_root.join(format!("{}-{}", name, &digest[..8]))
}
