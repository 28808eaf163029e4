//! Discovery of indexable files under a project root.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use ignore::WalkBuilder;

use crate::paths::normalize_to_relative;

/// Lists the files that should be indexed.
pub trait FileDiscovery: Send + Sync {
    /// Root-relative, normalised paths of every indexable file, sorted.
    fn discover(&self, root: &Path) -> Result<Vec<String>>;

    /// Whether a single root-relative path would be indexed, ignoring ignore files.
    fn accepts(&self, _relative: &str) -> bool {
        true
    }
}

/// Gitignore-aware directory walker filtered by extension.
#[derive(Debug, Clone)]
pub struct WalkScanner {
    extensions: HashSet<String>,
    exclude_dirs: HashSet<String>,
    respect_gitignore: bool,
}

impl WalkScanner {
    pub fn new(extensions: &[String], exclude_dirs: &[String], respect_gitignore: bool) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.trim_start_matches('.').to_lowercase()).collect(),
            exclude_dirs: exclude_dirs.iter().cloned().collect(),
            respect_gitignore,
        }
    }

    pub fn from_config(config: &sift_config::IndexingConfig) -> Self {
        Self::new(
            &config.extensions,
            &config.exclude_dirs,
            config.respect_gitignore,
        )
    }

    fn wants(&self, relative: &str) -> bool {
        if relative
            .split('/')
            .any(|segment| self.exclude_dirs.contains(segment))
        {
            return false;
        }
        relative
            .rsplit_once('.')
            .map(|(_, ext)| self.extensions.contains(&ext.to_lowercase()))
            .unwrap_or(false)
    }
}

impl FileDiscovery for WalkScanner {
    fn discover(&self, root: &Path) -> Result<Vec<String>> {
        let walker = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(self.respect_gitignore)
            .git_global(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .require_git(false)
            .build();

        let mut files = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let relative = normalize_to_relative(entry.path(), root);
            if self.wants(&relative) {
                files.push(relative);
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }

    fn accepts(&self, relative: &str) -> bool {
        self.wants(relative)
    }
}
