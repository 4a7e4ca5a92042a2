//! Input discovery and output path derivation.

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::error::{Result, UpscaleError};

/// Recursive view over every regular file under an input root.
///
/// Dot-prefixed names below the root (`.DS_Store`, `.git/`) are never
/// yielded and hidden directories are not descended into. Iteration is lazy; calling [`InputSet::iter`] again restarts the walk.
#[derive(Debug, Clone)]
pub struct InputSet {
    root: PathBuf,
    extensions: Vec<String>,
    sorted: bool,
}

impl InputSet {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: Vec::new(),
            sorted: false,
        }
    }

    /// Restrict discovery to these extensions (case-insensitive, no dot).
    /// An empty list accepts every file.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        self
    }

    /// Sort siblings by file name instead of keeping filesystem order.
    pub fn sorted(mut self, sorted: bool) -> Self {
        self.sorted = sorted;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iter(&self) -> impl Iterator<Item = PathBuf> + '_ {
        let mut walker = WalkDir::new(&self.root).follow_links(true);
        if self.sorted {
            walker = walker.sort_by_file_name();
        }

        walker
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(error) => {
                    warn!(root = %self.root.display(), %error, "Skipping unreadable entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(move |path| self.accepts(path))
    }

    fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .is_some_and(|ext| self.extensions.contains(&ext))
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

/// Path of `input` relative to `input_root`, e.g. `LR/foo/bar.png` -> `foo/bar.png`.
pub fn relative_name(input_root: &Path, input: &Path) -> Result<PathBuf> {
    let relative = input
        .strip_prefix(input_root)
        .map_err(|_| UpscaleError::Discovery {
            path: input.to_path_buf(),
            reason: format!("not under input root {}", input_root.display()),
        })?;

    if relative.as_os_str().is_empty() {
        return Err(UpscaleError::Discovery {
            path: input.to_path_buf(),
            reason: "path is the input root itself".to_string(),
        });
    }

    Ok(relative.to_path_buf())
}

/// Output location for `input`: its root-relative name joined under `output_root`.
pub fn derive_output_path(input_root: &Path, output_root: &Path, input: &Path) -> Result<PathBuf> {
    Ok(output_root.join(relative_name(input_root, input)?))
}
