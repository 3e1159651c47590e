use crate::error::{LynxError, Result};
use crate::manifest::{rel_to_name, FileStat};
use crate::protocol::{META_FILE, TEMP_PREFIX, TRACKER_DIR_SUFFIX};
use std::path::Path;
// Lynk directory enumeration for the sync loop and CreateMeta

/// Name filters applied while walking a lynk directory
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub exclude_files: Vec<String>,
    pub exclude_dirs: Vec<String>,
}

impl FileFilter {
    /// Skips everything Lynx itself keeps inside a lynk directory: the
    /// manifest, the tracker directory and in-flight download temp files.
    pub fn for_lynk(lynk_name: &str) -> Self {
        Self {
            exclude_files: vec![META_FILE.to_string(), format!("{TEMP_PREFIX}*")],
            exclude_dirs: vec![format!("{lynk_name}{TRACKER_DIR_SUFFIX}")],
        }
    }

    /// Check if a file should be included
    fn should_include_file(&self, path: &Path) -> bool {
        let filename = path.file_name().unwrap_or_default().to_string_lossy();
        !self
            .exclude_files
            .iter()
            .any(|pattern| glob_match(pattern, &filename))
    }

    /// Check if a directory should be included (only its own name is matched)
    fn should_include_dir(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        !self.exclude_dirs.iter().any(|pattern| glob_match(pattern, name))
    }
}

/// Simple glob matching (supports * wildcards)
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if pattern.contains('*') {
        if pattern.starts_with('*') && pattern.ends_with('*') && pattern.len() > 1 {
            let middle = &pattern[1..pattern.len() - 1];
            return text.contains(middle);
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            return text.ends_with(suffix);
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            return text.starts_with(prefix);
        }
    }

    pattern == text
}

/// Walk `root` and list regular files relative to it, sorted by name.
/// Entries that vanish or become unreadable mid-walk are skipped.
pub fn enumerate_directory_filtered(root: &Path, filter: &FileFilter) -> Result<Vec<FileStat>> {
    use walkdir::WalkDir;

    if !root.is_dir() {
        return Err(LynxError::NotFound(format!(
            "lynk directory {}",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            // Skip excluded directories entirely - this prevents walking into them
            e.depth() == 0 || !e.file_type().is_dir() || filter.should_include_dir(e.path())
        })
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() || !filter.should_include_file(entry.path()) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        entries.push(FileStat {
            name: rel_to_name(rel),
            length: metadata.len(),
        });
    }

    entries.sort();
    Ok(entries)
}

/// List a lynk directory with the standard metadata exclusions
pub fn enumerate_lynk(root: &Path, lynk_name: &str) -> Result<Vec<FileStat>> {
    enumerate_directory_filtered(root, &FileFilter::for_lynk(lynk_name))
}
