use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::db::JOURNAL_FILE_NAME;
use crate::error::{DbError, Result};
use crate::naming;

/// Two files discovered with the same identifier during one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Duplicate {
    pub id: u64,
    pub original: PathBuf,
    pub duplicate: PathBuf,
}

/// Identifier to path mapping of one scan of the project root.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    files: HashMap<u64, PathBuf>,
    duplicates: Vec<Duplicate>,
}

impl FileIndex {
    pub fn get(&self, id: u64) -> Option<&Path> {
        self.files.get(&id).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Path)> {
        self.files.iter().map(|(id, path)| (*id, path.as_path()))
    }

    pub fn duplicates(&self) -> &[Duplicate] {
        &self.duplicates
    }

    pub fn has_duplicates(&self) -> bool {
        !self.duplicates.is_empty()
    }

    pub(crate) fn insert(&mut self, id: u64, path: PathBuf) {
        self.files.insert(id, path);
    }
}

/// Walk `root` and index every file whose name carries an identifier.
///
/// Traversal is sorted by file name, so when two files share an identifier
/// the one met first keeps the slot and the other is recorded as a duplicate.
/// Only an unreadable root is an error; unreadable subdirectories are logged
/// and skipped.
pub fn scan(root: &Path) -> Result<FileIndex> {
    let mut index = FileIndex::default();

    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                let path = e.path().unwrap_or(root).to_path_buf();
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                return Err(DbError::io(path, source));
            }
            Err(e) => {
                log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !naming::has_marker(name) {
            continue;
        }
        let Some(id) = naming::parse_identifier(name) else {
            log::debug!("No identifier in {}", entry.path().display());
            continue;
        };

        if let Some(original) = index.files.get(&id) {
            index.duplicates.push(Duplicate {
                id,
                original: original.clone(),
                duplicate: entry.path().to_path_buf(),
            });
        } else {
            index.files.insert(id, entry.into_path());
        }
    }

    if index.has_duplicates() {
        log::warn!(
            "Duplicate file(s) found under {}. See the duplicates list.",
            root.display()
        );
    }
    log::debug!(
        "Indexed {} file(s) under {} ({} duplicate(s))",
        index.files.len(),
        root.display(),
        index.duplicates.len()
    );
    Ok(index)
}

fn is_ignored(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s == ".git" || s.starts_with(JOURNAL_FILE_NAME))
        .unwrap_or(false)
}
