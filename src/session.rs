use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::RecordService;
use crate::db::{resolve_db_path, Database, RenameRecord};
use crate::error::{DbError, Result};
use crate::index::{self, Duplicate, FileIndex};
use crate::naming::{self, SAVE_EXTENSION};
use crate::picker::FilePicker;
use crate::table::{Query, RecordKey, Summary, Table};

/// Remote records joined with one scan of the project root. Never mutated;
/// a refresh produces a new snapshot.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub table: Table,
    pub index: FileIndex,
}

impl Snapshot {
    pub fn capture<S: RecordService + ?Sized>(service: &S, root: &Path) -> Result<Self> {
        let index = index::scan(root)?;
        let records = service.fetch_all()?;
        log::debug!("Fetched {} record(s)", records.len());
        let table = Table::join(records, &index);
        Ok(Self { table, index })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignOptions {
    /// Append `_{trial}` after the identifier.
    pub include_trial_name: bool,
}

impl Default for AssignOptions {
    fn default() -> Self {
        Self {
            include_trial_name: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassignOptions {
    pub include_trial_name: bool,
    /// Create the target entry when the trial has none of the requested type.
    pub create_missing: bool,
}

impl Default for ReassignOptions {
    fn default() -> Self {
        Self {
            include_trial_name: true,
            create_missing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of [`Session::reassign_folder`], one bucket per terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReassignReport {
    pub renamed: Vec<(PathBuf, PathBuf)>,
    pub ignored: Vec<PathBuf>,
    pub missing_type: Vec<PathBuf>,
    pub failed: Vec<FailedFile>,
    pub unattempted: Vec<PathBuf>,
}

/// Outcome of [`Session::tag_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagReport {
    pub renamed: Vec<(PathBuf, PathBuf)>,
    pub failed: Vec<FailedFile>,
}

pub struct Session<S> {
    service: S,
    project: String,
    root: PathBuf,
    journal: Option<Database>,
    snapshot: Arc<Snapshot>,
}

impl<S: RecordService> Session<S> {
    /// Scan `root`, fetch the project's records and open the rename journal.
    pub fn open(service: S, project: &str, root: &Path) -> Result<Self> {
        let snapshot = Snapshot::capture(&service, root)?;
        let journal = Database::new(&resolve_db_path(root))?;
        Ok(Self {
            service,
            project: project.to_string(),
            root: root.to_path_buf(),
            journal: Some(journal),
            snapshot: Arc::new(snapshot),
        })
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn table(&self) -> &Table {
        &self.snapshot.table
    }

    pub fn duplicates(&self) -> &[Duplicate] {
        self.snapshot.index.duplicates()
    }

    pub fn refresh(&mut self) -> Result<Arc<Snapshot>> {
        let snapshot = Arc::new(Snapshot::capture(&self.service, &self.root)?);
        self.snapshot = Arc::clone(&snapshot);
        Ok(snapshot)
    }

    pub fn query(&self, query: &Query) -> Summary {
        self.snapshot.table.summarize(query)
    }

    pub fn locate(&self, id: u64) -> Option<&Path> {
        self.snapshot.index.get(id)
    }

    /// The file currently carrying the identifier of `key`'s entry.
    pub fn bound_file(&self, key: &RecordKey) -> Option<&Path> {
        self.snapshot
            .table
            .find(key)
            .and_then(|row| row.file_name.as_deref())
    }

    pub fn get_file_id(&self, key: &RecordKey) -> Result<Option<u64>> {
        let mut matches = self.service.find(key)?;
        if matches.len() > 1 {
            return Err(DbError::Ambiguous(format!("({key})")));
        }
        Ok(matches.pop().map(|r| r.id))
    }

    /// Return the identifier of `key`'s entry, creating the entry if needed.
    pub fn create_file_id(&mut self, key: &RecordKey) -> Result<u64> {
        if let Some(id) = self.get_file_id(key)? {
            return Ok(id);
        }

        self.service.insert_record(key)?;
        self.refresh()?;

        self.snapshot
            .table
            .find(key)
            .map(|row| row.record.id)
            .ok_or_else(|| DbError::NotFound(format!("entry ({key}) after creating it")))
    }

    pub fn delete_file_id(&mut self, key: &RecordKey) -> Result<()> {
        self.service.delete_record(key)?;
        self.refresh()?;
        Ok(())
    }

    /// Rename a file so that it carries the identifier of `key`'s entry.
    ///
    /// Fails without touching the filesystem if the entry already has a file.
    /// When `current_file` is `None` the picker is asked; a cancelled
    /// selection returns `Ok(None)`.
    pub fn assign(
        &mut self,
        key: &RecordKey,
        current_file: Option<&Path>,
        picker: &mut dyn FilePicker,
        options: AssignOptions,
    ) -> Result<Option<PathBuf>> {
        self.ensure_unbound(key)?;

        let current_file = match current_file {
            Some(path) => path.to_path_buf(),
            None => {
                let prompt = format!("Please select the file for\n{key}");
                match picker.pick_file(&prompt, &self.root) {
                    Some(path) => path,
                    None => {
                        log::info!("No file selected for ({key})");
                        return Ok(None);
                    }
                }
            }
        };

        self.assign_file(key, &current_file, options.include_trial_name, "assign")
            .map(Some)
    }

    /// Rename every file bound to an entry to the canonical grammar.
    ///
    /// Refuses to start while the root holds duplicates. A file that cannot
    /// be renamed is reported and the others are still processed.
    pub fn tag_files(&mut self, include_trial_name: bool) -> Result<TagReport> {
        let snapshot = self.refresh()?;
        if snapshot.index.has_duplicates() {
            return Err(DbError::Duplicates {
                pairs: snapshot
                    .index
                    .duplicates()
                    .iter()
                    .map(|d| (d.original.clone(), d.duplicate.clone()))
                    .collect(),
            });
        }

        let mut report = TagReport::default();
        for row in snapshot.table.rows() {
            let Some(current) = &row.file_name else {
                continue;
            };
            let trial = include_trial_name.then_some(row.record.trial.as_str());
            match self.rename_tagged(current, row.record.id, trial, "tag") {
                Ok(new_path) if new_path != *current => {
                    report.renamed.push((current.clone(), new_path))
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Could not tag {}: {}", current.display(), e);
                    report.failed.push(FailedFile {
                        path: current.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.refresh()?;
        Ok(report)
    }

    /// Give the files of `folder` the identifiers of `file_type` entries.
    ///
    /// Each tagged file still carries the identifier of the file it was
    /// exported from. That entry's participant, session and trial select the
    /// `file_type` entry whose identifier replaces the stale one. The project
    /// is rescanned after every rename. Per-file errors are reported and the
    /// batch continues, except for fatal errors which leave the remaining
    /// files unattempted.
    pub fn reassign_folder(
        &mut self,
        file_type: &str,
        folder: &Path,
        options: ReassignOptions,
    ) -> Result<ReassignReport> {
        self.refresh()?;

        let mut files = Vec::new();
        for entry in fs::read_dir(folder).map_err(|e| DbError::io(folder, e))? {
            let entry = entry.map_err(|e| DbError::io(folder, e))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut report = ReassignReport::default();
        let mut pending = files.into_iter();
        while let Some(path) = pending.next() {
            let tagged = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(naming::has_marker)
                .unwrap_or(false);
            if !tagged {
                report.ignored.push(path);
                continue;
            }

            match self.reassign_file(file_type, &path, options) {
                Ok(Some(new_path)) => report.renamed.push((path, new_path)),
                Ok(None) => report.missing_type.push(path),
                Err(e) => {
                    log::warn!("Could not reassign {}: {}", path.display(), e);
                    let fatal = e.is_fatal();
                    report.failed.push(FailedFile {
                        path,
                        error: e.to_string(),
                    });
                    if fatal {
                        report.unattempted.extend(pending.by_ref());
                        break;
                    }
                }
            }
        }

        log::info!(
            "Reassigned {} file(s) to {}: {} ignored, {} without entry, {} failed",
            report.renamed.len(),
            file_type,
            report.ignored.len(),
            report.missing_type.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Write `contents` to the file of `key`'s entry, creating the entry and
    /// a canonical file under `<root>/<file>/<participant>/<session>/` when
    /// needed. Only `.ktk.zip` files are ever overwritten.
    pub fn save(&mut self, key: &RecordKey, contents: &[u8]) -> Result<PathBuf> {
        let id = self.create_file_id(key)?;

        let path = match self.bound_file(key) {
            Some(existing) => {
                let lowered = existing.to_string_lossy().to_lowercase();
                if !lowered.ends_with(SAVE_EXTENSION) {
                    return Err(DbError::AlreadyAssigned {
                        key: key.clone(),
                        existing: existing.to_path_buf(),
                    });
                }
                existing.to_path_buf()
            }
            None => {
                let folder = self
                    .root
                    .join(&key.file_type)
                    .join(&key.participant)
                    .join(&key.session);
                fs::create_dir_all(&folder).map_err(|e| DbError::io(&folder, e))?;
                folder.join(naming::canonical_name(id, &key.trial))
            }
        };

        fs::write(&path, contents).map_err(|e| DbError::io(&path, e))?;
        log::info!("Saved ({}) to {}", key, path.display());
        self.refresh()?;
        Ok(path)
    }

    pub fn load(&self, key: &RecordKey) -> Result<Vec<u8>> {
        let path = self
            .bound_file(key)
            .ok_or_else(|| DbError::NotFound(format!("file associated to ({key})")))?;
        fs::read(path).map_err(|e| DbError::io(path, e))
    }

    pub fn history(&self, limit: usize) -> Result<Vec<RenameRecord>> {
        match &self.journal {
            Some(journal) => Ok(journal.history(limit)?),
            None => Ok(Vec::new()),
        }
    }

    fn ensure_unbound(&self, key: &RecordKey) -> Result<()> {
        match self.bound_file(key) {
            Some(existing) => Err(DbError::AlreadyAssigned {
                key: key.clone(),
                existing: existing.to_path_buf(),
            }),
            None => Ok(()),
        }
    }

    fn reassign_file(
        &mut self,
        file_type: &str,
        path: &Path,
        options: ReassignOptions,
    ) -> Result<Option<PathBuf>> {
        let old_id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(naming::parse_identifier)
            .ok_or_else(|| DbError::NotFound(format!("file id in {}", path.display())))?;

        let source = self
            .service
            .find_by_id(old_id)?
            .ok_or_else(|| DbError::NotFound(format!("entry for file id {old_id}")))?;
        let key = source.key().with_file_type(file_type);

        if !options.create_missing && self.snapshot.table.find(&key).is_none() {
            return Ok(None);
        }

        self.ensure_unbound(&key)?;
        self.assign_file(&key, path, options.include_trial_name, "reassign")
            .map(Some)
    }

    fn assign_file(
        &mut self,
        key: &RecordKey,
        current: &Path,
        include_trial_name: bool,
        operation: &str,
    ) -> Result<PathBuf> {
        let id = self.create_file_id(key)?;
        // Creating the entry refreshed the snapshot; a file may already carry the id.
        self.ensure_unbound(key)?;

        let trial = include_trial_name.then_some(key.trial.as_str());
        let new_path = self.rename_tagged(current, id, trial, operation)?;
        self.refresh()?;
        Ok(new_path)
    }

    fn rename_tagged(
        &self,
        current: &Path,
        id: u64,
        trial: Option<&str>,
        operation: &str,
    ) -> Result<PathBuf> {
        fs::metadata(current).map_err(|e| DbError::io(current, e))?;
        let new_path = naming::tagged_path(current, id, trial).ok_or_else(|| {
            DbError::io(
                current,
                io::Error::new(io::ErrorKind::InvalidInput, "file name is not valid UTF-8"),
            )
        })?;
        if new_path == current {
            return Ok(new_path);
        }
        if new_path.exists() {
            return Err(DbError::io(
                &new_path,
                io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
            ));
        }

        fs::rename(current, &new_path).map_err(|e| DbError::io(current, e))?;
        log::info!("Renamed {} -> {}", current.display(), new_path.display());

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_rename(&RenameRecord::new(id, current, &new_path, operation)) {
                log::warn!("Failed to journal rename of {}: {}", current.display(), e);
            }
        }
        Ok(new_path)
    }
}

impl<S> fmt::Display for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "-".repeat(50);
        let table = &self.snapshot.table;
        writeln!(f, "{rule}")?;
        writeln!(f, "Session")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "    project: {}", self.project)?;
        writeln!(f, "root_folder: {}", self.root.display())?;
        writeln!(f, "  duplicates: {}", self.snapshot.index.duplicates().len())?;
        for (label, values) in [
            ("participants", table.participants()),
            ("sessions", table.sessions()),
            ("trials", table.trials()),
            ("files", table.file_types()),
        ] {
            writeln!(f, "{rule}")?;
            writeln!(f, "{label}:")?;
            writeln!(f, "{values:?}")?;
        }
        writeln!(f, "{rule}")
    }
}
