//! Command files for the `dbhelper` protocol.
//!
//! The web front end of the database hands the desktop a small text file
//! with one `command=value` per line. Lines run in order and execution stops
//! at the first failure.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::error::{DbError, Result};
use crate::index;
use crate::naming;
use crate::picker::FilePicker;

/// Highest protocol version understood by this helper.
pub const PROTOCOL_VERSION: f64 = 1.4;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub executed: usize,
    pub failure: Option<String>,
}

pub struct Dispatcher<'a, W> {
    root: &'a Path,
    picker: &'a mut dyn FilePicker,
    out: W,
}

impl<'a, W: Write> Dispatcher<'a, W> {
    pub fn new(root: &'a Path, picker: &'a mut dyn FilePicker, out: W) -> Self {
        Self { root, picker, out }
    }

    /// Run a command file, then delete it.
    pub fn run_file(&mut self, path: &Path) -> Result<DispatchReport> {
        let script = fs::read_to_string(path).map_err(|e| DbError::io(path, e))?;
        let report = self.run_script(&script);
        fs::remove_file(path).map_err(|e| DbError::io(path, e))?;
        Ok(report)
    }

    pub fn run_script(&mut self, script: &str) -> DispatchReport {
        let mut report = DispatchReport::default();
        for line in script.lines().filter(|l| !l.trim().is_empty()) {
            let (command, value) = line.split_once('=').unwrap_or((line, ""));
            let value = value.trim_end();
            log::debug!("Command {}={}", command, value);

            match self.execute(command, value) {
                Ok(()) => report.executed += 1,
                Err(e) => {
                    log::error!("Command {} failed: {}", command, e);
                    let _ = writeln!(self.out, "{e}");
                    report.failure = Some(e.to_string());
                    break;
                }
            }
        }
        report
    }

    fn execute(&mut self, command: &str, value: &str) -> Result<()> {
        match command {
            "require_version" => require_version(value),
            "rename_file" => self.rename_file(value),
            "message" => {
                let _ = writeln!(self.out, "{value}");
                Ok(())
            }
            "find_file" => self.find_file(value),
            other => Err(DbError::Command(format!("Unknown command: {other}"))),
        }
    }

    fn rename_file(&mut self, value: &str) -> Result<()> {
        let id = parse_id(value)?;
        let path = self
            .picker
            .pick_file(&format!("Select the file to tag with id {id}"), self.root)
            .ok_or_else(|| DbError::Command("Action cancelled.".into()))?;

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DbError::Command(format!("Invalid file name: {}", path.display())))?;
        if naming::has_marker(name) {
            return Err(DbError::Command(format!(
                "{} already contains '{}'. Is it not already in the database?\n\nAction cancelled.",
                path.display(),
                naming::MARKER
            )));
        }

        let new_path = path.with_file_name(naming::tagged_name(name, id, None));
        if new_path.exists() {
            return Err(DbError::io(
                &new_path,
                io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
            ));
        }
        fs::rename(&path, &new_path).map_err(|e| DbError::io(&path, e))?;
        log::info!("Renamed {} -> {}", path.display(), new_path.display());

        let _ = writeln!(
            self.out,
            "The file\n{}\nwas renamed\n{}\n\nRemember to upload it to the data server if not done yet.",
            path.display(),
            new_path.display()
        );
        Ok(())
    }

    fn find_file(&mut self, value: &str) -> Result<()> {
        let id = parse_id(value)?;
        let index = index::scan(self.root)?;
        let path = index
            .get(id)
            .ok_or_else(|| DbError::NotFound(format!("file id {id} on this computer")))?;
        let _ = writeln!(self.out, "{}", path.display());
        Ok(())
    }
}

fn require_version(value: &str) -> Result<()> {
    let requested: f64 = value
        .trim()
        .parse()
        .map_err(|_| DbError::Command(format!("Invalid version: {value}")))?;
    if requested > PROTOCOL_VERSION {
        return Err(DbError::Command(format!(
            "This helper supports version {PROTOCOL_VERSION}; version {requested} is required. Please update."
        )));
    }
    Ok(())
}

fn parse_id(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| DbError::Command(format!("Invalid file id: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::{NoPicker, PromptPicker};
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_messages_and_versions() {
        let dir = tempdir().unwrap();
        let mut out = Vec::new();
        let mut picker = NoPicker;
        let report = Dispatcher::new(dir.path(), &mut picker, &mut out)
            .run_script("require_version=1.2\nmessage=Hello lab\n");

        assert_eq!(report, DispatchReport { executed: 2, failure: None });
        assert_eq!(String::from_utf8(out).unwrap(), "Hello lab\n");
    }

    #[test]
    fn test_stops_at_first_failure() {
        let dir = tempdir().unwrap();
        let mut out = Vec::new();
        let mut picker = NoPicker;
        let report = Dispatcher::new(dir.path(), &mut picker, &mut out)
            .run_script("require_version=2.0\nmessage=never shown\n");

        assert_eq!(report.executed, 0);
        assert!(report.failure.is_some());
        assert!(!String::from_utf8(out).unwrap().contains("never shown"));
    }

    #[test]
    fn test_unknown_command() {
        let dir = tempdir().unwrap();
        let mut picker = NoPicker;
        let report = Dispatcher::new(dir.path(), &mut picker, Vec::new()).run_script("launch=now");
        assert_eq!(report.failure.as_deref(), Some("Unknown command: launch"));
    }

    #[test]
    fn test_rename_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("take1.raw"), b"data").unwrap();

        let mut picker = PromptPicker::new(Cursor::new("take1.raw\n"), Vec::new());
        let report = Dispatcher::new(dir.path(), &mut picker, Vec::new()).run_script("rename_file=42");

        assert_eq!(report.executed, 1);
        assert!(dir.path().join("take1_dbfid42n.raw").exists());
        assert!(!dir.path().join("take1.raw").exists());
    }

    #[test]
    fn test_rename_file_refuses_tagged_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("take1_dbfid7n.raw"), b"data").unwrap();

        let mut picker = PromptPicker::new(Cursor::new("take1_dbfid7n.raw\n"), Vec::new());
        let report = Dispatcher::new(dir.path(), &mut picker, Vec::new()).run_script("rename_file=42");

        assert_eq!(report.executed, 0);
        assert!(dir.path().join("take1_dbfid7n.raw").exists());
    }

    #[test]
    fn test_rename_file_cancelled() {
        let dir = tempdir().unwrap();
        let mut picker = NoPicker;
        let report = Dispatcher::new(dir.path(), &mut picker, Vec::new()).run_script("rename_file=42");
        assert_eq!(report.failure.as_deref(), Some("Action cancelled."));
    }

    #[test]
    fn test_find_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Raw")).unwrap();
        fs::write(dir.path().join("Raw/take1_dbfid42n.raw"), b"data").unwrap();

        let mut out = Vec::new();
        let mut picker = NoPicker;
        let report = Dispatcher::new(dir.path(), &mut picker, &mut out)
            .run_script("find_file=42\nfind_file=43\n");

        assert_eq!(report.executed, 1);
        assert!(report.failure.is_some());
        assert!(String::from_utf8(out).unwrap().contains("take1_dbfid42n.raw"));
    }

    #[test]
    fn test_run_file_removes_command_file() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("commands.txt");
        fs::write(&script, "message=hi\n").unwrap();

        let mut picker = NoPicker;
        let report = Dispatcher::new(dir.path(), &mut picker, Vec::new())
            .run_file(&script)
            .unwrap();
        assert_eq!(report.executed, 1);
        assert!(!script.exists());
    }
}
