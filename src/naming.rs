//! The `dbfid` file-name grammar.
//!
//! A tagged file is named `<base>_dbfid<ID>n[_{<trial>}]<ext>`. The identifier
//! is the only link between a file on disk and its database entry, so this
//! grammar must stay byte-compatible with the existing file corpus.

use std::path::{Path, PathBuf};

pub const MARKER: &str = "dbfid";
pub const TERMINATOR: char = 'n';

/// Extension used for files written by `Session::save`.
pub const SAVE_EXTENSION: &str = ".ktk.zip";

pub fn has_marker(file_name: &str) -> bool {
    file_name.contains(MARKER)
}

/// Extract the identifier that follows the first marker in `file_name`.
///
/// Returns `None` when there is no marker or when the text between the marker
/// and the terminator is not a plain non-negative integer. Names such as
/// `mydbfidnotes.txt` are therefore ignored instead of rejected.
pub fn parse_identifier(file_name: &str) -> Option<u64> {
    let (_, rest) = file_name.split_once(MARKER)?;
    let rest = rest.split(MARKER).next().unwrap_or(rest);
    let digits = rest.split(TERMINATOR).next().unwrap_or(rest);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Split a file name into base and extension the way the lab tools always
/// have: the extension is the last dot-suffix, and leading dots belong to
/// the base. `.ktk.zip` counts as a single extension.
pub fn split_extension(file_name: &str) -> (&str, &str) {
    let compound = file_name.len().saturating_sub(SAVE_EXTENSION.len());
    if compound > 0
        && file_name.is_char_boundary(compound)
        && file_name[compound..].eq_ignore_ascii_case(SAVE_EXTENSION)
    {
        return file_name.split_at(compound);
    }
    let leading = file_name.len() - file_name.trim_start_matches('.').len();
    match file_name[leading..].rfind('.') {
        Some(pos) => file_name.split_at(leading + pos),
        None => (file_name, ""),
    }
}

/// Compose the tagged name for `file_name` carrying identifier `id`.
///
/// An existing tag is replaced: everything before the first marker is kept
/// as the left part. Untagged names get `_` appended to their base.
pub fn tagged_name(file_name: &str, id: u64, trial: Option<&str>) -> String {
    let (base, ext) = split_extension(file_name);
    let left = match base.split_once(MARKER) {
        Some((left, _)) => left.to_string(),
        None => format!("{base}_"),
    };
    match trial {
        Some(trial) => format!("{left}{MARKER}{id}{TERMINATOR}_{{{trial}}}{ext}"),
        None => format!("{left}{MARKER}{id}{TERMINATOR}{ext}"),
    }
}

/// Same as [`tagged_name`], applied to the last component of `path`.
pub fn tagged_path(path: &Path, id: u64, trial: Option<&str>) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    Some(path.with_file_name(tagged_name(name, id, trial)))
}

/// File name used when a new data file is created for an entry.
pub fn canonical_name(id: u64, trial: &str) -> String {
    format!("{MARKER}{id}{TERMINATOR}_{{{trial}}}{SAVE_EXTENSION}")
}
