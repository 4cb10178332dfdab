use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// Interactive selection of a file or folder. `None` means the user
/// cancelled, which callers treat as a normal early return.
pub trait FilePicker {
    fn pick_file(&mut self, prompt: &str, initial_folder: &Path) -> Option<PathBuf>;
    fn pick_folder(&mut self, prompt: &str, initial_folder: &Path) -> Option<PathBuf>;
}

/// Picker for non-interactive callers: every selection is cancelled.
pub struct NoPicker;

impl FilePicker for NoPicker {
    fn pick_file(&mut self, _prompt: &str, _initial_folder: &Path) -> Option<PathBuf> {
        None
    }

    fn pick_folder(&mut self, _prompt: &str, _initial_folder: &Path) -> Option<PathBuf> {
        None
    }
}

/// Asks for a path on a line of input. An empty line cancels; relative
/// paths are taken from the initial folder.
pub struct PromptPicker<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptPicker<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, prompt: &str, initial_folder: &Path) -> Option<PathBuf> {
        let _ = writeln!(self.output, "{prompt}");
        let _ = write!(self.output, "[{}]> ", initial_folder.display());
        let _ = self.output.flush();

        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        let answer = line.trim();
        if answer.is_empty() {
            return None;
        }
        let path = PathBuf::from(answer);
        if path.is_absolute() {
            Some(path)
        } else {
            Some(initial_folder.join(path))
        }
    }
}

impl<R: BufRead, W: Write> FilePicker for PromptPicker<R, W> {
    fn pick_file(&mut self, prompt: &str, initial_folder: &Path) -> Option<PathBuf> {
        self.ask(prompt, initial_folder)
    }

    fn pick_folder(&mut self, prompt: &str, initial_folder: &Path) -> Option<PathBuf> {
        self.ask(prompt, initial_folder)
    }
}
