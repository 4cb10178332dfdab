pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod index;
pub mod naming;
pub mod picker;
pub mod session;
pub mod table;

use clap::{Args, Parser, Subcommand};
use keyring::Entry;
use serde::Serialize;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::api::{HttpRecordService, MosaClient, RecordService};
use crate::config::{AppConfig, ConfigManager, ConfigUpdate};
use crate::dispatch::Dispatcher;
use crate::error::{DbError, Result};
use crate::picker::{FilePicker, PromptPicker};
use crate::session::{AssignOptions, ReassignOptions, Session};
use crate::table::{Query, RecordKey};

const KEYRING_SERVICE: &str = "mosa-dbinterface";
const PASSWORD_ENV: &str = "MOSA_PASSWORD";
const CANCELLED: &str = "Action cancelled.";

#[derive(Parser)]
#[command(name = "mosa", version, about = "Keep lab data files in sync with the MOSA database")]
struct Cli {
    /// Show debug messages on the terminal
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct KeyArgs {
    participant: String,
    session: String,
    trial: String,
    /// File type, e.g. "Raw" or "Kinematics"
    file_type: String,
}

impl KeyArgs {
    fn key(&self) -> RecordKey {
        RecordKey::new(&self.participant, &self.session, &self.trial, &self.file_type)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Store credentials and check them against the server
    Login {
        #[arg(long)]
        project: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        root: String,
        #[arg(long)]
        url: Option<String>,
    },
    /// Forget the stored password
    Logout,
    /// Show or change the configuration
    Config {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        root: Option<String>,
        #[arg(long)]
        include_trial_name: Option<bool>,
    },
    /// Summary of the project and the local folder
    Show,
    /// Distinct values of every column among matching entries
    Query {
        #[arg(long)]
        participant: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        trial: Option<String>,
        #[arg(long = "file")]
        file_type: Option<String>,
    },
    /// Files sharing an identifier
    Duplicates,
    /// Path of the file carrying an identifier
    Locate { id: u64 },
    /// Create the entry for a key and print its identifier
    Create(KeyArgs),
    /// Delete the entry for a key
    Delete(KeyArgs),
    /// Bind a local file to an entry by renaming it
    Assign {
        #[command(flatten)]
        key: KeyArgs,
        /// File to rename; asked interactively when omitted
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        no_trial_name: bool,
    },
    /// Rename every bound file to the canonical name
    Tag {
        #[arg(long)]
        no_trial_name: bool,
    },
    /// Bind the files of a folder to the same entries under another file type
    Reassign {
        file_type: String,
        /// Folder to process; asked interactively when omitted
        folder: Option<PathBuf>,
        #[arg(long)]
        no_create: bool,
        #[arg(long)]
        no_trial_name: bool,
    },
    /// Write a file for an entry
    Save {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long)]
        input: PathBuf,
    },
    /// Read the file of an entry
    Load {
        #[command(flatten)]
        key: KeyArgs,
        /// Defaults to standard output
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Latest renames done in the root folder
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run a command file handed over by the web interface
    Dispatch { command_file: PathBuf },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli.command) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    use simplelog::*;

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let log_dir = PathBuf::from(&home).join(".local/share/mosa/logs");
    fs::create_dir_all(&log_dir).ok();
    let log_path = log_dir.join("mosa.log");

    let term_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        term_level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];
    match fs::File::create(&log_path) {
        Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file)),
        Err(e) => eprintln!("Cannot write log file {}: {}", log_path.display(), e),
    }
    let _ = CombinedLogger::init(loggers);

    log::debug!("Logging to {}", log_path.display());
}

fn resolve_password(username: &str) -> Result<String> {
    let stored = Entry::new(KEYRING_SERVICE, username).and_then(|entry| entry.get_password());
    choose_password(stored, std::env::var(PASSWORD_ENV).ok())
}

/// The keyring wins; the environment is only a fallback.
fn choose_password(
    stored: keyring::Result<String>,
    from_env: Option<String>,
) -> Result<String> {
    match (stored, from_env) {
        (Ok(password), _) => Ok(password),
        (Err(_), Some(password)) => Ok(password),
        (Err(e), None) => Err(DbError::Credentials(e)),
    }
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    eprint!("Password: ");
    let _ = io::stderr().flush();
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(DbError::Runtime)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn connect(config: &AppConfig, password: &str) -> Result<HttpRecordService> {
    let client = MosaClient::new(
        config.server_url(),
        config.project()?,
        config.username()?,
        password,
    )?;
    HttpRecordService::new(client)
}

fn open_session(config: &AppConfig) -> Result<Session<HttpRecordService>> {
    let password = resolve_password(config.username()?)?;
    let service = connect(config, &password)?;
    Session::open(service, config.project()?, &config.root_folder()?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| DbError::Command(e.to_string()))?;
    println!("{text}");
    Ok(())
}

/// A cancelled selection is reported but still counts as success.
fn assignment_message(outcome: Option<&Path>) -> String {
    match outcome {
        Some(new_path) => new_path.display().to_string(),
        None => CANCELLED.to_string(),
    }
}

fn stdin_picker() -> PromptPicker<io::StdinLock<'static>, io::Stderr> {
    PromptPicker::new(io::stdin().lock(), io::stderr())
}

fn execute(command: Command) -> Result<ExitCode> {
    let mut cm = ConfigManager::load_default();

    match command {
        Command::Login {
            project,
            username,
            root,
            url,
        } => {
            cm.update(ConfigUpdate {
                server_url: url,
                project: Some(project),
                username: Some(username.clone()),
                root_folder: Some(root),
                ..ConfigUpdate::default()
            })?;

            let password = read_password()?;
            let records = connect(&cm.config, &password)?.fetch_all()?;
            Entry::new(KEYRING_SERVICE, &username)?.set_password(&password)?;
            log::info!(
                "Logged in as {} ({} entries in {})",
                username,
                records.len(),
                cm.config.project()?
            );
        }
        Command::Logout => {
            let username = cm.config.username()?;
            match Entry::new(KEYRING_SERVICE, username)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(e.into()),
            }
            log::info!("Password of {} removed", username);
        }
        Command::Config {
            url,
            project,
            username,
            root,
            include_trial_name,
        } => {
            let update = ConfigUpdate {
                server_url: url,
                project,
                username,
                root_folder: root,
                include_trial_name,
            };
            let changed = update.server_url.is_some()
                || update.project.is_some()
                || update.username.is_some()
                || update.root_folder.is_some()
                || update.include_trial_name.is_some();
            if changed {
                cm.update(update)?;
                log::info!("Configuration saved to {}", cm.path().display());
            }
            print_json(&cm.config)?;
        }
        Command::Show => {
            let session = open_session(&cm.config)?;
            println!("{session}");
        }
        Command::Query {
            participant,
            session,
            trial,
            file_type,
        } => {
            let query = Query {
                participant,
                session,
                trial,
                file_type,
            };
            let session = open_session(&cm.config)?;
            print_json(&session.query(&query))?;
        }
        Command::Duplicates => {
            let session = open_session(&cm.config)?;
            print_json(&session.duplicates())?;
        }
        Command::Locate { id } => {
            let session = open_session(&cm.config)?;
            let path = session
                .locate(id)
                .ok_or_else(|| DbError::NotFound(format!("file id {id} in {}", session.root().display())))?;
            println!("{}", path.display());
        }
        Command::Create(key) => {
            let mut session = open_session(&cm.config)?;
            println!("{}", session.create_file_id(&key.key())?);
        }
        Command::Delete(key) => {
            let mut session = open_session(&cm.config)?;
            session.delete_file_id(&key.key())?;
        }
        Command::Assign {
            key,
            path,
            no_trial_name,
        } => {
            let options = AssignOptions {
                include_trial_name: cm.config.include_trial_name && !no_trial_name,
            };
            let mut session = open_session(&cm.config)?;
            let mut picker = stdin_picker();
            let outcome = session.assign(&key.key(), path.as_deref(), &mut picker, options)?;
            println!("{}", assignment_message(outcome.as_deref()));
        }
        Command::Tag { no_trial_name } => {
            let mut session = open_session(&cm.config)?;
            let report = session.tag_files(cm.config.include_trial_name && !no_trial_name)?;
            print_json(&report)?;
            if !report.failed.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Reassign {
            file_type,
            folder,
            no_create,
            no_trial_name,
        } => {
            let options = ReassignOptions {
                include_trial_name: cm.config.include_trial_name && !no_trial_name,
                create_missing: !no_create,
            };
            let mut session = open_session(&cm.config)?;
            let folder = match folder {
                Some(folder) => folder,
                None => {
                    let prompt = format!("Please select the folder of {file_type} files");
                    match stdin_picker().pick_folder(&prompt, session.root()) {
                        Some(folder) => folder,
                        None => {
                            println!("{CANCELLED}");
                            return Ok(ExitCode::SUCCESS);
                        }
                    }
                }
            };
            let report = session.reassign_folder(&file_type, &folder, options)?;
            print_json(&report)?;
            if !report.failed.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Save { key, input } => {
            let contents = fs::read(&input).map_err(|e| DbError::io(&input, e))?;
            let mut session = open_session(&cm.config)?;
            let path = session.save(&key.key(), &contents)?;
            println!("{}", path.display());
        }
        Command::Load { key, output } => {
            let session = open_session(&cm.config)?;
            let contents = session.load(&key.key())?;
            match output {
                Some(path) => fs::write(&path, contents).map_err(|e| DbError::io(&path, e))?,
                None => io::stdout().write_all(&contents).map_err(DbError::Runtime)?,
            }
        }
        Command::History { limit } => {
            let session = open_session(&cm.config)?;
            print_json(&session.history(limit)?)?;
        }
        Command::Dispatch { command_file } => {
            let root = cm.config.root_folder()?;
            let mut picker = stdin_picker();
            let report = Dispatcher::new(&root, &mut picker, io::stdout()).run_file(&command_file)?;
            if report.failure.is_some() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_password_wins() {
        let password = choose_password(Ok("stored".into()), Some("env".into())).unwrap();
        assert_eq!(password, "stored");
    }

    #[test]
    fn test_env_password_is_fallback() {
        let password = choose_password(Err(keyring::Error::NoEntry), Some("env".into())).unwrap();
        assert_eq!(password, "env");
    }

    #[test]
    fn test_missing_password() {
        assert!(matches!(
            choose_password(Err(keyring::Error::NoEntry), None),
            Err(DbError::Credentials(keyring::Error::NoEntry))
        ));
    }

    #[test]
    fn test_resolve_password_never_panics_without_store() {
        // Whatever the platform store holds, an unknown account either
        // resolves from the environment or reports missing credentials.
        match resolve_password("mosa-test-unknown-account") {
            Ok(_) | Err(DbError::Credentials(_)) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_assignment_message() {
        assert_eq!(assignment_message(None), "Action cancelled.");
        assert_eq!(assignment_message(Some(Path::new("/data/x_dbfid7n.c3d"))), "/data/x_dbfid7n.c3d");
    }

    #[test]
    fn test_cli_parses_key_arguments() {
        let cli = Cli::try_parse_from(["mosa", "assign", "P01", "SB01", "T1", "Raw", "--path", "x.c3d"])
            .unwrap();
        match cli.command {
            Command::Assign { key, path, .. } => {
                assert_eq!(key.key(), RecordKey::new("P01", "SB01", "T1", "Raw"));
                assert_eq!(path, Some(PathBuf::from("x.c3d")));
            }
            _ => panic!("expected assign"),
        }
    }
}
