//! Evaluator subprocess spawning.
//!
//! Builds the launch command from a call site's library artifacts and starts
//! the process with piped stdin/stdout.

use super::proc::Proc;
use crate::config::EvalOptions;
use crate::contract::CallSite;
use crate::error::{EvalError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Command line used to start one evaluator process.
///
/// Workers are only reused for call sites resolving to an equal command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchCommand {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments after the program.
    pub args: Vec<String>,
    /// Working directory (the library directory), if any.
    pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// Resolve the command for a call site.
    ///
    /// Without the dynamic evaluator the first library entry is the compiled
    /// evaluator executable and the rest are its arguments. With it, the
    /// configured evaluator program loads every library entry.
    pub fn for_call_site<S: CallSite + ?Sized>(site: &S) -> Result<Self> {
        let dir = site.library_directory();
        let working_dir = (!dir.as_os_str().is_empty()).then(|| dir.to_path_buf());
        let library = site.library();

        if site.dynamic_evaluator_enabled() {
            let options: &EvalOptions = site.options();
            let program = options.evaluator_program.clone().ok_or_else(|| {
                EvalError::Config(format!(
                    "dynamic evaluator enabled for '{}' but no evaluator program configured",
                    site.name()
                ))
            })?;
            let libraries = library
                .iter()
                .map(|lib| resolve(dir, lib).to_string_lossy().into_owned());
            Ok(Self::new(program)
                .with_args(options.evaluator_args.iter().cloned())
                .with_args(libraries)
                .with_working_dir(working_dir))
        } else {
            let (first, rest) = library.split_first().ok_or_else(|| {
                EvalError::Config(format!("no library artifact for '{}'", site.name()))
            })?;
            Ok(Self::new(resolve(dir, first))
                .with_args(rest.iter().cloned())
                .with_working_dir(working_dir))
        }
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl std::fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Resolve a library entry against the library directory.
fn resolve(dir: &Path, entry: &str) -> PathBuf {
    let path = Path::new(entry);
    if path.is_absolute() || dir.as_os_str().is_empty() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

/// Spawn an evaluator subprocess.
///
/// Evaluator stderr goes to the parent's stderr.
pub fn spawn_evaluator(command: &LaunchCommand) -> Result<Proc> {
    let spawn_error = |message: String| EvalError::Spawn {
        command: command.to_string(),
        message,
    };

    if command.program.components().count() > 1 && !command.program.exists() {
        return Err(spawn_error("evaluator artifact not found".into()));
    }
    if let Some(dir) = &command.working_dir
        && !dir.is_dir()
    {
        return Err(spawn_error(format!(
            "library directory {} does not exist",
            dir.display()
        )));
    }

    let mut cmd = command.to_command();
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;

    Proc::from_child(child)
}
