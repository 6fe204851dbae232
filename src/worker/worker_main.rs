//! Reference evaluator process.
//!
//! This module runs when `evalcache worker` is invoked. It speaks the session
//! protocol on stdin/stdout and provides a handful of built-in functions used
//! by the integration tests and for trying pools out from the command line.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{Token, WorkRequest, WorkResponse};
use crate::contract::{ResponseReader, Value};
use crate::error::{EvalError, Result};
use crate::model::{EvalValue, read_value_after};
use std::collections::HashMap;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::time::Duration;

/// Exit code used by the `crash` functions.
pub const CRASH_EXIT_CODE: i32 = 3;

/// Longest sleep the `sleep` function accepts, in seconds.
const MAX_SLEEP_SECS: f64 = 3600.0;

/// Settings for the reference evaluator.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Library artifacts named on the command line.
    pub libraries: Vec<String>,
    /// Marker file for `crash_once`.
    pub crash_marker: Option<PathBuf>,
}

/// What to send back for one request.
#[derive(Debug, PartialEq)]
enum Outcome {
    Values(Vec<EvalValue>),
    Error(String),
    /// Exit without answering.
    Crash,
    /// Announce a real and send something that is not one.
    Garbage,
}

/// Built-in functions and the state they keep between calls.
struct Evaluator {
    options: WorkerOptions,
    /// Per external object call counts for `counter`.
    counters: HashMap<String, i64>,
}

impl Evaluator {
    fn new(options: WorkerOptions) -> Self {
        Self {
            options,
            counters: HashMap::new(),
        }
    }

    fn call(&mut self, function: &str, args: Vec<EvalValue>) -> Outcome {
        match function {
            "add" => sum(&args).map_or_else(Outcome::Error, |s| Outcome::Values(vec![EvalValue::Real(s)])),
            "echo" => Outcome::Values(args),
            "concat" => {
                let text: String = args
                    .iter()
                    .map(|v| match v {
                        EvalValue::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                Outcome::Values(vec![EvalValue::String(text)])
            }
            "scale" => scale(&args).map_or_else(Outcome::Error, |v| Outcome::Values(vec![v])),
            "counter" => self.counter(&args),
            "pid" => Outcome::Values(vec![EvalValue::Integer(i64::from(std::process::id()))]),
            "libraries" => Outcome::Values(vec![EvalValue::vector(
                self.options
                    .libraries
                    .iter()
                    .cloned()
                    .map(EvalValue::String)
                    .collect(),
            )]),
            "sleep" => {
                let secs = args.first().and_then(EvalValue::as_f64).unwrap_or(0.0);
                if !(0.0..=MAX_SLEEP_SECS).contains(&secs) {
                    return Outcome::Error(format!("cannot sleep for {} seconds", secs));
                }
                std::thread::sleep(Duration::from_secs_f64(secs));
                Outcome::Values(vec![EvalValue::Real(secs)])
            }
            "fail" => match args.first() {
                Some(EvalValue::String(message)) => Outcome::Error(message.clone()),
                _ => Outcome::Error("failure requested".into()),
            },
            "crash" => Outcome::Crash,
            "crash_once" => self.crash_once(args),
            "garbage" => Outcome::Garbage,
            other => Outcome::Error(format!("unknown function '{}'", other)),
        }
    }

    /// Count calls per external object; the handle is the first argument.
    fn counter(&mut self, args: &[EvalValue]) -> Outcome {
        let Some(EvalValue::ExternalObject(handle)) = args.first() else {
            return Outcome::Error("counter needs an external object".into());
        };
        let count = self.counters.entry(handle.clone()).or_insert(0);
        *count += 1;
        Outcome::Values(vec![EvalValue::Integer(*count)])
    }

    /// Crash the first time the marker is absent, echo the arguments afterwards.
    fn crash_once(&mut self, args: Vec<EvalValue>) -> Outcome {
        let Some(marker) = &self.options.crash_marker else {
            return Outcome::Error("crash_once needs --crash-marker".into());
        };
        if marker.exists() {
            return Outcome::Values(args);
        }
        match std::fs::write(marker, b"crashed\n") {
            Ok(()) => Outcome::Crash,
            Err(e) => Outcome::Error(format!("cannot write {}: {}", marker.display(), e)),
        }
    }
}

fn sum(args: &[EvalValue]) -> std::result::Result<f64, String> {
    args.iter().try_fold(0.0, |acc, v| {
        v.as_f64()
            .map(|x| acc + x)
            .ok_or_else(|| format!("add expects numbers, got {}", v))
    })
}

/// Multiply a number or numeric array by a factor.
fn scale(args: &[EvalValue]) -> std::result::Result<EvalValue, String> {
    let [value, factor] = args else {
        return Err("scale expects a value and a factor".into());
    };
    let factor = factor
        .as_f64()
        .ok_or_else(|| format!("scale factor must be a number, got {}", factor))?;
    match value {
        EvalValue::Array { dims, elements } => {
            let scaled = elements
                .iter()
                .map(|e| {
                    e.as_f64()
                        .map(|x| EvalValue::Real(x * factor))
                        .ok_or_else(|| format!("cannot scale {}", e))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(EvalValue::Array {
                dims: dims.clone(),
                elements: scaled,
            })
        }
        other => other
            .as_f64()
            .map(|x| EvalValue::Real(x * factor))
            .ok_or_else(|| format!("cannot scale {}", other)),
    }
}

impl ResponseReader for LineReader {
    fn next_line(&mut self) -> Result<String> {
        self.read_line_owned()?
            .ok_or_else(|| EvalError::Transport("input closed mid-request".into()))
    }

    fn next_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.read_exact_until(len, None)?)
    }
}

/// Read argument values up to `END`.
///
/// `Ok(None)` means stdin closed. Undecodable arguments are skipped up to
/// `END` and reported as an error message.
fn read_arguments(reader: &mut LineReader) -> io::Result<Option<std::result::Result<Vec<EvalValue>, String>>> {
    let mut args = Vec::new();
    loop {
        let Some(line) = reader.read_line_owned()? else {
            return Ok(None);
        };
        if line == Token::End.as_str() {
            return Ok(Some(Ok(args)));
        }
        match read_value_after(&line, reader, None) {
            Ok(value) => args.push(value),
            Err(EvalError::Io(e)) => return Err(e),
            Err(EvalError::Transport(_)) => return Ok(None),
            Err(e) => {
                while let Some(line) = reader.read_line_owned()? {
                    if line == Token::End.as_str() {
                        return Ok(Some(Err(format!("bad argument: {}", e))));
                    }
                }
                return Ok(None);
            }
        }
    }
}

fn respond(writer: &mut LineWriter, outcome: Outcome) -> io::Result<()> {
    match outcome {
        Outcome::Values(values) => {
            writer.write_all(WorkResponse::result(values.len()).to_line().as_bytes())?;
            for value in &values {
                value.serialize(writer.stream())?;
            }
        }
        Outcome::Error(message) => {
            writer.write_all(WorkResponse::error(message).to_line().as_bytes())?;
        }
        Outcome::Garbage => {
            writer.write_all(WorkResponse::result(1).to_line().as_bytes())?;
            writer.push_line("R not-a-number")?;
        }
        Outcome::Crash => return Ok(()),
    }
    writer.write_line(Token::Ready.as_str())
}

/// Evaluator main loop. Returns the process exit code.
fn worker_loop(
    reader: &mut LineReader,
    writer: &mut LineWriter,
    evaluator: &mut Evaluator,
) -> io::Result<i32> {
    writer.write_line(Token::Start.as_str())?;

    loop {
        let line = match reader.read_line_owned()? {
            Some(line) => line,
            // Parent closed the pipe
            None => return Ok(0),
        };

        let function = match WorkRequest::from_line(&line) {
            Some(WorkRequest::Exit) => return Ok(0),
            Some(WorkRequest::Eval { function }) => function,
            None => {
                writer.write_all(
                    WorkResponse::error(format!("invalid request '{}'", line))
                        .to_line()
                        .as_bytes(),
                )?;
                writer.write_line(Token::Ready.as_str())?;
                continue;
            }
        };

        let outcome = match read_arguments(reader)? {
            None => return Ok(0),
            Some(Ok(args)) => evaluator.call(&function, args),
            Some(Err(message)) => Outcome::Error(message),
        };

        if outcome == Outcome::Crash {
            return Ok(CRASH_EXIT_CODE);
        }
        respond(writer, outcome)?;
    }
}

/// Run the evaluator on stdin/stdout and exit.
pub fn run_worker_main(options: WorkerOptions) -> ! {
    // Ignore SIGPIPE - we handle pipe errors via io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let channels = io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .and_then(|input| Ok((input, io::stdout().as_fd().try_clone_to_owned()?)));
    let (input, output) = match channels {
        Ok(fds) => fds,
        Err(e) => {
            eprintln!("Evaluator error: {}", e);
            std::process::exit(1);
        }
    };

    let mut reader = LineReader::new(PipeFd::new(input));
    let mut writer = LineWriter::new(PipeFd::new(output));
    let mut evaluator = Evaluator::new(options);

    match worker_loop(&mut reader, &mut writer, &mut evaluator) {
        Ok(code) => {
            let _ = io::stderr().flush();
            std::process::exit(code)
        }
        Err(e) => {
            eprintln!("Evaluator error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> Evaluator {
        Evaluator::new(WorkerOptions::default())
    }

    #[test]
    fn test_add() {
        let outcome = evaluator().call("add", vec![EvalValue::Integer(2), EvalValue::Real(0.5)]);
        assert_eq!(outcome, Outcome::Values(vec![EvalValue::Real(2.5)]));

        let outcome = evaluator().call("add", vec![EvalValue::String("x".into())]);
        assert!(matches!(outcome, Outcome::Error(_)));
    }

    #[test]
    fn test_concat() {
        let outcome = evaluator().call(
            "concat",
            vec![EvalValue::String("a".into()), EvalValue::Integer(1)],
        );
        assert_eq!(outcome, Outcome::Values(vec![EvalValue::String("a1".into())]));
    }

    #[test]
    fn test_scale_array() {
        let array = EvalValue::vector(vec![EvalValue::Real(1.0), EvalValue::Integer(2)]);
        let outcome = evaluator().call("scale", vec![array, EvalValue::Real(3.0)]);
        assert_eq!(
            outcome,
            Outcome::Values(vec![EvalValue::vector(vec![
                EvalValue::Real(3.0),
                EvalValue::Real(6.0)
            ])])
        );
    }

    #[test]
    fn test_counter_per_handle() {
        let mut ev = evaluator();
        let a = || vec![EvalValue::ExternalObject("a".into())];
        let b = || vec![EvalValue::ExternalObject("b".into())];
        assert_eq!(ev.call("counter", a()), Outcome::Values(vec![EvalValue::Integer(1)]));
        assert_eq!(ev.call("counter", a()), Outcome::Values(vec![EvalValue::Integer(2)]));
        assert_eq!(ev.call("counter", b()), Outcome::Values(vec![EvalValue::Integer(1)]));
        assert!(matches!(ev.call("counter", vec![]), Outcome::Error(_)));
    }

    #[test]
    fn test_fail_and_unknown() {
        assert_eq!(
            evaluator().call("fail", vec![EvalValue::String("boom".into())]),
            Outcome::Error("boom".into())
        );
        match evaluator().call("nope", vec![]) {
            Outcome::Error(msg) => assert!(msg.contains("unknown function")),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_crash_once_uses_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("crashed");
        let mut ev = Evaluator::new(WorkerOptions {
            crash_marker: Some(marker.clone()),
            ..Default::default()
        });

        assert_eq!(ev.call("crash_once", vec![EvalValue::Integer(1)]), Outcome::Crash);
        assert!(marker.exists());
        assert_eq!(
            ev.call("crash_once", vec![EvalValue::Integer(1)]),
            Outcome::Values(vec![EvalValue::Integer(1)])
        );
    }

    #[test]
    fn test_crash_once_without_marker() {
        assert!(matches!(evaluator().call("crash_once", vec![]), Outcome::Error(_)));
    }

    #[test]
    fn test_libraries() {
        let mut ev = Evaluator::new(WorkerOptions {
            libraries: vec!["/lib/a.so".into()],
            crash_marker: None,
        });
        assert_eq!(
            ev.call("libraries", vec![]),
            Outcome::Values(vec![EvalValue::vector(vec![EvalValue::String(
                "/lib/a.so".into()
            )])])
        );
    }

    #[test]
    fn test_sleep_rejects_negative() {
        assert!(matches!(
            evaluator().call("sleep", vec![EvalValue::Real(-1.0)]),
            Outcome::Error(_)
        ));
    }
}
