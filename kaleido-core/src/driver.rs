//! Read-compile-evaluate loop.
//!
//! Reads top-level forms from `input` one at a time and feeds them to a
//! [`Session`]. Program output (from `printd` and friends) goes to `out`;
//! prompts, IR dumps, results and errors go to `diag`.

use std::io::{BufRead, Write};

use crate::diagnostic::Diagnostic;
use crate::error::{CoreError, SessionError};
use crate::jit::ExecutionEngine;
use crate::lexer::{Lexer, LineSource};
use crate::parser::Parser;
use crate::session::{Outcome, Session};

pub const PROMPT: &str = ">>> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Prompt before every form and keep going after errors.
    Interactive,
    /// Stop at the first error.
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Input ran out without a read failure, a fatal error or (in script
    /// mode) a recoverable one.
    Completed,
    /// Script mode hit a parse or lowering error.
    Failed,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        self == RunStatus::Completed
    }
}

pub fn run<E, R, O, D>(
    session: &mut Session<E>,
    input: R,
    out: &mut O,
    diag: &mut D,
    mode: Mode,
) -> Result<RunStatus, CoreError>
where
    E: ExecutionEngine,
    R: BufRead,
    O: Write,
    D: Write,
{
    let source = LineSource::new(input);
    let read_error = source.error_slot();
    let mut parser = Parser::new(Lexer::new(source));

    loop {
        if mode == Mode::Interactive {
            write!(diag, "{PROMPT}")?;
            diag.flush()?;
        }

        let parsed = parser.parse_top_level();
        if let Some(err) = read_error.take() {
            return Err(err.into());
        }
        let item = match parsed {
            Ok(Some(item)) => item,
            Ok(None) => {
                if mode == Mode::Interactive {
                    writeln!(diag)?;
                }
                return Ok(RunStatus::Completed);
            }
            Err(err) => {
                let rest = parser.lexer_mut().discard_line();
                write!(diag, "{}", Diagnostic::from_parse_error(&err, &rest))?;
                if mode == Mode::Script {
                    return Ok(RunStatus::Failed);
                }
                continue;
            }
        };

        let result = session.process(item);
        out.write_all(&session.drain_output())?;
        out.flush()?;

        match result {
            Ok(outcome) => report(diag, &outcome)?,
            Err(SessionError::Jit(err)) => return Err(err.into()),
            Err(err) => {
                writeln!(diag, "Error: {err}")?;
                if mode == Mode::Script {
                    return Ok(RunStatus::Failed);
                }
            }
        }
    }
}

fn report<D: Write>(diag: &mut D, outcome: &Outcome) -> std::io::Result<()> {
    match outcome {
        Outcome::Defined { ir, .. } => write!(diag, "Read function definition:\n{ir}"),
        Outcome::Declared { ir, .. } => write!(diag, "Read extern:\n{ir}"),
        Outcome::Evaluated { value, ir } => {
            write!(diag, "Read top-level expression:\n{ir}")?;
            writeln!(diag, "Evaluated to {value:.6}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JitError;
    use crate::jit::WasmJit;
    use crate::session::SessionConfig;

    struct Run {
        status: RunStatus,
        out: String,
        diag: String,
    }

    fn run_source(source: &str, mode: Mode) -> Run {
        let mut session = Session::new(WasmJit::new(), SessionConfig::default());
        let mut out = Vec::new();
        let mut diag = Vec::new();
        let status = run(&mut session, source.as_bytes(), &mut out, &mut diag, mode).expect("run");
        session.close().expect("close");
        Run {
            status,
            out: String::from_utf8(out).expect("utf-8"),
            diag: String::from_utf8(diag).expect("utf-8"),
        }
    }

    #[test]
    fn script_evaluates_and_reports() {
        let run = run_source("def foo(x) x*2;\nfoo(21);\n", Mode::Script);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.diag.contains("Read function definition:"));
        assert!(run.diag.contains("define double @foo(double %x)"));
        assert!(run.diag.contains("Evaluated to 42.000000"));
        assert!(!run.diag.contains(PROMPT));
    }

    #[test]
    fn program_output_goes_to_out() {
        let run = run_source("extern putchard(c);\nputchard(72); putchard(105);\n", Mode::Script);
        assert_eq!(run.out, "Hi");
        assert!(!run.diag.contains("Hi"));
    }

    #[test]
    fn script_stops_at_first_parse_error() {
        let run = run_source("1 + ;\n2 + 3;\n", Mode::Script);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.diag.contains("1 + ;"));
        assert!(run.diag.contains("    ^ unexpected `;`"));
        assert!(!run.diag.contains("Evaluated to 5.000000"));
    }

    #[test]
    fn script_stops_at_first_lowering_error() {
        let run = run_source("nope(1);\n2 + 3;\n", Mode::Script);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.diag.contains("unknown function `nope`"));
        assert!(!run.diag.contains("Evaluated to"));
    }

    #[test]
    fn interactive_mode_recovers_and_prompts() {
        let run = run_source("def f(x) ) junk\nnope(1)\n4 * 2\n", Mode::Interactive);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.diag.starts_with(PROMPT));
        assert!(run.diag.contains("def f(x) ) junk"));
        assert!(run.diag.contains("unknown function `nope`"));
        assert!(run.diag.contains("Evaluated to 8.000000"));
    }

    #[test]
    fn empty_input_completes() {
        let run = run_source("", Mode::Script);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.diag.is_empty());
    }

    #[test]
    fn calling_an_undefined_extern_is_fatal() {
        let mut session = Session::new(WasmJit::new(), SessionConfig::default());
        let mut out = Vec::new();
        let mut diag = Vec::new();
        let result = run(
            &mut session,
            "extern nowhere(x); nowhere(1);".as_bytes(),
            &mut out,
            &mut diag,
            Mode::Interactive,
        );
        assert!(matches!(result, Err(CoreError::Jit(JitError::Trap(_)))));
    }

    #[test]
    fn forward_declared_mutual_recursion_runs() {
        let run = run_source(
            "extern odd(n);\n\
             def even(n) if n < 1 then 1 else odd(n-1);\n\
             def odd(n) if n < 1 then 0 else even(n-1);\n\
             even(4);\n",
            Mode::Script,
        );
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.diag.contains("Evaluated to 1.000000"));
    }

    #[test]
    fn invalid_utf8_input_is_an_io_error() {
        let mut session = Session::new(WasmJit::new(), SessionConfig::default());
        let mut out = Vec::new();
        let mut diag = Vec::new();
        let input: &[u8] = b"1+2;\n\xff\xfe 3+4;\n5+6;\n";
        let result = run(&mut session, input, &mut out, &mut diag, Mode::Script);
        match result {
            Err(CoreError::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::InvalidData),
            other => panic!("expected an I/O error, got {other:?}"),
        }
        let diag = String::from_utf8(diag).expect("utf-8");
        assert!(diag.contains("Evaluated to 3.000000"));
        assert!(!diag.contains("Evaluated to 11.000000"));
    }
}
