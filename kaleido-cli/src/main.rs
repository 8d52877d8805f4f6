use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use kaleido_core::{Mode, RunStatus, Session, SessionConfig, WasmJit, run};

/// Kaleido: evaluates a script, or reads forms interactively from stdin.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Script to run. Without it, forms are read from standard input.
    #[arg(value_name = "SCRIPT")]
    script: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    execute(cli)
}

fn execute(cli: Cli) -> Result<ExitCode> {
    let mut session = Session::new(WasmJit::new(), SessionConfig::default());
    let mut out = io::stdout().lock();
    let mut diag = io::stderr().lock();

    let status = match &cli.script {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open script {}", path.display()))?;
            run(&mut session, BufReader::new(file), &mut out, &mut diag, Mode::Script)?
        }
        None => run(
            &mut session,
            io::stdin().lock(),
            &mut out,
            &mut diag,
            Mode::Interactive,
        )?,
    };

    session.close().context("failed to release compiled units")?;

    Ok(match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::FAILURE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_cmd::Command;
    use predicates::prelude::*;
    use std::fs;
    use tempfile::tempdir;

    fn script(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("input.kal");
        fs::write(&path, contents).expect("write script");
        (dir, path)
    }

    #[test]
    fn runs_script_and_prints_result() {
        let (_dir, path) = script("def foo(x) x*2;\nfoo(21);\n");

        Command::cargo_bin("kaleido")
            .expect("binary exists")
            .arg(&path)
            .assert()
            .success()
            .stderr(predicate::str::contains("Evaluated to 42.000000"));
    }

    #[test]
    fn program_output_goes_to_stdout() {
        let (_dir, path) = script("extern printd(x);\nfor i = 1, i < 5, 1 in printd(i);\n");

        Command::cargo_bin("kaleido")
            .expect("binary exists")
            .arg(&path)
            .assert()
            .success()
            .stdout("1.000000\n2.000000\n3.000000\n4.000000\n")
            .stderr(predicate::str::contains("Evaluated to 0.000000"));
    }

    #[test]
    fn parse_error_in_script_exits_with_failure() {
        let (_dir, path) = script("def foo(x) x*2;\nfoo(1 2);\n3;\n");

        Command::cargo_bin("kaleido")
            .expect("binary exists")
            .arg(&path)
            .assert()
            .code(1)
            .stderr(predicate::str::contains("^ unexpected number `2`"))
            .stderr(predicate::str::contains("Evaluated to 3.000000").not());
    }

    #[test]
    fn lowering_error_in_script_exits_with_failure() {
        let (_dir, path) = script("undefined(1);\n");

        Command::cargo_bin("kaleido")
            .expect("binary exists")
            .arg(&path)
            .assert()
            .code(1)
            .stderr(predicate::str::contains("unknown function `undefined`"));
    }

    #[test]
    fn unreadable_script_exits_with_failure() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("binary.kal");
        fs::write(&path, b"1+2;\n\xff\xfe 3+4;\n").expect("write script");

        Command::cargo_bin("kaleido")
            .expect("binary exists")
            .arg(&path)
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Evaluated to 3.000000"))
            .stderr(predicate::str::contains("i/o failure"));
    }

    #[test]
    fn missing_script_exits_with_failure() {
        let dir = tempdir().expect("tempdir");

        Command::cargo_bin("kaleido")
            .expect("binary exists")
            .arg(dir.path().join("missing.kal"))
            .assert()
            .code(1)
            .stderr(predicate::str::contains("failed to open script"));
    }

    #[test]
    fn stdin_session_keeps_going_after_errors() {
        Command::cargo_bin("kaleido")
            .expect("binary exists")
            .write_stdin("nope(1)\n1+2\n")
            .assert()
            .success()
            .stderr(predicate::str::contains(">>> "))
            .stderr(predicate::str::contains("unknown function `nope`"))
            .stderr(predicate::str::contains("Evaluated to 3.000000"));
    }

    #[test]
    fn cli_parses_optional_script() {
        let cli = Cli::try_parse_from(["kaleido"]).expect("no arguments");
        assert!(cli.script.is_none());
        let cli = Cli::try_parse_from(["kaleido", "prog.kal"]).expect("one argument");
        assert_eq!(cli.script, Some(PathBuf::from("prog.kal")));
        assert!(Cli::try_parse_from(["kaleido", "--emit", "llvm"]).is_err());
    }
}
