//! Syntax pre-check
//!
//! Asks the configured interpreter whether the code parses, before any of it
//! is executed. The checker only calls `ast.parse`; it runs under the same
//! ceilings and timeout as a real execution.

use crate::error::{ExecutionError, ValidationError};
use crate::process::{self, Supervision, Termination};
use crate::SandboxConfig;
use std::process::Command;

const CHECKER: &str = r"import ast, sys
source = sys.stdin.buffer.read().decode('utf-8', 'replace')
try:
    ast.parse(source)
except (SyntaxError, ValueError) as exc:
    line = getattr(exc, 'lineno', None) or 0
    message = getattr(exc, 'msg', None) or str(exc)
    sys.stdout.write('%s\t%d\t%s' % (type(exc).__name__, line, str(message).replace('\t', ' ').replace('\n', ' ')))
else:
    sys.stdout.write('ok')
";

/// Check that `code` parses with well-formed indentation.
pub fn check_syntax(config: &SandboxConfig, code: &str) -> Result<(), ValidationError> {
    let mut command = Command::new(&config.python_path);
    command
        .arg("-I")
        .arg("-B")
        .arg("-c")
        .arg(CHECKER)
        .current_dir(&config.workspace_root)
        .env_clear()
        .envs(config.env.iter().map(|(k, v)| (k, v)));

    let supervision = Supervision {
        limits: config.limits,
        timeout: config.timeout,
        poll_interval: config.poll_interval,
        max_output_bytes: 64 * 1024,
    };

    let finished = process::run(&mut command, &supervision, Some(code.as_bytes().to_vec()))
        .map_err(|e| ValidationError::Checker(e.to_string()))?;

    match finished.termination {
        Termination::TimedOut => {
            Err(ValidationError::Checker(ExecutionError::Timeout {
                seconds: config.timeout.as_secs(),
            }
            .to_string()))
        }
        Termination::Exited(status) if !status.success() => Err(ValidationError::Checker(format!(
            "checker failed ({}): {}",
            process::describe_status(status),
            finished.stderr.text().trim()
        ))),
        Termination::Exited(_) => {
            let verdict = parse_verdict(&finished.stdout.text());
            if let Err(ref err) = verdict {
                tracing::debug!(error = %err, "code rejected by syntax check");
            }
            verdict
        }
    }
}

/// `ok`, or `<ExceptionClass>\t<line>\t<message>`
fn parse_verdict(stdout: &str) -> Result<(), ValidationError> {
    let stdout = stdout.trim();
    if stdout == "ok" {
        return Ok(());
    }

    let mut parts = stdout.splitn(3, '\t');
    let (Some(kind), Some(line), Some(message)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ValidationError::Checker(format!(
            "unexpected checker output: {stdout:?}"
        )));
    };
    let line = line.parse().unwrap_or(0);
    let message = message.to_owned();

    match kind {
        "IndentationError" | "TabError" => Err(ValidationError::Indentation { line, message }),
        _ => Err(ValidationError::Syntax { line, message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_verdict_passes() {
        assert!(parse_verdict("ok\n").is_ok());
    }

    #[test]
    fn indentation_verdicts() {
        assert_eq!(
            parse_verdict("IndentationError\t2\texpected an indented block"),
            Err(ValidationError::Indentation {
                line: 2,
                message: "expected an indented block".into()
            })
        );
        assert!(matches!(
            parse_verdict("TabError\t4\tinconsistent use of tabs"),
            Err(ValidationError::Indentation { line: 4, .. })
        ));
    }

    #[test]
    fn other_syntax_errors() {
        assert_eq!(
            parse_verdict("SyntaxError\t1\tinvalid syntax"),
            Err(ValidationError::Syntax {
                line: 1,
                message: "invalid syntax".into()
            })
        );
    }

    #[test]
    fn garbage_output_is_a_checker_error() {
        assert!(matches!(
            parse_verdict("Traceback"),
            Err(ValidationError::Checker(_))
        ));
    }
}
