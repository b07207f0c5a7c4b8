//! sandprof CLI - Profile untrusted Python code from the command line

use clap::{Args, Parser, Subcommand};
use sandprof_core::{Sandbox, SandboxConfig, ValidationError, precheck};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sandprof")]
#[command(author, version, about = "Run untrusted Python code under limits and profile it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check, run and profile Python code
    Run {
        #[command(flatten)]
        source: Source,

        /// Wall-clock timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Address-space limit in MB
        #[arg(short, long, default_value = "100")]
        memory: u64,

        /// CPU-time limit in seconds (defaults to timeout + 1)
        #[arg(long)]
        cpu: Option<u64>,

        /// Python interpreter
        #[arg(long)]
        python: Option<PathBuf>,

        /// Skip the syntax pre-check
        #[arg(long)]
        no_check: bool,
    },

    /// Only run the syntax pre-check
    Check {
        #[command(flatten)]
        source: Source,

        /// Python interpreter
        #[arg(long)]
        python: Option<PathBuf>,
    },
}

#[derive(Args)]
struct Source {
    /// Code to run (or - for stdin)
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    code: Option<String>,

    /// Read code from a file
    #[arg(short, long)]
    file: Option<PathBuf>,
}

impl Source {
    fn read(self) -> std::io::Result<String> {
        match (self.code, self.file) {
            (_, Some(path)) => std::fs::read_to_string(path),
            (Some(code), None) if code == "-" => {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                Ok(buf)
            }
            (Some(code), None) => Ok(code),
            (None, None) => Ok(String::new()),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandprof=warn")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run {
            source,
            timeout,
            memory,
            cpu,
            python,
            no_check,
        } => {
            let code = source.read()?;
            let mut builder = SandboxConfig::builder()
                .timeout_secs(timeout)
                .memory_limit_mb(memory);
            if let Some(cpu) = cpu {
                builder = builder.cpu_limit_secs(cpu);
            }
            if let Some(python) = python {
                builder = builder.python_path(python);
            }
            let sandbox = Sandbox::new(builder.build())?;
            tracing::debug!(code_len = code.len(), no_check, "running from the command line");

            let outcome = if no_check {
                sandbox.run(&code)
            } else {
                sandbox.profile(&code)
            };
            let result = match outcome {
                Ok(result) => result,
                Err(e) => return Ok(rejected(&e)),
            };

            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.error.is_some() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            })
        }

        Commands::Check { source, python } => {
            let code = source.read()?;
            let mut config = SandboxConfig::default();
            if let Some(python) = python {
                config.python_path = python;
            }
            config.validate()?;

            match precheck::check_syntax(&config, &code) {
                Ok(()) => {
                    println!("ok");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Ok(rejected(&e)),
            }
        }
    }
}

fn rejected(err: &ValidationError) -> ExitCode {
    eprintln!("{err}");
    ExitCode::from(2)
}
