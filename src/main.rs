//! qa-runner - run generated test scripts in isolated subprocesses.
//!
//! Usage:
//!   qa-runner serve [--port 8000]              # Start HTTP gateway
//!   qa-runner run <FILE|-> [--remote URL]      # Execute one script and report

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use qa_runner::http_server::{self, ServerOptions};
use qa_runner::{
    AppState, ExecutionGateway, ExecutionRequest, ExecutionResult, Limits, LocalGateway,
    RemoteGateway, Runner, RunnerConfig,
};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "qa-runner")]
#[command(about = "Run generated test scripts in isolated subprocesses")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0", env = "QA_RUNNER_BIND")]
        bind: IpAddr,

        /// Port to listen on
        #[arg(long, default_value = "8000", env = "QA_RUNNER_PORT")]
        port: u16,

        /// Allow cross-origin requests from any origin
        #[arg(long)]
        cors: bool,

        #[command(flatten)]
        runner: RunnerArgs,
    },

    /// Execute one script and print the result
    Run {
        /// Script file, or `-` for stdin
        script: PathBuf,

        /// Submit to a running gateway instead of executing locally
        #[arg(long, env = "QA_RUNNER_REMOTE")]
        remote: Option<String>,

        /// Remove Markdown code fence markers before executing
        #[arg(long)]
        strip_fences: bool,

        /// Print the raw JSON result
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        runner: RunnerArgs,
    },
}

#[derive(Args, Debug)]
struct RunnerArgs {
    /// Wall-clock timeout in seconds
    #[arg(long, default_value = "60", env = "QA_RUNNER_TIMEOUT_SECS")]
    timeout_secs: u64,

    /// Wall-clock timeout in milliseconds (overrides --timeout-secs)
    #[arg(long, env = "QA_RUNNER_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Interpreter that runs the working file
    #[arg(long, default_value = qa_runner::config::DEFAULT_INTERPRETER, env = "QA_RUNNER_INTERPRETER")]
    interpreter: String,

    /// Extra interpreter argument, placed before the script path (repeatable)
    #[arg(long = "interpreter-arg", allow_hyphen_values = true)]
    interpreter_args: Vec<String>,

    /// Directory for per-run working directories (default: system temp dir)
    #[arg(long, env = "QA_RUNNER_WORK_ROOT")]
    work_root: Option<PathBuf>,

    /// Name of the working file
    #[arg(long, default_value = qa_runner::config::DEFAULT_SCRIPT_NAME, env = "QA_RUNNER_SCRIPT_NAME")]
    script_name: String,

    /// Memory limit in KB
    #[arg(long)]
    mem_kb: Option<u64>,

    /// Maximum file size in KB
    #[arg(long)]
    fsize_kb: Option<u64>,

    /// Maximum number of open files
    #[arg(long)]
    nofile: Option<u64>,

    /// Maximum number of processes
    #[arg(long)]
    nproc: Option<u64>,
}

impl RunnerArgs {
    fn timeout(&self) -> Duration {
        match self.timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.timeout_secs),
        }
    }

    fn into_config(self) -> RunnerConfig {
        let timeout = self.timeout();
        RunnerConfig {
            interpreter: self.interpreter,
            interpreter_args: self.interpreter_args,
            work_root: self.work_root,
            script_name: self.script_name,
            limits: Limits {
                timeout,
                mem_kb: self.mem_kb,
                fsize_kb: self.fsize_kb,
                nofile: self.nofile,
                nproc: self.nproc,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            port,
            cors,
            runner,
        } => {
            let config = runner.into_config();
            info!(config = ?config, "qa-runner v{}", env!("CARGO_PKG_VERSION"));
            let state = AppState::new(Runner::new(config));
            http_server::run_server(SocketAddr::new(bind, port), state, ServerOptions { cors })
                .await
                .context("HTTP server failed")?;
        }
        Commands::Run {
            script,
            remote,
            strip_fences,
            json,
            runner,
        } => {
            let mut code = read_script(&script)?;
            if strip_fences {
                code = strip_code_fences(&code);
            }

            let timeout = runner.timeout();
            let gateway: Box<dyn ExecutionGateway> = match remote {
                Some(url) => Box::new(RemoteGateway::new(&url, timeout)?),
                None => Box::new(LocalGateway::new(Arc::new(Runner::new(runner.into_config())))),
            };

            let result = gateway.execute(ExecutionRequest::new(code)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_report(&result);
            }
            exit(if result.success { 0 } else { 1 });
        }
    }

    Ok(())
}

fn read_script(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("reading script from stdin")?;
        Ok(code)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }
}

/// Remove Markdown code fence markers from model output, wherever they
/// appear, and trim the result.
fn strip_code_fences(code: &str) -> String {
    code.replace("```python", "").replace("```", "").trim().to_string()
}

fn print_report(result: &ExecutionResult) {
    if result.success {
        println!("Test Passed");
        println!("--- Console Logs ---");
        print_block(&result.output);
    } else {
        println!("Test Failed");
        if !result.output.is_empty() {
            println!("--- Console Logs ---");
            print_block(&result.output);
        }
        println!("--- Error Logs ---");
        print_block(&result.error);
    }
}

fn print_block(text: &str) {
    print!("{}", text);
    if !text.is_empty() && !text.ends_with('\n') {
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_python_fence() {
        let raw = "```python\nimport time\nprint('hi')\n```\n";
        assert_eq!(strip_code_fences(raw), "import time\nprint('hi')");
    }

    #[test]
    fn test_strip_bare_fence() {
        assert_eq!(strip_code_fences("```\nprint(1)\n```"), "print(1)");
    }

    #[test]
    fn test_unfenced_code_is_trimmed_only() {
        assert_eq!(strip_code_fences("  print(1)\n"), "print(1)");
    }

    #[test]
    fn test_strip_fence_with_surrounding_text() {
        let raw = "Here is the test:\n```python\nprint('hi')\n```\nLet me know if it works.";
        let code = strip_code_fences(raw);
        assert!(!code.contains("```"));
        assert_eq!(
            code,
            "Here is the test:\n\nprint('hi')\n\nLet me know if it works."
        );
    }

    #[test]
    fn test_timeout_ms_overrides_secs() {
        let cli = Cli::parse_from(["qa-runner", "run", "x.py", "--timeout-ms", "250"]);
        match cli.command {
            Commands::Run { runner, .. } => {
                assert_eq!(runner.timeout(), Duration::from_millis(250))
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::parse_from(["qa-runner", "serve"]);
        match cli.command {
            Commands::Serve { port, runner, .. } => {
                assert_eq!(port, 8000);
                let config = runner.into_config();
                assert_eq!(config.limits.timeout, Duration::from_secs(60));
                assert_eq!(config.script_name, "generated_test_script.py");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
