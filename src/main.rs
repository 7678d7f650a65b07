//! Codebridge - collaborative code rooms with sandboxed execution.
//!
//! Usage:
//!   codebridge serve [--port 3005]                    # Start HTTP + WebSocket server
//!   codebridge run Main.py --language python          # Run one file through the sandbox

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use clap::{Parser, Subcommand};
use codebridge::config::{default_staging_root, Config, RateLimit, DEFAULT_PORT, DEFAULT_RATE_LIMIT};
use codebridge::protocol::ServerEvent;
use codebridge::run::{Run, RunSlot};
use codebridge::{Language, RunStatus, SandboxRuntime, Supervisor};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "codebridge")]
#[command(about = "Shared code rooms with sandboxed, live-streamed execution")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct SandboxArgs {
    /// Directory runs are staged in
    #[arg(long, env = "CODEBRIDGE_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Wall-clock limit per run in seconds
    #[arg(long, default_value = "60")]
    time_limit: u64,

    /// Container runtime binary
    #[arg(long, default_value = "docker")]
    sandbox_bin: String,

    /// Image name prefix; the language name is appended
    #[arg(long, default_value = "codebridge-")]
    image_prefix: String,

    /// HTTP requests allowed per client address per window (0 disables)
    #[arg(long, default_value_t = DEFAULT_RATE_LIMIT.requests)]
    rate_limit: u32,

    /// Rate limit window in seconds
    #[arg(long, default_value_t = DEFAULT_RATE_LIMIT.window.as_secs())]
    rate_limit_window: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },

    /// Run a single source file through the sandbox, attached to this terminal
    Run {
        /// Source file to run
        file: PathBuf,

        /// Language of the file (python, cpp, java)
        #[arg(long, short)]
        language: String,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
}

impl SandboxArgs {
    fn into_config(self, host: IpAddr, port: u16) -> std::io::Result<Config> {
        let staging_root = absolute(self.staging_dir.unwrap_or_else(default_staging_root))?;
        Ok(Config {
            host,
            port,
            staging_root,
            time_limit: Duration::from_secs(self.time_limit.max(1)),
            runtime: SandboxRuntime::docker(&self.sandbox_bin, &self.image_prefix),
            rate_limit: (self.rate_limit > 0).then(|| RateLimit {
                requests: self.rate_limit,
                window: Duration::from_secs(self.rate_limit_window.max(1)),
            }),
        })
    }
}

/// The runtime mounts the staged directory by path, so it has to be absolute.
fn absolute(path: PathBuf) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { host, port, sandbox } => {
            let config = match sandbox.into_config(host, port) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };
            if let Err(e) = codebridge::http_server::run_server(config).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Run { file, language, sandbox } => {
            let config = match sandbox.into_config(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };
            exit(run_oneshot(&file, &language, config).await);
        }
    }
}

/// Run one file, streaming output to stdout and terminal lines to the program's stdin.
async fn run_oneshot(file: &Path, language: &str, config: Config) -> i32 {
    let language: Language = match language.parse() {
        Ok(language) => language,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let code = match tokio::fs::read_to_string(file).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: cannot read {}: {}", file.display(), e);
            return 1;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let slot = RunSlot::new();
    let run = Run::new(
        format!("local-{}", std::process::id()),
        language,
        config.time_limit,
        tx,
        &slot,
    );
    if slot.claim(run.clone()).is_err() {
        return 1;
    }

    let supervisor = Supervisor::new(config.runtime, config.staging_root);
    supervisor.start(run.clone(), code);

    let input_run = run.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !input_run.write_input(line) && input_run.status().is_terminal() {
                break;
            }
        }
    });

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        if let ServerEvent::ProgramOutput { output, .. } = event {
            let _ = stdout.write_all(output.as_bytes());
            let _ = stdout.flush();
        }
    }

    run.finished().await;
    match run.status() {
        RunStatus::Completed => 0,
        _ => 1,
    }
}
