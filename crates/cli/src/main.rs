mod config;
mod serve;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use quire_core::{validate_fields, validate_signers};
use quire_engine::{normalize_fields, CreateEnvelope};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Quire multi-party document signing service.
#[derive(Parser)]
#[command(name = "quire", version, about = "Quire document signing service")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// TOML config file; flags and env vars override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Directory holding source and sealed documents
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Path to TLS certificate PEM file (requires --tls-key)
        #[arg(long)]
        tls_cert: Option<PathBuf>,
        /// Path to TLS private key PEM file (requires --tls-cert)
        #[arg(long)]
        tls_key: Option<PathBuf>,
    },

    /// Check an envelope request JSON file without a server
    Validate {
        /// Path to the envelope request JSON file
        file: PathBuf,
    },

    /// Check a server TOML config file
    CheckConfig {
        /// Path to the config file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    match cli.command {
        Commands::Serve {
            config,
            port,
            data_dir,
            tls_cert,
            tls_key,
        } => {
            // Validate TLS flags: both must be provided or neither
            if tls_cert.is_some() != tls_key.is_some() {
                report_error(
                    "error: --tls-cert and --tls-key must both be provided",
                    cli.output,
                    cli.quiet,
                );
                process::exit(1);
            }
            let mut server_config = match config {
                Some(path) => ServerConfig::load(&path).unwrap_or_else(|msg| {
                    report_error(&msg, cli.output, cli.quiet);
                    process::exit(1);
                }),
                None => ServerConfig::default(),
            };
            if let Some(port) = port {
                server_config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                server_config.server.data_dir = data_dir;
            }
            server_config.apply_env();
            if let Err(errors) = server_config.validate() {
                report_error(&errors.join("\n"), cli.output, cli.quiet);
                process::exit(1);
            }

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    report_error(&format!("failed to start runtime: {}", e), cli.output, cli.quiet);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(server_config, tls_cert, tls_key)) {
                report_error(&format!("Server error: {}", e), cli.output, cli.quiet);
                process::exit(1);
            }
        }
        Commands::Validate { file } => {
            cmd_validate(&file, cli.output, cli.quiet);
        }
        Commands::CheckConfig { file } => {
            cmd_check_config(&file, cli.output, cli.quiet);
        }
    }
}

/// Logs go to stderr so `--output json` keeps stdout machine-readable.
fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn cmd_validate(file: &Path, output: OutputFormat, quiet: bool) {
    let text = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error reading file '{}': {}", file.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    let request: CreateEnvelope = match serde_json::from_str(&text) {
        Ok(r) => r,
        Err(e) => {
            let msg = format!("error parsing envelope request '{}': {}", file.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };

    let mut problems: Vec<String> = Vec::new();
    if request.title.trim().is_empty() {
        problems.push("title must not be empty".to_string());
    }
    if request.document_ref.trim().is_empty() {
        problems.push("document_ref must not be empty".to_string());
    }
    let signers = request.signers();
    if let Err(violations) = validate_signers(&signers, request.signing_mode) {
        problems.extend(violations.iter().map(|v| v.to_string()));
    }
    // Coverage is checked as at send time: an uncovered signer blocks sending.
    let fields = normalize_fields(request.fields.clone());
    if let Err(violations) = validate_fields(&signers, &fields) {
        problems.extend(violations.iter().map(|v| v.to_string()));
    }

    match output {
        OutputFormat::Json => {
            let result = serde_json::json!({
                "file": file.display().to_string(),
                "valid": problems.is_empty(),
                "signers": signers.len(),
                "fields": fields.len(),
                "problems": problems,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string())
            );
        }
        OutputFormat::Text => {
            if problems.is_empty() {
                if !quiet {
                    println!(
                        "{}: ok ({} signer(s), {} field(s), ready to send)",
                        file.display(),
                        signers.len(),
                        fields.len()
                    );
                }
            } else if !quiet {
                eprintln!("{}: {} problem(s)", file.display(), problems.len());
                for problem in &problems {
                    eprintln!("  - {}", problem);
                }
            }
        }
    }
    if !problems.is_empty() {
        process::exit(1);
    }
}

fn cmd_check_config(file: &Path, output: OutputFormat, quiet: bool) {
    let config = match ServerConfig::load(file) {
        Ok(c) => c,
        Err(msg) => {
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    let problems = config.validate().err().unwrap_or_default();

    match output {
        OutputFormat::Json => {
            let result = serde_json::json!({
                "file": file.display().to_string(),
                "valid": problems.is_empty(),
                "problems": problems,
                "config": config,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string())
            );
        }
        OutputFormat::Text => {
            if !quiet {
                if problems.is_empty() {
                    println!("{}: ok", file.display());
                } else {
                    eprintln!("{}: {} problem(s)", file.display(), problems.len());
                    for problem in &problems {
                        eprintln!("  - {}", problem);
                    }
                }
            }
        }
    }
    if !problems.is_empty() {
        process::exit(1);
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
