use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use settle_apply::run::{run_documents, run_update};
use settle_apply::source::{parse_manifest, HttpManifestSource, ManifestRef, DEFAULT_FAMILIES};
use settle_apply::{Applier, RunReport};
use settle_kubehub::KubeResourceClient;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "settlectl", version, about = "Converge existing cluster objects onto released manifests")]
struct Cli {
    /// Output format for the run summary
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace every namespaced object is applied in
    #[arg(short = 'n', long = "namespace", global = true, env = "SETTLE_NAMESPACE", default_value = "razeedeploy")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download released manifests and update the objects they describe
    Update {
        /// Base URL serving <family>/<version>/us/resource.yaml (default: release assets)
        #[arg(short = 's', long = "file-source", env = "SETTLE_FILE_SOURCE")]
        file_source: Option<String>,
        /// Family to update, e.g. "WatchKeeper" or "RemoteResource=2.1.0" (repeatable)
        #[arg(long = "family", value_name = "NAME[=VERSION]")]
        families: Vec<ManifestRef>,
        /// Per-request timeout for manifest downloads
        #[arg(long = "http-timeout-secs", default_value_t = 30)]
        http_timeout_secs: u64,
    },
    /// Update objects from local manifest files
    Apply {
        /// Manifest file (first YAML document is applied)
        #[arg(short = 'f', long = "filename", required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("SETTLE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SETTLE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SETTLE_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = ?e, "run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let client = KubeResourceClient::try_default().await?;
    let applier = Applier::new(client).with_namespace(cli.namespace.clone());

    let report = match cli.command {
        Commands::Update { file_source, families, http_timeout_secs } => {
            let families = if families.is_empty() {
                DEFAULT_FAMILIES.iter().map(|f| ManifestRef::latest(*f)).collect()
            } else {
                families
            };
            info!(ns = %cli.namespace, source = ?file_source, families = ?families, "update invoked");
            let source = HttpManifestSource::new(file_source, Duration::from_secs(http_timeout_secs))?;
            run_update(&source, &applier, &families).await?
        }
        Commands::Apply { files } => {
            info!(ns = %cli.namespace, files = files.len(), "apply invoked");
            let mut documents = Vec::with_capacity(files.len());
            for f in &files {
                let text = std::fs::read_to_string(f).with_context(|| format!("reading {}", f.display()))?;
                let doc = parse_manifest(&text).with_context(|| format!("parsing {}", f.display()))?;
                documents.push((f.display().to_string(), doc));
            }
            run_documents(&applier, documents).await
        }
    };

    print_report(&report, cli.output)?;
    Ok(report.success())
}

fn print_report(report: &RunReport, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for e in report.entries() {
                match &e.result {
                    Ok(o) => println!("{:<28} {:<8} {:<4} {}", e.label, format!("{:?}", o.action).to_lowercase(), o.status_code, o.uri),
                    Err(err) => {
                        let code = err.status_code().map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
                        println!("{:<28} {:<8} {:<4} {}", e.label, "failed", code, err);
                    }
                }
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row<'a> {
                manifest: &'a str,
                ok: bool,
                uri: Option<&'a str>,
                action: Option<settle_core::Action>,
                status_code: Option<u16>,
                error: Option<String>,
                body: serde_json::Value,
            }
            let rows: Vec<_> = report
                .entries()
                .iter()
                .map(|e| match &e.result {
                    Ok(o) => Row { manifest: &e.label, ok: true, uri: Some(o.uri.as_str()), action: Some(o.action), status_code: Some(o.status_code), error: None, body: serde_json::Value::Null },
                    Err(err) => Row { manifest: &e.label, ok: false, uri: None, action: None, status_code: err.status_code(), error: Some(err.to_string()), body: err.body() },
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}
