use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tlmsg::{Client, ClientConfig, TranslateLocally, TranslateRequest};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, PartialEq)]
enum Action {
    ListModels { remote: bool },
    Translate { request: TranslateRequest },
    Download { model_id: String },
}

#[derive(Debug, PartialEq)]
struct Cli {
    peer: Option<PathBuf>,
    peer_args: Vec<String>,
    action: Action,
}

fn usage() {
    eprintln!("Usage: tlmsg [--peer <path>] [--arg <arg>]... <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  list-models [--remote]                 List installed (and remote) models");
    eprintln!("  translate <src> <trg> <text> [--html]  Translate text between languages");
    eprintln!("  download <model-id>                    Download a remote model");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --peer <path>    Peer executable [default: $TLMSG_PEER or translateLocally]");
    eprintln!("  --arg <arg>      Peer argument, repeatable [default: -p]");
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// Initialize tracing from RUST_LOG, else TLMSG_LOG; LOG_FORMAT=json for JSON.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TLMSG_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("tlmsg={level},tlmsg_cli={level}"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut peer = None;
    let mut peer_args = Vec::new();
    let mut positional = Vec::new();
    let mut remote = false;
    let mut html = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--peer" => {
                i += 1;
                peer = Some(PathBuf::from(args.get(i).ok_or("--peer requires a value")?));
            }
            "--arg" => {
                i += 1;
                peer_args.push(args.get(i).ok_or("--arg requires a value")?.clone());
            }
            "--remote" => remote = true,
            "--html" => html = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let (command, rest) = positional
        .split_first()
        .ok_or("missing command")?;

    let action = match (command.as_str(), rest) {
        ("list-models", []) => Action::ListModels { remote },
        ("translate", [src, trg, text]) => Action::Translate {
            request: TranslateRequest::new(src, trg, text).html(html),
        },
        ("download", [model_id]) => Action::Download {
            model_id: model_id.clone(),
        },
        ("list-models" | "translate" | "download", _) => {
            return Err(format!("wrong number of arguments for {command}"));
        }
        (other, _) => return Err(format!("unknown command: {other}")),
    };

    if remote && !matches!(action, Action::ListModels { .. }) {
        return Err("--remote only applies to list-models".to_string());
    }
    if html && !matches!(action, Action::Translate { .. }) {
        return Err("--html only applies to translate".to_string());
    }

    Ok(Cli {
        peer,
        peer_args,
        action,
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ClientConfig::from_env().context("invalid environment")?;
    if let Some(peer) = cli.peer {
        config.program = peer;
    }
    if !cli.peer_args.is_empty() {
        config = config.with_args(cli.peer_args);
    }

    let program = config.program.display().to_string();
    let client = Client::spawn(config)
        .await
        .with_context(|| format!("failed to start {program}"))?;
    let tl = TranslateLocally::new(client);

    let outcome = execute(&tl, cli.action).await;

    let report = tl.client().shutdown().await;
    match &report.peer_error {
        Some(e) => tracing::warn!(error = %e, "Peer did not shut down cleanly"),
        None => tracing::debug!(?report, "Peer shut down"),
    }

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn execute(tl: &TranslateLocally, action: Action) -> anyhow::Result<serde_json::Value> {
    let output = match action {
        Action::ListModels { remote } => {
            let models = tl.list_models(remote).await.context("ListModels failed")?;
            serde_json::to_value(models)?
        }
        Action::Translate { request } => {
            let text = tl.translate(request).await.context("Translate failed")?;
            serde_json::json!({ "text": text })
        }
        Action::Download { model_id } => {
            let model = tl
                .download_model(&model_id, |progress| match progress.fraction() {
                    Some(fraction) => eprintln!(
                        "downloading: {:>3.0}% ({}/{} bytes)",
                        fraction * 100.0,
                        progress.read,
                        progress.size
                    ),
                    None => eprintln!("downloading: {} bytes", progress.read),
                })
                .await
                .with_context(|| format!("DownloadModel {model_id} failed"))?;
            serde_json::to_value(model)?
        }
    };
    Ok(output)
}
