//! scrubdrop entry point.
//!
//! Selects local files, scrubs them, and uploads them one at a time to a
//! Girder-style server. Chunk and token failures are retried with a bounded
//! number of automatic resume/restart attempts.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use scrubdrop_client::GirderClient;
use scrubdrop_pipeline::{TransformEvent, TransformPipeline, ZipCodec};
use scrubdrop_protocol::{ParentRef, ParentType};
use scrubdrop_scrub::ScrubberChain;
use scrubdrop_uploader::{
    ExtraParams, MemoryStore, Recovery, RemoteStore, SessionConfig, UploadController,
    UploadEvent, UploadSummary,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ClientConfig;

/// Scrub identifying metadata from files, then upload them.
#[derive(Parser, Debug)]
#[command(name = "scrubdrop", version, about)]
struct Args {
    /// Files to upload (directories are rejected)
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Id of the folder, item or file receiving the upload
    #[arg(long, value_name = "ID")]
    parent_id: String,

    /// Parent type: folder, item, or file (replace contents)
    #[arg(long, value_name = "TYPE", default_value = "folder")]
    parent_type: ParentType,

    /// API root, overrides the configuration file
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Authentication token, overrides the configuration file
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Chunk size in bytes
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// DICOM attribute to blank (keyword or GGGGEEEE); repeatable
    #[arg(long = "tag", value_name = "NAME")]
    tags: Vec<String>,

    /// Remove EXIF metadata from JPEG and PNG images
    #[arg(long)]
    strip_exif: Option<bool>,

    /// Extra upload parameter; repeatable
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Upload into an in-memory store instead of the server
    #[arg(long)]
    dry_run: bool,

    /// Configuration file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

/// Applies command-line overrides on top of the file configuration.
fn merge(mut config: ClientConfig, args: &Args) -> ClientConfig {
    if let Some(url) = &args.api_url {
        config.api_url = url.clone();
    }
    if let Some(token) = &args.token {
        config.token = token.clone();
    }
    if let Some(size) = args.chunk_size {
        config.chunk_size = size;
    }
    if !args.tags.is_empty() {
        config.scrub_tags = args.tags.clone();
    }
    if let Some(strip) = args.strip_exif {
        config.strip_exif = strip;
    }
    config
}

fn extra_params(params: &[(String, String)]) -> ExtraParams {
    if params.is_empty() {
        return ExtraParams::None;
    }
    let map: Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    ExtraParams::Static(map)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => ClientConfig::load().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load config, using defaults");
            ClientConfig::default()
        }),
    };
    let config = merge(file_config, &args);

    let scrubber = ScrubberChain::from_settings(&config.scrub_tags, config.strip_exif)
        .context("invalid scrub tag")?;
    let pipeline = TransformPipeline::new(scrubber, ZipCodec);

    let mut parent = ParentRef::new(args.parent_id.clone(), args.parent_type);
    let remote: Arc<dyn RemoteStore> = if args.dry_run {
        let store = MemoryStore::new();
        if parent.is_existing_file() {
            parent.id = store.insert_file(&parent.id, "dry-run", Default::default());
        }
        info!("dry run: uploading into memory");
        Arc::new(store)
    } else {
        let token = Some(config.token.as_str()).filter(|t| !t.is_empty());
        Arc::new(GirderClient::new(&config.api_url, token)?)
    };

    let mut session_config = SessionConfig::new(Some(parent));
    session_config.chunk_size = config.chunk_size;
    session_config.extra_params = extra_params(&args.params);

    let mut ctl = UploadController::new(session_config, remote, pipeline);
    let events = ctl.take_events().context("event receiver already taken")?;
    let reporter = tokio::spawn(report(events));

    let cancel = ctl.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling upload");
            cancel.cancel();
        }
    });

    let outcome = run(&mut ctl, &args.paths, config.auto_resume_attempts).await;
    if outcome.is_err() {
        ctl.close().await;
    }

    // Closing the channel lets the reporter drain and exit.
    drop(ctl);
    let _ = reporter.await;

    let summary = outcome?;
    for file in &summary.files {
        println!(
            "{}\t{}\t{}",
            file.name,
            file.remote_id.as_deref().unwrap_or("-"),
            file.size
        );
    }
    Ok(())
}

/// Selects, transforms and uploads, retrying recoverable failures.
async fn run(
    ctl: &mut UploadController,
    paths: &[PathBuf],
    max_attempts: u32,
) -> anyhow::Result<UploadSummary> {
    let selected = ctl.select_paths(paths).await?;
    info!(files = selected, "files selected");

    let mut result = ctl.start().await;
    let mut attempts = 0;
    loop {
        let err = match result {
            Ok(summary) => return Ok(summary),
            Err(e) => e,
        };
        let Some(recovery) = err.recovery() else {
            return Err(err.into());
        };
        if attempts >= max_attempts {
            return Err(anyhow::Error::new(err).context("giving up after retries"));
        }
        attempts += 1;

        warn!(attempt = attempts, %recovery, error = %err, "retrying");
        tokio::time::sleep(Duration::from_millis(500 * u64::from(attempts))).await;
        result = match recovery {
            Recovery::Resume => ctl.resume().await,
            Recovery::Restart => ctl.restart().await,
        };
    }
}

/// Logs controller events until the channel closes.
async fn report(mut events: mpsc::UnboundedReceiver<UploadEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::FilesChanged(files) => debug!(files = files.len(), "selection updated"),
            UploadEvent::UploadStarted {
                session_id,
                total_files,
                total_size,
            } => info!(session = %session_id, total_files, total_size, "upload started"),
            UploadEvent::Transform(TransformEvent::Progress {
                file,
                phase,
                percent,
                ..
            }) => debug!(file = %file, %phase, percent, "transforming"),
            UploadEvent::Transform(TransformEvent::CodecFailed { file, error }) => {
                warn!(file = %file, error = %error, "archive left unmodified")
            }
            UploadEvent::Transform(TransformEvent::Finished {
                file,
                changed,
                size,
            }) => info!(file = %file, changed, size, "scrubbed"),
            UploadEvent::Progress(p) => info!(
                file = %p.current_file,
                index = p.current_index + 1,
                total = p.total_files,
                current = %format!("{:.1}%", p.current_percentage()),
                overall = %format!("{:.1}%", p.overall_percentage()),
                bytes_per_second = p.bytes_per_second as u64,
                eta_seconds = ?p.eta_seconds,
                "uploading"
            ),
            UploadEvent::ItemComplete(file) => info!(
                file = %file.name,
                id = file.remote_id.as_deref().unwrap_or("-"),
                size = file.size,
                "file uploaded"
            ),
            UploadEvent::UploadFinished { files, total_size } => {
                info!(files = files.len(), total_size, "upload finished")
            }
            UploadEvent::Error {
                file,
                message,
                recovery,
            } => warn!(file = %file, error = %message, %recovery, "upload interrupted"),
        }
    }
}
