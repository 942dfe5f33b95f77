//! CLI entry point for the bundlex tool.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use bundlex_core::{
    CallScope, ClientConfig, DownloadRequest, ExchangeClient, ExtractionPolicy, ProcessStatus,
    UploadOptions, UploadSpec,
};
use clap::Parser;
use serde_json::Value;
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command, field_map};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(command = ?args.command, "CLI arguments parsed");

    let mut builder = ClientConfig::builder(&args.token, &args.project_id)
        .http_timeout_secs(args.timeout)
        .max_retries(i64::from(args.max_retries));
    if let Some(base_url) = &args.base_url {
        builder = builder.base_url(base_url);
    }
    let config = builder.build().context("invalid client configuration")?;
    info!(project_id = config.project_id(), base_url = %config.base_url(), "bundlex starting");

    let client = ExchangeClient::new(config)?;

    // Ctrl-C cancels every in-flight request, poll and extraction.
    let scope = CallScope::new();
    let interrupt = scope.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            interrupt.cancel();
        }
    });

    match args.command {
        Command::Upload {
            file,
            lang_iso,
            fields,
            poll,
        } => {
            let mut spec = UploadSpec::from_file(file);
            if let Some(lang_iso) = lang_iso {
                spec = spec.field("lang_iso", lang_iso);
            }
            for (key, value) in fields {
                spec = spec.field(key, value);
            }
            let options = UploadOptions {
                poll_budget: (poll > 0).then(|| Duration::from_secs(poll)),
            };

            let process = client.upload(&scope, &spec, options).await?;
            println!("process_id={}", process.id);
            println!("status={}", process.status);
            if process.status == ProcessStatus::Failed {
                bail!("import process {} failed", process.id);
            }
        }
        Command::Download {
            dest,
            format,
            fields,
            async_export,
            poll,
            allow_symlinks,
            preserve_mtime,
        } => {
            let mut params = field_map(&fields);
            params.insert("format".to_string(), Value::String(format));
            let mut request = DownloadRequest::new(params);
            if async_export {
                request = request.asynchronous(Duration::from_secs(poll));
            }
            let policy = ExtractionPolicy {
                allow_symlinks,
                preserve_mtime,
                ..ExtractionPolicy::default()
            };

            let outcome = client.download(&scope, &request, &dest, &policy).await?;
            let report = outcome.report;
            info!(
                files = report.files,
                directories = report.directories,
                symlinks = report.symlinks,
                skipped = report.skipped,
                bytes = report.bytes,
                "Bundle extracted"
            );
            let mut shown = outcome.bundle_url;
            shown.set_query(None);
            println!("bundle_url={shown}");
            println!("files={}", report.files);
            println!("bytes={}", report.bytes);
        }
    }

    Ok(())
}
