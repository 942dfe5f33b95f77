//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use bundlex_core::api::DEFAULT_MAX_RETRIES;

/// Upload translation files and download exported bundles.
///
/// Credentials are read from flags or from `BUNDLEX_API_TOKEN` and
/// `BUNDLEX_PROJECT_ID`.
#[derive(Parser, Debug)]
#[command(name = "bundlex")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// API token
    #[arg(long, env = "BUNDLEX_API_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Project identifier
    #[arg(long, env = "BUNDLEX_PROJECT_ID")]
    pub project_id: String,

    /// Override the API base URL
    #[arg(long, env = "BUNDLEX_BASE_URL")]
    pub base_url: Option<String>,

    /// HTTP timeout in seconds (0 disables)
    #[arg(long, default_value_t = 120, allow_negative_numbers = true)]
    pub timeout: i64,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Operations.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload one file
    Upload {
        /// File to upload; its path is sent as the remote file name
        file: PathBuf,

        /// Language of the file
        #[arg(long)]
        lang_iso: Option<String>,

        /// Extra request field as key=value (value parsed as JSON when possible)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, Value)>,

        /// Seconds to wait for the import to finish (0 returns immediately)
        #[arg(long, default_value_t = 120)]
        poll: u64,
    },

    /// Export a bundle and extract it
    Download {
        /// Directory to extract into
        #[arg(long, default_value = ".")]
        dest: PathBuf,

        /// Export file format
        #[arg(long, default_value = "json")]
        format: String,

        /// Extra request field as key=value (value parsed as JSON when possible)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, Value)>,

        /// Use the asynchronous export flow, polling for up to --poll seconds
        #[arg(long = "async")]
        async_export: bool,

        /// Seconds to wait for an asynchronous export
        #[arg(long, default_value_t = 120)]
        poll: u64,

        /// Create symlink entries from the archive
        #[arg(long)]
        allow_symlinks: bool,

        /// Keep modification times from the archive
        #[arg(long)]
        preserve_mtime: bool,
    },
}

/// Parses `key=value`; the value is JSON if it parses as JSON, else a string.
fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Collects parsed fields into a request map; later keys win.
pub fn field_map(fields: &[(String, Value)]) -> Map<String, Value> {
    fields.iter().cloned().collect()
}
