//! Sync command implementation.

use super::open_store;
use docsync_engine::{
    BatchReport, DrainReport, HttpRemote, ReqwestClient, StaticAuth, SyncConfig, SyncSession,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// What the sync command did.
#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncResultOutput {
    /// The pending queue was drained.
    Drain {
        /// Connection state afterwards.
        connection: String,
        /// Drain summary.
        report: DrainReport,
    },
    /// A workspace was batch-synced.
    Batch {
        /// Connection state afterwards.
        connection: String,
        /// Batch summary.
        report: BatchReport,
    },
}

/// Runs the sync command.
pub async fn run(
    path: &Path,
    url: &str,
    token: Option<String>,
    workspace: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if token.is_none() {
        return Err("A token is required for sync (--token or DOCSYNC_TOKEN)".into());
    }
    let config = SyncConfig::default();
    let store = open_store(path).await?;
    let auth = Arc::new(StaticAuth::new(token));
    let remote = Arc::new(HttpRemote::new(
        url,
        ReqwestClient::new(config.probe_timeout)?,
        auth.clone(),
    ));
    let session = SyncSession::new(config, store, remote.clone(), remote, auth);

    let loaded = session.load().await?;
    info!(pending = loaded.pending, mappings = loaded.mappings, "data directory loaded");
    let state = session.connect().await?;
    if !state.is_online() {
        return Err(format!("could not connect to {url} (state {state})").into());
    }

    let output = match workspace {
        Some(id) => SyncResultOutput::Batch {
            report: session.batch_sync(id).await?,
            connection: session.connection().state().to_string(),
        },
        None => SyncResultOutput::Drain {
            report: session.force_sync().await?,
            connection: session.connection().state().to_string(),
        },
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&output)?),
        _ => print_text_output(&output),
    }

    Ok(())
}

fn print_text_output(output: &SyncResultOutput) {
    match output {
        SyncResultOutput::Drain { connection, report } => {
            println!("Connection: {connection}");
            println!("Attempted:  {}", report.attempted);
            println!("Synced:     {}", report.synced);
            println!("Retrying:   {}", report.retrying);
            println!("Failed:     {}", report.failed);
            println!("Conflicts:  {}", report.conflicts);
            if let Some(reason) = &report.stopped {
                println!("Stopped:    {reason}");
            }
        }
        SyncResultOutput::Batch { connection, report } => {
            println!("Connection: {connection}");
            println!("Workspace:  {}", report.workspace_id);
            println!("Requests:   {}", report.chunks);
            println!("Purged:     {}", report.purged);
            for result in &report.results {
                println!(
                    "  {}  {:?}{}",
                    result.client_id,
                    result.status,
                    result
                        .error
                        .as_deref()
                        .map(|e| format!("  {e}"))
                        .unwrap_or_default()
                );
            }
        }
    }
}
