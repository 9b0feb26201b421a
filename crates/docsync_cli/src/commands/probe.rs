//! Probe command implementation.

use docsync_engine::{ConnectivityProbe, HttpRemote, ReqwestClient, StaticAuth};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs the probe command.
pub async fn run(url: &str, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let client = ReqwestClient::new(timeout)?;
    let remote = HttpRemote::new(url, client, Arc::new(StaticAuth::guest()));

    let started = Instant::now();
    let online = tokio::time::timeout(timeout, remote.check())
        .await
        .unwrap_or(false);
    let elapsed = started.elapsed();

    if online {
        println!("{} is reachable ({} ms)", remote.base_url(), elapsed.as_millis());
        Ok(())
    } else {
        let reason = remote
            .last_error()
            .unwrap_or_else(|| "no response".to_string());
        Err(format!("{} is unreachable: {}", remote.base_url(), reason).into())
    }
}
