use anyhow::{Context, Result};
use rollcalld::{Config, Service};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    let report_interval = Duration::from_millis(
        std::env::var("ROLLCALL_REPORT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000),
    );

    if config.stream_url.is_empty() && !config.simulation {
        anyhow::bail!("ROLLCALL_STREAM_URL is not set (or set ROLLCALL_SIMULATION=1)");
    }

    let service = Service::new(config).context("service startup failed")?;
    service.start_stream().await.context("stream startup failed")?;

    tracing::info!("rollcalld ready");

    let mut ticker = tokio::time::interval(report_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match service.identify().await {
                    Ok(report) => {
                        // One JSON document per line for downstream collectors.
                        match serde_json::to_string(&report) {
                            Ok(line) => println!("{line}"),
                            Err(err) => tracing::error!(error = %err, "report serialization failed"),
                        }
                    }
                    Err(err) => tracing::debug!(error = %err, "identify pass skipped"),
                }
            }
        }
    }

    tracing::info!("rollcalld shutting down");
    if let Err(err) = service.stop_stream().await {
        tracing::debug!(error = %err, "stream already stopped");
    }

    Ok(())
}
