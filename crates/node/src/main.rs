use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use steward_infra::{InMemoryJournal, SupervisorConfig, System, SystemConfig};

/// Upper bound on how long startup may wait for the supervisors.
const READY_CEILING: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    steward_observability::init();

    let config = SystemConfig::from_env();
    let ready_within = ready_within(&config.supervisor);

    let system = System::boot(config, Arc::new(InMemoryJournal::new()));
    system
        .wait_ready(ready_within)
        .await
        .context("supervisors did not become ready")?;
    tracing::info!("steward node ready; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    system.shutdown();
    Ok(())
}

/// Worst case for registration plus list discovery, capped at [`READY_CEILING`].
fn ready_within(config: &SupervisorConfig) -> Duration {
    let retries = config.registration_retries;
    let registering = config
        .registration_timeout
        .saturating_mul(retries.saturating_add(1))
        .saturating_add(config.registration_backoff.cap.saturating_mul(retries));
    let discovering = config
        .list_poll_interval
        .saturating_add(config.registration_backoff.cap)
        .saturating_mul(retries.saturating_add(1));

    registering
        .saturating_add(discovering)
        .saturating_add(Duration::from_secs(1))
        .min(READY_CEILING)
}
