use std::sync::LazyLock;

use tokio::sync::broadcast;
use volley_common::{Signal, internal, logging, tracing};
use volley_dispatch::{CampaignSummary, DispatchEngine, DispatchError};

use crate::{config::Volley, simulation::Simulation};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

fn report(summary: &CampaignSummary) {
    internal!(
        level = INFO,
        "Campaign {} ({} on {}): {} sent, {} failed, {} pending, {} retries, success rate {:.1}%{}",
        summary.campaign_id,
        summary.owner,
        summary.channel,
        summary.progress.success,
        summary.progress.failed,
        summary.progress.pending,
        summary.progress.retried,
        summary.success_rate() * 100.0,
        summary
            .last_error
            .as_ref()
            .map_or_else(String::new, |error| format!(", last error: {error}"))
    );
}

/// Dispatch every seeded campaign and wait for them to finish
///
/// # Errors
///
/// If a campaign cannot be started
pub async fn run_campaigns(
    engine: &DispatchEngine,
    simulation: &Simulation,
) -> Result<Vec<CampaignSummary>, DispatchError> {
    let handles = simulation
        .campaign_ids
        .iter()
        .map(|id| engine.spawn_campaign(*id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut summaries = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(Ok(summary)) => {
                report(&summary);
                summaries.push(summary);
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Campaign failed"),
            Err(e) => tracing::error!(error = %e, "Campaign task panicked or was cancelled"),
        }
    }

    Ok(summaries)
}

impl Volley {
    /// Run this controller, and everything it controls
    ///
    /// # Errors
    ///
    /// This function will return an error if the configuration is invalid, the
    /// metrics exporter fails to initialise, or a campaign cannot be started.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        self.validate()?;
        volley_metrics::init_metrics(&self.metrics)?;

        internal!("Controller running");

        let simulation = Simulation::seed(self.simulation)?;
        let engine = DispatchEngine::new(self.dispatch, simulation.collaborators())?;

        internal!(
            level = INFO,
            "Dispatching {} simulated campaign(s)",
            simulation.campaign_ids.len()
        );

        let ret = tokio::select! {
            r = engine.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = run_campaigns(&engine, &simulation) => {
                r.map(|summaries| {
                    internal!(level = INFO, "All {} campaign(s) finished", summaries.len());
                }).map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");
        engine.stop_all().await;

        let stats = engine.stats();
        internal!(
            level = INFO,
            "Engine totals: {} provider calls, {} sent, {} failed, {} retries",
            stats.processed,
            stats.success,
            stats.failed,
            stats.retried
        );

        ret
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use volley_common::{Channel, MessageStatus};

    use super::*;
    use crate::simulation::{ProviderBehaviour, SimulatedCampaign, SimulationConfig};

    fn campaign(owner: &str, recipients: usize) -> SimulatedCampaign {
        SimulatedCampaign {
            owner: owner.to_string(),
            channel: Channel::Whatsapp,
            template: "welcome".to_string(),
            credentials: "main".to_string(),
            recipients,
            quota: 1_000,
            bonus_quota: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_campaigns_complete() {
        let simulation = Simulation::seed(SimulationConfig {
            provider: ProviderBehaviour {
                latency_ms: 10,
                transient_rate: 0.0,
                permanent_rate: 0.0,
            },
            campaigns: vec![campaign("acme", 25), campaign("globex", 10)],
        })
        .unwrap();
        let engine = DispatchEngine::new(Volley::default().dispatch, simulation.collaborators())
            .unwrap();

        let summaries = run_campaigns(&engine, &simulation).await.unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].progress.success, 25);
        assert_eq!(summaries[1].progress.success, 10);
        for id in &simulation.campaign_ids {
            assert_eq!(
                simulation.messages.count_with_status(*id, MessageStatus::Pending),
                0
            );
        }
        assert_eq!(engine.stats().success, 35);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_stops_campaigns() {
        let simulation = Simulation::seed(SimulationConfig {
            provider: ProviderBehaviour {
                latency_ms: 1_000,
                transient_rate: 0.0,
                permanent_rate: 0.0,
            },
            campaigns: vec![campaign("acme", 500)],
        })
        .unwrap();
        let engine = DispatchEngine::new(Volley::default().dispatch, simulation.collaborators())
            .unwrap();
        let (sender, receiver) = broadcast::channel(4);

        let serving = tokio::spawn({
            let engine = engine.clone();
            async move { engine.serve(receiver).await }
        });
        let id = simulation.campaign_ids[0];
        let handle = engine.spawn_campaign(id).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        sender.send(Signal::Shutdown).unwrap();
        serving.await.unwrap().unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert!(summary.stopped);
        assert!(summary.progress.pending > 0);
        assert!(engine.running_campaigns().is_empty());
    }
}
