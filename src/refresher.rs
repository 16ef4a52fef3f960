//! Periodic APY refresh.
//!
//! Re-reads every farm from the gateway on a fixed interval and hands the
//! result to the registry owner over a channel. The loop is cancellable and
//! can be restarted at any time; a failed round is logged and skipped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::{RefreshConfig, RetryConfig};
use crate::domain::Farm;
use crate::error::GatewayError;
use crate::gateway::{call_with_retry, ChainGateway, ReadOp};

pub struct ApyRefresher {
    gateway: Arc<dyn ChainGateway>,
    interval: Duration,
    retry: RetryConfig,
}

impl ApyRefresher {
    pub fn new(gateway: Arc<dyn ChainGateway>, config: &RefreshConfig, retry: RetryConfig) -> Self {
        Self {
            gateway,
            interval: config.interval(),
            retry,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One round: the full farm list as the chain reports it
    pub async fn refresh_once(&self) -> Result<Vec<Farm>, GatewayError> {
        call_with_retry(self.gateway.as_ref(), &ReadOp::ListFarms, &self.retry)
            .await?
            .into_farms()
    }

    /// Refresh until cancelled or until the receiving side goes away.
    /// The first round runs immediately.
    pub async fn run(self, updates: mpsc::Sender<Vec<Farm>>, cancel: CancelSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "APY refresher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("APY refresher cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match self.refresh_once().await {
                        Ok(farms) => {
                            debug!(farms = farms.len(), "APY refresh round complete");
                            if updates.send(farms).await.is_err() {
                                info!("APY update receiver dropped, stopping refresher");
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "APY refresh round failed"),
                    }
                }
            }
        }
    }

    pub fn spawn(self, updates: mpsc::Sender<Vec<Farm>>, cancel: CancelSignal) -> JoinHandle<()> {
        tokio::spawn(self.run(updates, cancel))
    }
}
