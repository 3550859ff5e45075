//! Exponential-backoff reconnection loop driving the transport.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::ReconnectConfig;
use crate::transport::{NetworkEvent, NetworkManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionState {
    Idle,
    Reconnecting { attempt: u32 },
    Connected,
    Failed,
}

/// Drives repeated `connect_to` attempts against one transport, publishing
/// progress on a watch channel. At most one loop runs per manager.
pub struct ReconnectionManager<N: NetworkManager> {
    transport: Arc<N>,
    config: ReconnectConfig,
    state_tx: watch::Sender<ReconnectionState>,
    job: Mutex<Option<JoinHandle<()>>>,
    jitter: Arc<Mutex<StdRng>>,
}

impl<N: NetworkManager> ReconnectionManager<N> {
    pub fn new(transport: Arc<N>, config: ReconnectConfig) -> Self {
        Self::with_rng(transport, config, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(transport: Arc<N>, config: ReconnectConfig, seed: u64) -> Self {
        Self::with_rng(transport, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(transport: Arc<N>, config: ReconnectConfig, rng: StdRng) -> Self {
        let (state_tx, _) = watch::channel(ReconnectionState::Idle);
        Self {
            transport,
            config,
            state_tx,
            job: Mutex::new(None),
            jitter: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn state(&self) -> watch::Receiver<ReconnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ReconnectionState {
        *self.state_tx.borrow()
    }

    /// Starts the retry loop toward the last known `(host, port)`. A no-op
    /// while a loop is already active.
    pub fn start_reconnecting(&self, host: &str, port: u16) {
        let mut job = self.job.lock();
        if job.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let state_tx = self.state_tx.clone();
        let jitter = Arc::clone(&self.jitter);
        let host = host.to_string();
        *job = Some(tokio::spawn(async move {
            for attempt in 1..=config.max_retries {
                let _ = state_tx.send(ReconnectionState::Reconnecting { attempt });
                sleep(delay_for(&config, &jitter, attempt)).await;
                tracing::debug!("reconnection attempt {attempt} to {host}:{port}");
                if try_connect(&*transport, &host, port, config.connect_timeout).await {
                    tracing::info!("reconnected to {host}:{port} on attempt {attempt}");
                    let _ = state_tx.send(ReconnectionState::Connected);
                    return;
                }
            }
            tracing::warn!(
                "giving up on {host}:{port} after {} attempts",
                config.max_retries
            );
            let _ = state_tx.send(ReconnectionState::Failed);
        }));
    }

    /// Cancels any active loop and returns to `Idle`.
    pub fn stop_reconnecting(&self) {
        if let Some(task) = self.job.lock().take() {
            task.abort();
        }
        let _ = self.state_tx.send(ReconnectionState::Idle);
    }

    /// Cancels the loop without touching the published state.
    pub fn shutdown(&self) {
        if let Some(task) = self.job.lock().take() {
            task.abort();
        }
    }

    /// Backoff before `attempt` (1-based): `min(base·2^(attempt-1), max)`
    /// plus up to 500 ms of jitter so peers don't retry in lockstep.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        delay_for(&self.config, &self.jitter, attempt)
    }
}

fn delay_for(config: &ReconnectConfig, jitter: &Mutex<StdRng>, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let exponential = config
        .base_delay
        .saturating_mul(1u32 << shift)
        .min(config.max_delay);
    exponential + Duration::from_millis(jitter.lock().gen_range(0..=500))
}

/// One attempt: subscribe, dial, then wait for the verdict with a deadline.
async fn try_connect<N: NetworkManager>(
    transport: &N,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> bool {
    let mut events = transport.events();
    transport.connect_to(host, port);
    let verdict = async {
        loop {
            match events.recv().await {
                Ok(NetworkEvent::ClientConnected(_)) => return true,
                Ok(NetworkEvent::Error(_)) => return false,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };
    timeout(connect_timeout, verdict).await.unwrap_or(false)
}
