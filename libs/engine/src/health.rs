//! Health supervisor
//!
//! One loop probes the `health_check` URL of every catalog step, staggering
//! probes evenly across the interval. A step that completed work recently
//! (observed via `step_completed` events on the hub) is recorded healthy
//! without a network call.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::event::EventHub;

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor timing knobs
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Full probe cycle length
    pub interval: Duration,

    /// A completion within this window counts as a passed probe
    pub success_window: Duration,

    /// Per-probe HTTP timeout
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            success_window: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Periodic liveness poller with success-window short-circuiting
pub struct HealthSupervisor {
    catalog: Arc<Catalog>,
    hub: Arc<EventHub>,
    client: reqwest::Client,
    config: HealthConfig,
    /// Step id to last observed completion time
    last_success: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl HealthSupervisor {
    /// Create a supervisor over the catalog and hub
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        hub: Arc<EventHub>,
        client: reqwest::Client,
        config: HealthConfig,
    ) -> Self {
        Self {
            catalog,
            hub,
            client,
            config,
            last_success: Mutex::new(HashMap::new()),
        }
    }

    /// Run the supervisor until the token is cancelled.
    ///
    /// Spawns the success tracker alongside the probe loop; both exit on
    /// cancellation or hub teardown.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(&self);
        let tracker_cancel = cancel.clone();
        tokio::spawn(async move {
            tracker.track_successes(tracker_cancel).await;
        });

        tokio::spawn(async move {
            self.probe_loop(cancel).await;
        })
    }

    /// Consume `step_completed` events into the `last_success` map
    async fn track_successes(&self, cancel: CancellationToken) {
        let mut consumer = self
            .hub
            .subscribe_types(BTreeSet::from(["step_completed".to_string()]));

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = consumer.recv() => {
                    let Some(event) = event else { break };
                    if let Some(step_id) = event.data.get("step_id").and_then(|v| v.as_str()) {
                        self.last_success
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .insert(step_id.to_string(), Utc::now());
                    }
                }
            }
        }
    }

    fn within_success_window(&self, step_id: &str) -> bool {
        let window = chrono::Duration::from_std(self.config.success_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.last_success
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(step_id)
            .is_some_and(|at| Utc::now() - *at <= window)
    }

    async fn probe_loop(&self, cancel: CancellationToken) {
        loop {
            let targets = match self.catalog.state().await {
                Ok((state, _)) => {
                    let mut targets: Vec<(String, String)> = state
                        .steps
                        .values()
                        .filter_map(|step| {
                            step.kind.http().and_then(|http| {
                                http.health_check
                                    .as_ref()
                                    .map(|url| (step.id.clone(), url.clone()))
                            })
                        })
                        .collect();
                    targets.sort();
                    targets
                }
                Err(error) => {
                    tracing::warn!(%error, "health supervisor could not read catalog");
                    Vec::new()
                }
            };

            // Spread probes evenly across the interval. Steps added
            // mid-cycle re-space on the next cycle.
            let slot = self.config.interval / targets.len().max(1) as u32;
            if targets.is_empty() {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(self.config.interval) => continue,
                }
            }

            for (step_id, url) in targets {
                self.probe_step(&step_id, &url).await;
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(slot) => {}
                }
            }
        }
    }

    /// Probe one step, short-circuiting on a recent completion
    async fn probe_step(&self, step_id: &str, url: &str) {
        let (healthy, error) = if self.within_success_window(step_id) {
            (true, None)
        } else {
            match self
                .client
                .get(url)
                .timeout(self.config.probe_timeout)
                .send()
                .await
            {
                Ok(response) if response.status().as_u16() < 400 => (true, None),
                Ok(response) => (false, Some(format!("{url} returned {}", response.status()))),
                Err(error) => (false, Some(format!("{url} unreachable: {error}"))),
            }
        };

        match self.catalog.set_health(step_id, healthy, error).await {
            Ok(true) => {
                tracing::info!(step = step_id, healthy, "step health changed");
            }
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(step = step_id, %error, "failed to record step health");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
