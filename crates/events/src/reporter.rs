//! Log sink for fleet events.
//!
//! [`EventReporter`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! and writes one structured log line per event. Alerts are logged at
//! `warn`, everything else at `info`. It runs as a background task until
//! the bus is dropped or the cancellation token fires.

use std::collections::HashMap;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::{FleetEvent, FleetEventKind};

/// Background service that reports fleet events.
pub struct EventReporter;

impl EventReporter {
    /// Run the reporting loop. Returns per-kind counts when it exits.
    pub async fn run(
        mut receiver: broadcast::Receiver<FleetEvent>,
        cancel: CancellationToken,
    ) -> HashMap<FleetEventKind, u64> {
        let mut counts: HashMap<FleetEventKind, u64> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Event reporter cancelled");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        *counts.entry(event.kind).or_default() += 1;
                        Self::report(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event reporter lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("Event bus closed, reporter shutting down");
                        break;
                    }
                },
            }
        }
        counts
    }

    fn report(event: &FleetEvent) {
        let slot = event.slot.map(|s| s.to_string()).unwrap_or_default();
        let code = event.code.as_deref().unwrap_or("");
        let item = event.item.as_deref().unwrap_or("");
        if event.kind.is_alert() {
            tracing::warn!(
                event = event.kind.as_str(),
                slot_id = %slot,
                code,
                item,
                payload = %event.payload,
                "Fleet alert"
            );
        } else {
            tracing::info!(
                event = event.kind.as_str(),
                slot_id = %slot,
                code,
                item,
                payload = %event.payload,
                "Fleet event"
            );
        }
    }
}
