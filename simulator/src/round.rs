//! Fleet events and per-round aggregation of device tick reports.
//!
//! Round `N` is the tick boundary at `origin + N * interval`, shared by
//! every device. A device that was still busy when a boundary passed
//! reports that round as skipped, so every round is eventually closed.

use crate::model::TelemetryReading;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Delivered,
    Failed(String),
    /// The previous tick was still running when this boundary passed.
    Skipped,
}

/// Lifecycle notifications published to `Fleet::subscribe` receivers.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    Delivered {
        device_id: String,
        round: u64,
        reading: TelemetryReading,
    },
    DeliveryFailed {
        device_id: String,
        round: u64,
        error: String,
    },
    /// Every active device reported for `round`; outcomes are in start order.
    RoundCompleted {
        round: u64,
        outcomes: Vec<(String, TickOutcome)>,
    },
    Stopped,
}

#[derive(Debug)]
pub(crate) struct TickReport {
    pub index: usize,
    pub round: u64,
    pub outcome: TickOutcome,
}

/// Collects per-device tick reports and logs each round once all active
/// devices have reported for it.
pub(crate) async fn aggregate(
    mut reports: mpsc::UnboundedReceiver<TickReport>,
    devices: Vec<String>,
    events: broadcast::Sender<FleetEvent>,
) {
    let mut pending: BTreeMap<u64, Vec<Option<TickOutcome>>> = BTreeMap::new();
    let mut latest = vec![0u64; devices.len()];

    while let Some(report) = reports.recv().await {
        latest[report.index] = latest[report.index].max(report.round);
        pending
            .entry(report.round)
            .or_insert_with(|| vec![None; devices.len()])[report.index] = Some(report.outcome);

        // A device that already reported a later round will never fill an
        // earlier slot
        let closable: Vec<u64> = pending
            .iter()
            .filter(|(round, slots)| {
                slots
                    .iter()
                    .zip(&latest)
                    .all(|(slot, seen)| slot.is_some() || seen > *round)
            })
            .map(|(round, _)| *round)
            .collect();

        for round in closable {
            let Some(slots) = pending.remove(&round) else {
                continue;
            };
            complete(&devices, &events, round, slots);
        }
    }

    for (round, slots) in pending {
        debug!(
            "Round {} cut short by shutdown ({}/{} reported)",
            round,
            slots.iter().filter(|s| s.is_some()).count(),
            devices.len()
        );
    }
}

fn complete(
    devices: &[String],
    events: &broadcast::Sender<FleetEvent>,
    round: u64,
    slots: Vec<Option<TickOutcome>>,
) {
    let outcomes: Vec<(String, TickOutcome)> = devices
        .iter()
        .cloned()
        .zip(slots.into_iter().map(|s| s.unwrap_or(TickOutcome::Skipped)))
        .collect();
    let delivered = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == TickOutcome::Delivered)
        .count();

    info!(
        "Round {} complete: {}/{} delivered",
        round,
        delivered,
        devices.len()
    );
    let _ = events.send(FleetEvent::RoundCompleted { round, outcomes });
}
