//! Fleet scheduler: one independent cadence driver per device session.

use crate::config::{FleetConfig, RetryPolicy};
use crate::errors::{DeliveryError, Error, Result};
use crate::metrics::{
    DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL, DELIVERY_LATENCY_SECONDS, SESSIONS_ACTIVE,
    SESSIONS_DEGRADED, TICKS_SKIPPED_TOTAL,
};
use crate::model::TelemetryReading;
use crate::round::{aggregate, FleetEvent, TickOutcome, TickReport};
use crate::session::{DeviceSession, SessionState};
use crate::telemetry::{generate_with, CadenceClock};
use crate::transport::{Connector, Link, Message};
use futures::future::join_all;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

pub struct Fleet {
    active: Vec<String>,
    excluded: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<FleetEvent>,
    stopped: OnceCell<()>,
}

impl Fleet {
    /// Opens every device's session, then starts a cadence driver for each
    /// one that connected. Devices that fail to connect are excluded; the
    /// fleet only fails if none connect.
    pub async fn start<C: Connector>(config: FleetConfig, connector: &C) -> Result<Fleet> {
        config.validate()?;
        let FleetConfig { devices, options } = config;
        let attempted = devices.len();

        info!(
            "Opening {} device sessions via {}",
            attempted,
            connector.name()
        );

        // Opens run concurrently; results keep configuration order
        let opened = join_all(devices.into_iter().map(|device| {
            let mut session = DeviceSession::new(device, options.deliver_timeout);
            let open_timeout = options.open_timeout;
            async move {
                let result = session.open(connector, open_timeout).await;
                (session, result)
            }
        }))
        .await;

        let mut sessions = Vec::with_capacity(attempted);
        let mut excluded = Vec::new();
        for (session, result) in opened {
            match result {
                Ok(()) => sessions.push(session),
                Err(e) => {
                    error!(
                        "[{}] Failed to connect, excluding from fleet: {}",
                        session.device().id,
                        e
                    );
                    excluded.push(session.device().id.clone());
                }
            }
        }

        if sessions.is_empty() {
            return Err(Error::NoViableDevices(attempted));
        }

        let active: Vec<String> = sessions.iter().map(|s| s.device().id.clone()).collect();
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        // Shared origin: every device ticks on the same boundary
        let clock = CadenceClock::start();

        SESSIONS_ACTIVE.add(sessions.len() as i64);
        let drivers: Vec<JoinHandle<()>> = sessions
            .into_iter()
            .enumerate()
            .map(|(index, session)| {
                let driver = Driver {
                    index,
                    session,
                    clock,
                    interval: options.interval,
                    retry: options.retry,
                    cancel: cancel.clone(),
                    reports: reports_tx.clone(),
                    events: events.clone(),
                };
                tokio::spawn(driver.run())
            })
            .collect();
        drop(reports_tx);

        let aggregator = tokio::spawn(aggregate(reports_rx, active.clone(), events.clone()));

        info!(
            "Sending telemetry every {:?} for {} devices ({} excluded). Press Ctrl+C to stop.",
            options.interval,
            active.len(),
            excluded.len()
        );

        Ok(Fleet {
            active,
            excluded,
            interval: options.interval,
            cancel,
            drivers: Mutex::new(drivers),
            aggregator: Mutex::new(Some(aggregator)),
            events,
            stopped: OnceCell::new(),
        })
    }

    /// Device ids being driven, in start order.
    pub fn active_devices(&self) -> &[String] {
        &self.active
    }

    /// Devices whose session failed to open.
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.initialized()
    }

    /// Halts every driver after its current tick and waits until each
    /// session is closed. Concurrent and repeated calls share one shutdown.
    pub async fn stop(&self) {
        self.stopped
            .get_or_init(|| async {
                info!("Stopping {} cadence drivers", self.active.len());
                self.cancel.cancel();

                let drivers = std::mem::take(&mut *lock(&self.drivers));
                for result in join_all(drivers).await {
                    if let Err(e) = result {
                        error!("Cadence driver failed: {}", e);
                    }
                }

                let aggregator = lock(&self.aggregator).take();
                if let Some(handle) = aggregator {
                    if let Err(e) = handle.await {
                        error!("Round aggregator failed: {}", e);
                    }
                }

                let _ = self.events.send(FleetEvent::Stopped);
                info!("Telemetry stopped.");
            })
            .await;
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        // Drivers close their own sessions on the way out
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns one session for its whole life and ticks it on the fleet cadence.
struct Driver<L: Link> {
    index: usize,
    session: DeviceSession<L>,
    clock: CadenceClock,
    interval: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<TickReport>,
    events: broadcast::Sender<FleetEvent>,
}

impl<L: Link> Driver<L> {
    async fn run(mut self) {
        // Round N fires at origin + N * interval on every device
        let mut round: u64 = 1;
        let mut deadline = self.clock.origin() + self.interval;
        let mut ticks = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(deadline) => {}
            }
            self.tick(round).await;
            ticks += 1;
            if self.cancel.is_cancelled() {
                break;
            }

            round += 1;
            deadline += self.interval;
            // Boundaries that passed while the tick ran are dropped, not fired late
            let now = Instant::now();
            while deadline < now {
                self.report(round, TickOutcome::Skipped);
                round += 1;
                deadline += self.interval;
            }
        }

        if self.session.state() == SessionState::Degraded {
            SESSIONS_DEGRADED.dec();
        }
        self.session.close().await;
        SESSIONS_ACTIVE.dec();
        debug!(
            "[{}] Cadence driver stopped after {} ticks",
            self.session.device().id,
            ticks
        );
    }

    fn report(&self, round: u64, outcome: TickOutcome) {
        if outcome == TickOutcome::Skipped {
            TICKS_SKIPPED_TOTAL
                .with_label_values(&[self.session.device().id.as_str()])
                .inc();
            warn!(
                "[{}] Skipped round {}, previous tick still running",
                self.session.device().id,
                round
            );
        }
        let _ = self.reports.send(TickReport {
            index: self.index,
            round,
            outcome,
        });
    }

    async fn tick(&mut self, round: u64) {
        let reading = generate_with(
            &mut rand::thread_rng(),
            self.session.device(),
            self.clock.now(),
        );
        let device_id = reading.device_id.clone();
        let was_degraded = self.session.state() == SessionState::Degraded;
        let started = Instant::now();

        let outcome = match self.deliver_with_retry(&reading).await {
            Ok(message) => {
                DELIVERIES_TOTAL.with_label_values(&[device_id.as_str()]).inc();
                DELIVERY_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
                info!("[{}] Sent → {}", device_id, message.body());
                let _ = self.events.send(FleetEvent::Delivered {
                    device_id: device_id.clone(),
                    round,
                    reading,
                });
                TickOutcome::Delivered
            }
            Err(e) => {
                DELIVERY_FAILURES_TOTAL.with_label_values(&[device_id.as_str()]).inc();
                warn!("[{}] Delivery failed on round {}: {}", device_id, round, e);
                let _ = self.events.send(FleetEvent::DeliveryFailed {
                    device_id: device_id.clone(),
                    round,
                    error: e.to_string(),
                });
                TickOutcome::Failed(e.to_string())
            }
        };

        match (was_degraded, self.session.state() == SessionState::Degraded) {
            (false, true) => SESSIONS_DEGRADED.inc(),
            (true, false) => {
                SESSIONS_DEGRADED.dec();
                info!("[{}] Recovered", device_id);
            }
            _ => {}
        }

        self.report(round, outcome);
    }

    async fn deliver_with_retry(
        &mut self,
        reading: &TelemetryReading,
    ) -> std::result::Result<Message, DeliveryError> {
        let mut attempt = 0;

        loop {
            match self.session.deliver(reading).await {
                Ok(message) => {
                    if attempt > 0 {
                        info!(
                            "[{}] Delivered after {} retries",
                            reading.device_id, attempt
                        );
                    }
                    return Ok(message);
                }
                Err(e) => {
                    if attempt >= self.retry.max_retries
                        || !e.is_retryable()
                        || self.cancel.is_cancelled()
                    {
                        return Err(e);
                    }

                    attempt += 1;
                    let backoff = self.retry.backoff(attempt);
                    debug!(
                        "[{}] Delivery failed (attempt {}/{}): {}. Retrying in {:?}...",
                        reading.device_id,
                        attempt,
                        self.retry.max_retries + 1,
                        e,
                        backoff
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
