//! ---
//! lw_section: "05-relay-control"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Relay arbitration state machine and the meter node loop."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! The meter node: acquisition, arbitration and publication in one loop.
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use lw_acquire::{measure_window, AdcSource, Calibration, LoadChannel};
use lw_bus::{
    decode_environment, decode_mode, decode_relay_command, AuditPayload, Broker, BusClient,
    BusError, Command, RelayStatusPayload, Subscription, TelemetryPayload, Topic,
};
use lw_common::config::AppConfig;
use lw_common::timing::LoopTimingReporter;
use lw_common::{ChannelId, OperatingMode};
use lw_metrics::ControlMetrics;
use lw_rt::RateLimiter;

use crate::controller::{ChannelReadings, RelayController, TickOutcome, TickReadings};

/// The single cooperative loop that owns the relays.
///
/// One iteration covers exactly one measurement window: acquire the window,
/// drain the inbound queues, run the controller tick, mirror the applied
/// transitions into the signal chain, publish. Inbound commands therefore
/// see a worst-case service latency of one window.
///
/// The node never blocks on the bus. Publishing over a severed link loses
/// the message (delivery is at-most-once by design) while measurement and
/// safety enforcement carry on locally.
pub struct MeterNode {
    config: AppConfig,
    source: Box<dyn AdcSource>,
    channels: [LoadChannel; 2],
    controller: RelayController,
    mode: OperatingMode,
    temperature: Option<f64>,
    client: BusClient,
    relay_subscriptions: [Subscription; 2],
    mode_subscription: Subscription,
    environment_subscription: Subscription,
    metrics: Option<ControlMetrics>,
}

impl MeterNode {
    /// Wire a node onto the bus. `calibration` comes from the startup
    /// offset measurement against the same `source`.
    pub fn new(
        config: AppConfig,
        broker: &Broker,
        source: Box<dyn AdcSource>,
        calibration: Calibration,
        metrics: Option<ControlMetrics>,
    ) -> Self {
        let client = broker.client("meter-node");
        let relay_subscriptions = [
            client.subscribe(Topic::RelayControl(ChannelId::One)),
            client.subscribe(Topic::RelayControl(ChannelId::Two)),
        ];
        let mode_subscription = client.subscribe(Topic::Mode);
        let environment_subscription = client.subscribe(Topic::Environment);

        let channels = [
            LoadChannel::new(
                ChannelId::One,
                config.channels.load1.clone(),
                calibration.offsets(ChannelId::One),
            ),
            LoadChannel::new(
                ChannelId::Two,
                config.channels.load2.clone(),
                calibration.offsets(ChannelId::Two),
            ),
        ];
        let controller = RelayController::new(&config.control, &config.channels);
        let mode = config.control.initial_mode;

        Self {
            config,
            source,
            channels,
            controller,
            mode,
            temperature: None,
            client,
            relay_subscriptions,
            mode_subscription,
            environment_subscription,
            metrics,
        }
    }

    /// Run until the shutdown channel fires. One loop iteration per
    /// measurement window, paced by the window duration.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let period = self.config.acquisition.window_duration();
        let mut limiter = RateLimiter::new(period);
        let reporter = LoopTimingReporter::new(period);
        info!(
            window_ms = period.as_millis() as u64,
            mode = %self.mode,
            "meter node started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("meter node shutdown signal received");
                    break;
                }
                _ = limiter.tick() => {
                    reporter.record_tick();
                    self.run_window();
                }
            }
        }

        self.write_jitter_summary(&reporter);
        info!("meter node stopped");
        Ok(())
    }

    fn run_window(&mut self) {
        measure_window(
            self.source.as_mut(),
            &self.config.acquisition,
            &mut self.channels,
        );

        let commands = self.drain_inbound();
        let readings = self.tick_readings();
        let outcome = self.controller.tick(self.mode, &commands, &readings);

        for transition in &outcome.applied {
            self.channels[transition.channel.index()].set_relay(transition.state);
            self.source.relay_changed(transition.channel, transition.state);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_tick();
            for transition in &outcome.applied {
                metrics.record_transition(transition.issuer);
            }
            for _ in &outcome.trips {
                metrics.record_safety_trip();
            }
        }

        self.publish_window(&outcome);
    }

    /// Service the inbound queues. Mode and environment are snapshots, so
    /// only the latest of each matters; relay commands keep their arrival
    /// order for arbitration. Malformed payloads are dropped here, at the
    /// normalization boundary, and never reach the controller.
    fn drain_inbound(&mut self) -> Vec<Command> {
        while let Some(message) = self.mode_subscription.try_recv() {
            match decode_mode(&message.payload) {
                Ok(mode) => {
                    if mode != self.mode {
                        info!(from = %self.mode, to = %mode, "operating mode changed");
                    }
                    self.mode = mode;
                }
                Err(err) => {
                    warn!(topic = %message.topic, error = %err, "dropped malformed mode payload");
                }
            }
        }

        while let Some(message) = self.environment_subscription.try_recv() {
            match decode_environment(&message.payload) {
                Ok(reading) => self.temperature = Some(reading.temperature),
                Err(err) => {
                    warn!(topic = %message.topic, error = %err, "dropped malformed environment payload");
                }
            }
        }

        let mut commands = Vec::new();
        for (channel, subscription) in ChannelId::ALL
            .into_iter()
            .zip(self.relay_subscriptions.iter_mut())
        {
            while let Some(message) = subscription.try_recv() {
                match decode_relay_command(channel, &message.payload) {
                    Ok(command) => commands.push(command),
                    Err(err) => {
                        warn!(
                            channel = %channel,
                            error = %err,
                            "dropped malformed relay command"
                        );
                    }
                }
            }
        }
        commands
    }

    fn tick_readings(&self) -> TickReadings {
        let mut readings = TickReadings {
            temperature_c: self.temperature,
            channels: [None, None],
        };
        for (slot, channel) in readings.channels.iter_mut().zip(self.channels.iter()) {
            *slot = channel.filtered().map(|filtered| ChannelReadings {
                power_w: filtered.power_w,
                voltage_v: filtered.voltage_v,
            });
        }
        readings
    }

    fn publish_window(&self, outcome: &TickOutcome) {
        let now = Utc::now();
        for channel in &self.channels {
            if let Some(sample) = channel.sample(now) {
                let payload =
                    TelemetryPayload::from_readings(sample.voltage, sample.current, sample.power);
                self.publish(Topic::Telemetry(sample.channel), &payload);
            }
        }
        for transition in &outcome.applied {
            self.publish(
                Topic::RelayStatus(transition.channel),
                &RelayStatusPayload::from(transition.state),
            );
            self.publish(
                Topic::Audit,
                &AuditPayload {
                    channel: transition.channel,
                    relay_state: transition.state.is_on(),
                    issuer: transition.issuer,
                    timestamp: now,
                },
            );
        }
    }

    fn publish<T: Serialize>(&self, topic: Topic, payload: &T) {
        match self.client.publish(topic, payload) {
            Ok(_) => {}
            Err(BusError::Disconnected(_)) => {
                debug!(topic = %topic, "publish skipped; link severed");
            }
            Err(err) => {
                warn!(topic = %topic, error = %err, "publish failed");
            }
        }
    }

    fn write_jitter_summary(&self, reporter: &LoopTimingReporter) {
        let Some(summary) = reporter.histogram().summary() else {
            return;
        };
        let directory = &self.config.store.directory;
        if let Err(err) = std::fs::create_dir_all(directory) {
            warn!(directory = %directory.display(), error = %err, "unable to create store directory");
            return;
        }
        let path = directory.join("meter-node-jitter.json");
        if let Err(err) = reporter.histogram().write_json(&path) {
            warn!(path = %path.display(), error = %err, "failed to write jitter summary");
        }
        debug!(
            samples = summary.samples,
            mean_ns = summary.mean_ns,
            std_dev_ns = summary.std_dev_ns,
            "meter node jitter summary"
        );
    }
}
