//! ---
//! lw_section: "05-relay-control"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Relay arbitration state machine and the meter node loop."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! The per-tick relay arbitration state machine.
//!
//! Within one tick the order is fixed: re-arm detection, inbound command
//! arbitration, the automatic temperature rule, then safety enforcement.
//! Safety runs last so nothing decided earlier in the tick can leave a
//! violating load powered, and it runs in every mode.
use tracing::{debug, info, warn};

use lw_bus::Command;
use lw_common::config::{ChannelsConfig, ControlConfig};
use lw_common::{ChannelId, Issuer, OperatingMode, RelayState};

/// Filtered readings for one channel at tick time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReadings {
    /// Filtered real power, watts.
    pub power_w: f64,
    /// Filtered RMS voltage, volts.
    pub voltage_v: f64,
}

/// Everything the controller sees in one tick. A `None` entry means that
/// input has produced nothing yet; the rules that need it stand down.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReadings {
    /// Latest ambient temperature, degrees Celsius.
    pub temperature_c: Option<f64>,
    /// Filtered readings per channel, indexed by [`ChannelId::index`].
    pub channels: [Option<ChannelReadings>; 2],
}

/// One relay state change the controller actually applied. Commands that
/// matched the present state produce no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedTransition {
    /// Channel that switched.
    pub channel: ChannelId,
    /// State after the transition.
    pub state: RelayState,
    /// Who caused it. The tag survives into status, audit and metrics.
    pub issuer: Issuer,
}

/// Which ceiling a safety trip crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripMetric {
    /// `trip_power_w` exceeded.
    Power,
    /// `trip_voltage_v` exceeded.
    Voltage,
}

/// Record of one firmware safety trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyTrip {
    /// Channel that was forced off.
    pub channel: ChannelId,
    /// Ceiling that was crossed.
    pub metric: TripMetric,
    /// Observed filtered value.
    pub value: f64,
    /// Configured ceiling.
    pub limit: f64,
}

/// Result of one controller tick, in application order.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Mode the tick ran under.
    pub mode: OperatingMode,
    /// Transitions applied this tick, oldest first.
    pub applied: Vec<AppliedTransition>,
    /// Safety trips raised this tick.
    pub trips: Vec<SafetyTrip>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Cold,
    Hot,
}

#[derive(Debug, Clone, Copy)]
struct TripLimits {
    power_w: f64,
    voltage_v: f64,
}

/// Relay arbitration for both channels.
///
/// Owns the authoritative relay states. Everything else — current mode,
/// inbound commands, filtered readings — arrives as tick input, so the
/// machine is deterministic per tick and unit-testable in isolation.
#[derive(Debug)]
pub struct RelayController {
    temp_threshold_c: f64,
    cold_channel: ChannelId,
    hot_channel: ChannelId,
    limits: [TripLimits; 2],
    relays: [RelayState; 2],
    last_mode: Option<OperatingMode>,
    classification: Option<Classification>,
}

impl RelayController {
    /// Build from the control section and the per-channel trip limits.
    /// Both relays start open.
    pub fn new(control: &ControlConfig, channels: &ChannelsConfig) -> Self {
        let limit = |channel: ChannelId| {
            let config = channels.get(channel);
            TripLimits {
                power_w: config.trip_power_w,
                voltage_v: config.trip_voltage_v,
            }
        };
        Self {
            temp_threshold_c: control.temp_threshold_c,
            cold_channel: control.cold_channel,
            hot_channel: control.hot_channel,
            limits: [limit(ChannelId::One), limit(ChannelId::Two)],
            relays: [RelayState::Off; 2],
            last_mode: None,
            classification: None,
        }
    }

    /// Current relay state of one channel.
    pub fn relay(&self, channel: ChannelId) -> RelayState {
        self.relays[channel.index()]
    }

    /// Current relay states, indexed by [`ChannelId::index`].
    pub fn relays(&self) -> [RelayState; 2] {
        self.relays
    }

    /// Run one tick.
    ///
    /// `commands` is the inbound batch in arrival order. Arbitration keeps
    /// the most recent eligible command per channel, except that a Safety
    /// command is never displaced by a non-Safety one from the same batch.
    /// Eligibility: Safety always; Manual only in Manual mode; Auto only in
    /// Auto mode. Ineligible commands are dropped and logged.
    pub fn tick(
        &mut self,
        mode: OperatingMode,
        commands: &[Command],
        readings: &TickReadings,
    ) -> TickOutcome {
        let mut outcome = TickOutcome {
            mode,
            applied: Vec::new(),
            trips: Vec::new(),
        };

        // switching into Auto re-arms the rule: the next classification
        // counts as an edge even if the temperature never moved
        if mode == OperatingMode::Auto && self.last_mode != Some(OperatingMode::Auto) {
            if self.last_mode.is_some() {
                debug!("temperature rule re-armed after mode switch");
            }
            self.classification = None;
        }
        self.last_mode = Some(mode);

        for command in self.arbitrate(mode, commands).into_iter().flatten() {
            self.apply(command.channel, command.desired, command.issuer, &mut outcome);
        }

        if mode == OperatingMode::Auto {
            self.run_temperature_rule(readings, &mut outcome);
        }

        self.enforce_ceilings(readings, &mut outcome);

        outcome
    }

    fn arbitrate(&self, mode: OperatingMode, commands: &[Command]) -> [Option<Command>; 2] {
        let mut winners: [Option<Command>; 2] = [None; 2];
        for command in commands {
            let eligible = match command.issuer {
                Issuer::Safety => true,
                Issuer::Manual => mode == OperatingMode::Manual,
                Issuer::Auto => mode == OperatingMode::Auto,
            };
            if !eligible {
                info!(
                    channel = %command.channel,
                    issuer = %command.issuer,
                    mode = %mode,
                    desired = %command.desired,
                    "command ignored in current mode"
                );
                continue;
            }
            let slot = &mut winners[command.channel.index()];
            match slot {
                Some(winner)
                    if winner.issuer == Issuer::Safety && command.issuer != Issuer::Safety =>
                {
                    debug!(
                        channel = %command.channel,
                        issuer = %command.issuer,
                        "command outranked by safety within batch"
                    );
                }
                _ => *slot = Some(*command),
            }
        }
        winners
    }

    /// Classify hot/cold and switch the complementary pair on an edge.
    /// The inactive load is commanded off before its peer is commanded on,
    /// so the pair is never driven simultaneously, not even between the
    /// two transitions of one tick.
    fn run_temperature_rule(&mut self, readings: &TickReadings, outcome: &mut TickOutcome) {
        let Some(temperature) = readings.temperature_c else {
            return;
        };
        let classification = if temperature > self.temp_threshold_c {
            Classification::Hot
        } else {
            Classification::Cold
        };
        if self.classification == Some(classification) {
            return;
        }
        let (to_off, to_on) = match classification {
            Classification::Hot => (self.cold_channel, self.hot_channel),
            Classification::Cold => (self.hot_channel, self.cold_channel),
        };
        info!(
            temperature_c = temperature,
            threshold_c = self.temp_threshold_c,
            classification = ?classification,
            "temperature classification edge"
        );
        self.apply(to_off, RelayState::Off, Issuer::Auto, outcome);
        self.apply(to_on, RelayState::On, Issuer::Auto, outcome);
        self.classification = Some(classification);
    }

    /// Force any powered channel whose filtered readings exceed a fixed
    /// ceiling off, regardless of mode. The comparison is strict; sitting
    /// exactly at the limit is allowed. There is no cooldown: a channel
    /// switched back on trips again on the next violating window.
    fn enforce_ceilings(&mut self, readings: &TickReadings, outcome: &mut TickOutcome) {
        for channel in ChannelId::ALL {
            if !self.relays[channel.index()].is_on() {
                continue;
            }
            let Some(current) = readings.channels[channel.index()] else {
                continue;
            };
            let limits = self.limits[channel.index()];
            let violation = if current.power_w > limits.power_w {
                Some((TripMetric::Power, current.power_w, limits.power_w))
            } else if current.voltage_v > limits.voltage_v {
                Some((TripMetric::Voltage, current.voltage_v, limits.voltage_v))
            } else {
                None
            };
            if let Some((metric, value, limit)) = violation {
                warn!(
                    channel = %channel,
                    metric = ?metric,
                    value,
                    limit,
                    "safety ceiling exceeded; forcing relay off"
                );
                self.apply(channel, RelayState::Off, Issuer::Safety, outcome);
                outcome.trips.push(SafetyTrip {
                    channel,
                    metric,
                    value,
                    limit,
                });
            }
        }
    }

    fn apply(
        &mut self,
        channel: ChannelId,
        state: RelayState,
        issuer: Issuer,
        outcome: &mut TickOutcome,
    ) {
        let slot = &mut self.relays[channel.index()];
        if *slot == state {
            return;
        }
        *slot = state;
        info!(channel = %channel, state = %state, issuer = %issuer, "relay transition");
        outcome.applied.push(AppliedTransition {
            channel,
            state,
            issuer,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RelayController {
        RelayController::new(&ControlConfig::default(), &ChannelsConfig::default())
    }

    fn manual(channel: ChannelId, desired: RelayState) -> Command {
        Command {
            channel,
            desired,
            issuer: Issuer::Manual,
        }
    }

    fn safety_off(channel: ChannelId) -> Command {
        Command {
            channel,
            desired: RelayState::Off,
            issuer: Issuer::Safety,
        }
    }

    fn ambient(temperature: f64) -> TickReadings {
        TickReadings {
            temperature_c: Some(temperature),
            channels: [None, None],
        }
    }

    fn loaded(channel: ChannelId, power_w: f64, voltage_v: f64) -> TickReadings {
        let mut readings = TickReadings::default();
        readings.channels[channel.index()] = Some(ChannelReadings { power_w, voltage_v });
        readings
    }

    #[test]
    fn cold_start_establishes_the_heater_then_holds() {
        let mut controller = controller();

        let first = controller.tick(OperatingMode::Auto, &[], &ambient(25.0));
        assert_eq!(
            first.applied,
            vec![AppliedTransition {
                channel: ChannelId::One,
                state: RelayState::On,
                issuer: Issuer::Auto,
            }],
            "initial classification is an edge; only the heater actually switches"
        );

        let second = controller.tick(OperatingMode::Auto, &[], &ambient(25.0));
        assert!(second.applied.is_empty(), "no edge, no commands");
    }

    #[test]
    fn hot_edge_switches_heater_off_before_fan_on() {
        let mut controller = controller();
        controller.tick(OperatingMode::Auto, &[], &ambient(25.0));

        let outcome = controller.tick(OperatingMode::Auto, &[], &ambient(31.0));
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.applied[0].channel, ChannelId::One);
        assert_eq!(outcome.applied[0].state, RelayState::Off);
        assert_eq!(outcome.applied[1].channel, ChannelId::Two);
        assert_eq!(outcome.applied[1].state, RelayState::On);
        assert_eq!(controller.relay(ChannelId::One), RelayState::Off);
        assert_eq!(controller.relay(ChannelId::Two), RelayState::On);
    }

    #[test]
    fn threshold_is_strictly_greater_than() {
        let mut controller = controller();
        controller.tick(OperatingMode::Auto, &[], &ambient(25.0));
        let at_threshold = controller.tick(OperatingMode::Auto, &[], &ambient(30.0));
        assert!(at_threshold.applied.is_empty(), "30.0 still classifies cold");
        let above = controller.tick(OperatingMode::Auto, &[], &ambient(30.1));
        assert_eq!(above.applied.len(), 2);
    }

    #[test]
    fn unknown_temperature_suspends_the_rule() {
        let mut controller = controller();
        let outcome = controller.tick(OperatingMode::Auto, &[], &TickReadings::default());
        assert!(outcome.applied.is_empty());
    }

    #[test]
    fn manual_commands_are_ignored_in_auto_and_honoured_in_manual() {
        let mut controller = controller();

        let ignored = controller.tick(
            OperatingMode::Auto,
            &[manual(ChannelId::Two, RelayState::On)],
            &TickReadings::default(),
        );
        assert!(ignored.applied.is_empty());
        assert_eq!(controller.relay(ChannelId::Two), RelayState::Off);

        let honoured = controller.tick(
            OperatingMode::Manual,
            &[manual(ChannelId::Two, RelayState::On)],
            &TickReadings::default(),
        );
        assert_eq!(honoured.applied.len(), 1);
        assert_eq!(honoured.applied[0].issuer, Issuer::Manual);
        assert_eq!(controller.relay(ChannelId::Two), RelayState::On);
    }

    #[test]
    fn most_recent_command_per_channel_wins() {
        let mut controller = controller();
        let batch = [
            manual(ChannelId::One, RelayState::On),
            manual(ChannelId::One, RelayState::Off),
            manual(ChannelId::One, RelayState::On),
        ];
        let outcome = controller.tick(OperatingMode::Manual, &batch, &TickReadings::default());
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.applied[0].state, RelayState::On);
    }

    #[test]
    fn safety_command_outranks_manual_in_the_same_batch() {
        let mut controller = controller();
        controller.tick(
            OperatingMode::Manual,
            &[manual(ChannelId::One, RelayState::On)],
            &TickReadings::default(),
        );

        // safety arrives first, operator tries to re-enable afterwards
        let batch = [safety_off(ChannelId::One), manual(ChannelId::One, RelayState::On)];
        let outcome = controller.tick(OperatingMode::Manual, &batch, &TickReadings::default());
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.applied[0].state, RelayState::Off);
        assert_eq!(outcome.applied[0].issuer, Issuer::Safety);
        assert_eq!(controller.relay(ChannelId::One), RelayState::Off);
    }

    #[test]
    fn reentering_auto_rearms_the_classification_edge() {
        let mut controller = controller();
        controller.tick(OperatingMode::Auto, &[], &ambient(25.0));

        // operator takes over and switches the heater off by hand
        controller.tick(
            OperatingMode::Manual,
            &[manual(ChannelId::One, RelayState::Off)],
            &TickReadings::default(),
        );

        // back to auto at the same temperature: the rule re-establishes
        let outcome = controller.tick(OperatingMode::Auto, &[], &ambient(25.0));
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.applied[0].channel, ChannelId::One);
        assert_eq!(outcome.applied[0].state, RelayState::On);
        assert_eq!(outcome.applied[0].issuer, Issuer::Auto);
    }

    #[test]
    fn power_ceiling_trips_in_any_mode_without_cooldown() {
        let mut controller = controller();
        let trip_limit = ChannelsConfig::default().load1.trip_power_w;

        controller.tick(
            OperatingMode::Manual,
            &[manual(ChannelId::One, RelayState::On)],
            &TickReadings::default(),
        );
        let tripped = controller.tick(
            OperatingMode::Manual,
            &[],
            &loaded(ChannelId::One, trip_limit + 0.1, 230.0),
        );
        assert_eq!(tripped.trips.len(), 1);
        assert_eq!(tripped.trips[0].metric, TripMetric::Power);
        assert_eq!(tripped.trips[0].limit, trip_limit);
        assert_eq!(
            tripped.applied,
            vec![AppliedTransition {
                channel: ChannelId::One,
                state: RelayState::Off,
                issuer: Issuer::Safety,
            }]
        );

        // switching back on re-arms; the very next violating window trips again
        let retripped = controller.tick(
            OperatingMode::Manual,
            &[manual(ChannelId::One, RelayState::On)],
            &loaded(ChannelId::One, trip_limit + 0.1, 230.0),
        );
        assert_eq!(retripped.trips.len(), 1);
        assert_eq!(controller.relay(ChannelId::One), RelayState::Off);
    }

    #[test]
    fn exact_ceiling_readings_do_not_trip() {
        let mut controller = controller();
        let limits = ChannelsConfig::default().load1;

        controller.tick(
            OperatingMode::Manual,
            &[manual(ChannelId::One, RelayState::On)],
            &TickReadings::default(),
        );
        let outcome = controller.tick(
            OperatingMode::Manual,
            &[],
            &loaded(ChannelId::One, limits.trip_power_w, limits.trip_voltage_v),
        );
        assert!(outcome.trips.is_empty());
        assert_eq!(controller.relay(ChannelId::One), RelayState::On);
    }

    #[test]
    fn voltage_ceiling_trips_even_in_auto() {
        let mut controller = controller();
        let trip_voltage = ChannelsConfig::default().load1.trip_voltage_v;

        // auto rule powers the heater, same tick's readings are clean
        controller.tick(OperatingMode::Auto, &[], &ambient(25.0));

        let mut readings = ambient(25.0);
        readings.channels[0] = Some(ChannelReadings {
            power_w: 900.0,
            voltage_v: trip_voltage + 1.0,
        });
        let outcome = controller.tick(OperatingMode::Auto, &[], &readings);
        assert_eq!(outcome.trips.len(), 1);
        assert_eq!(outcome.trips[0].metric, TripMetric::Voltage);
        assert_eq!(controller.relay(ChannelId::One), RelayState::Off);
    }

    #[test]
    fn unpowered_channels_never_trip() {
        let mut controller = controller();
        let outcome = controller.tick(
            OperatingMode::Manual,
            &[],
            &loaded(ChannelId::One, 99_999.0, 999.0),
        );
        assert!(outcome.trips.is_empty(), "nothing to force off");
    }
}
