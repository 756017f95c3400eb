use crate::{
    config::HeatingConfig,
    zone::{ActuationState, Zone},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// External heating authority unreachable or refusing.
    HcUnavailable,
    /// Reading unknown or outside the plausible band.
    SensorFault,
    Demand,
    Satisfied,
}

impl Reason {
    pub fn is_fail_safe(self) -> bool {
        matches!(self, Self::HcUnavailable | Self::SensorFault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Actuation {
    /// No relay bound; nothing may reach hardware.
    Unassigned,
    /// Transition wanted but the dwell guard holds the current state.
    Held { desired: ActuationState },
    Command {
        relay: u8,
        state: ActuationState,
        reason: Reason,
    },
}

pub fn effective_setpoint(zone: &Zone, config: &HeatingConfig) -> f32 {
    if zone.setpoint.is_nan() {
        config.setpoint_default
    } else {
        zone.setpoint
    }
}

pub fn desired_state(zone: &Zone, hc_ok: bool, config: &HeatingConfig) -> (ActuationState, Reason) {
    if !hc_ok {
        return (ActuationState::Off, Reason::HcUnavailable);
    }

    let value = zone.value;
    if value.is_nan() || value >= config.fault_high || value <= config.fault_low {
        return (ActuationState::Off, Reason::SensorFault);
    }

    if effective_setpoint(zone, config) > value {
        (ActuationState::On, Reason::Demand)
    } else {
        (ActuationState::Off, Reason::Satisfied)
    }
}

/// Decides the relay command for `zone` and records any committed transition.
///
/// Calling again with unchanged inputs yields the same command and leaves the
/// zone untouched. Fail-safe OFF is never held back by the dwell guard.
pub fn evaluate(zone: &mut Zone, hc_ok: bool, config: &HeatingConfig, now_ms: u64) -> Actuation {
    let Some(relay) = zone.relay else {
        return Actuation::Unassigned;
    };

    let (desired, reason) = desired_state(zone, hc_ok, config);

    if desired != zone.actuation_state && !reason.is_fail_safe() {
        zone.pending_since_ms.get_or_insert(now_ms);
        if dwell_blocks(zone, desired, config, now_ms) {
            return Actuation::Held { desired };
        }
    }

    if desired != zone.actuation_state {
        zone.actuation_state = desired;
        zone.last_transition_ms = Some(now_ms);
    }
    zone.pending_since_ms = None;

    Actuation::Command {
        relay,
        state: desired,
        reason,
    }
}

// Small deviations around the setpoint must wait out the guard; large ones switch at once.
fn dwell_blocks(zone: &Zone, desired: ActuationState, config: &HeatingConfig, now_ms: u64) -> bool {
    let Some(last) = zone.last_transition_ms else {
        return false;
    };
    let elapsed_s = now_ms.saturating_sub(last) / 1_000;
    let diff = zone.value - effective_setpoint(zone, config);
    let guard = &config.dwell;

    match desired {
        ActuationState::Off => diff < guard.immediate_diff_off && elapsed_s < guard.min_off_after_s,
        ActuationState::On => diff > -guard.immediate_diff_on && elapsed_s < guard.min_on_after_s,
    }
}
