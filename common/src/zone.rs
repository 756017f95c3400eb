use serde::{Deserialize, Serialize};

use crate::error::HeatingError;

/// Wire and storage width of a zone name, terminator included.
pub const NAME_LEN: usize = 10;
/// Number of raw readings the smoothing filter looks back over.
pub const SAMPLE_CAPACITY: usize = 5;

pub fn validate_name(name: &str) -> Result<(), HeatingError> {
    if name.is_empty() || name.len() >= NAME_LEN || name.contains('\0') {
        return Err(HeatingError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActuationState {
    Off,
    On,
}

impl ActuationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRing {
    slots: [f32; SAMPLE_CAPACITY],
    next: usize,
    count: usize,
}

impl Default for SampleRing {
    fn default() -> Self {
        Self {
            slots: [f32::NAN; SAMPLE_CAPACITY],
            next: 0,
            count: 0,
        }
    }
}

impl SampleRing {
    pub fn push(&mut self, sample: f32) {
        self.slots[self.next] = sample;
        self.next = (self.next + 1) % SAMPLE_CAPACITY;
        self.count = (self.count + 1).min(SAMPLE_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn valid(&self) -> impl Iterator<Item = f32> + '_ {
        self.slots[..self.count]
            .iter()
            .copied()
            .filter(|sample| !sample.is_nan())
    }

    /// Held readings from oldest to newest, NaN included.
    pub fn chronological(&self) -> Vec<f32> {
        (0..self.count)
            .rev()
            .map(|age| self.slots[(self.next + SAMPLE_CAPACITY - 1 - age) % SAMPLE_CAPACITY])
            .collect()
    }

    pub fn min(&self) -> f32 {
        self.valid().fold(f32::NAN, f32::min)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,
    pub samples: SampleRing,
    pub value: f32,
    pub previous_value: f32,
    pub setpoint: f32,
    pub relay: Option<u8>,
    pub actuation_state: ActuationState,
    pub pending_since_ms: Option<u64>,
    pub last_transition_ms: Option<u64>,
    pub last_valid_ms: Option<u64>,
}

impl Zone {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            samples: SampleRing::default(),
            value: f32::NAN,
            previous_value: f32::NAN,
            setpoint: f32::NAN,
            relay: None,
            actuation_state: ActuationState::Off,
            pending_since_ms: None,
            last_transition_ms: None,
            last_valid_ms: None,
        }
    }

    /// Pushes a raw reading and recomputes the filtered value.
    /// Returns whether the filtered value changed.
    pub fn ingest(&mut self, raw: f32, now_ms: u64) -> bool {
        self.samples.push(raw);
        self.last_valid_ms = Some(now_ms);
        self.replace_value(self.samples.min())
    }

    pub fn erase(&mut self) -> bool {
        self.samples.clear();
        self.replace_value(f32::NAN)
    }

    pub fn is_stale(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        self.last_valid_ms
            .map(|last| now_ms.saturating_sub(last) > stale_after_ms)
            .unwrap_or(true)
    }

    fn replace_value(&mut self, value: f32) -> bool {
        let changed = !same_reading(self.value, value);
        self.previous_value = self.value;
        self.value = value;
        changed
    }
}

/// Equality where two unknown readings compare equal.
pub fn same_reading(a: f32, b: f32) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneView {
    pub name: String,
    pub value: Option<f32>,
    pub setpoint: Option<f32>,
    pub relay: Option<u8>,
    pub state: &'static str,
    pub samples: Vec<Option<f32>>,
    #[serde(rename = "pendingSinceMs")]
    pub pending_since_ms: Option<u64>,
    #[serde(rename = "lastTransitionMs")]
    pub last_transition_ms: Option<u64>,
    #[serde(rename = "lastValidMs")]
    pub last_valid_ms: Option<u64>,
}

impl From<&Zone> for ZoneView {
    fn from(zone: &Zone) -> Self {
        let known = |value: f32| (!value.is_nan()).then_some(value);
        Self {
            name: zone.name.clone(),
            value: known(zone.value),
            setpoint: known(zone.setpoint),
            relay: zone.relay,
            state: zone.actuation_state.as_str(),
            samples: zone
                .samples
                .chronological()
                .into_iter()
                .map(known)
                .collect(),
            pending_since_ms: zone.pending_since_ms,
            last_transition_ms: zone.last_transition_ms,
            last_valid_ms: zone.last_valid_ms,
        }
    }
}
