use std::{collections::BTreeMap, sync::Mutex};

use heatzone_common::{ActuationState, RelayDriver, RelayError, RelayVariant};
use tracing::info;

/// Relay bank stand-in for hosts without GPIO: records output levels and logs each change.
pub struct LogRelay {
    variant: RelayVariant,
    levels: Mutex<BTreeMap<u8, bool>>,
}

impl LogRelay {
    pub fn new(variant: RelayVariant) -> Self {
        Self {
            variant,
            levels: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn level(&self, relay: u8) -> Option<bool> {
        self.levels
            .lock()
            .ok()
            .and_then(|levels| levels.get(&relay).copied())
    }
}

impl RelayDriver for LogRelay {
    fn variant(&self) -> RelayVariant {
        self.variant
    }

    fn set(&self, relay: u8, state: ActuationState) -> Result<(), RelayError> {
        let level = self.variant.level(state);
        let mut levels = self.levels.lock().map_err(|_| RelayError {
            relay,
            message: "relay state poisoned".to_string(),
        })?;
        if levels.insert(relay, level) != Some(level) {
            info!(
                "relay {relay} {} (gpio {})",
                state.as_str(),
                if level { "high" } else { "low" }
            );
        }
        Ok(())
    }
}
