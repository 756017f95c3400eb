use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::{
    storage::{relay_key, setpoint_key, Storage},
    zone::{validate_name, Zone},
};

/// Owns every zone. One lock guards lookup, insertion and mutation, so two
/// first references to the same name can never create duplicates.
pub struct ZoneRegistry {
    zones: Mutex<Vec<Zone>>,
    storage: Arc<dyn Storage>,
}

impl ZoneRegistry {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            zones: Mutex::new(Vec::new()),
            storage,
        }
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Snapshot of the named zone, created with persisted settings if asked.
    pub fn find_or_create(&self, name: &str, create: bool) -> Option<Zone> {
        self.update(name, create, |zone| zone.clone())
    }

    /// Runs `apply` on the named zone while holding the registry lock.
    pub fn update<R>(&self, name: &str, create: bool, apply: impl FnOnce(&mut Zone) -> R) -> Option<R> {
        if let Err(err) = validate_name(name) {
            error!("{err}");
            return None;
        }

        let mut zones = self.lock();
        let index = match zones.iter().position(|zone| zone.name == name) {
            Some(index) => index,
            None if create => {
                zones.push(self.load_zone(name));
                zones.len() - 1
            }
            None => return None,
        };
        Some(apply(&mut zones[index]))
    }

    /// Lazy walk in insertion order. Zones added mid-walk are picked up.
    pub fn iter(&self) -> ZoneIter<'_> {
        ZoneIter {
            registry: self,
            index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Zone>> {
        self.zones.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn load_zone(&self, name: &str) -> Zone {
        info!("adding zone `{name}`");
        let mut zone = Zone::new(name);

        match self.storage.read_string(&setpoint_key(name)) {
            Ok(Some(raw)) => match raw.trim().parse::<f32>() {
                Ok(setpoint) => zone.setpoint = setpoint,
                Err(err) => warn!("ignoring stored setpoint `{raw}` for `{name}`: {err}"),
            },
            Ok(None) => {}
            Err(err) => warn!("failed to read setpoint for `{name}`: {err}"),
        }

        match self.storage.read_i8(&relay_key(name)) {
            Ok(Some(relay)) => zone.relay = u8::try_from(relay).ok(),
            Ok(None) => {}
            Err(err) => warn!("failed to read relay for `{name}`: {err}"),
        }

        zone
    }
}

pub struct ZoneIter<'a> {
    registry: &'a ZoneRegistry,
    index: usize,
}

impl Iterator for ZoneIter<'_> {
    type Item = Zone;

    fn next(&mut self) -> Option<Self::Item> {
        let zone = self.registry.lock().get(self.index).cloned()?;
        self.index += 1;
        Some(zone)
    }
}
