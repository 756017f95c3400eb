use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tracing::{debug, error, info, warn};

use crate::{
    actuation::{self, Actuation},
    config::HeatingConfig,
    error::HeatingError,
    ports::{DisplayNotifier, RelayDriver, ReportSink},
    protocol::Datagram,
    registry::{ZoneIter, ZoneRegistry},
    storage::{relay_key, setpoint_key, Storage, HC_URL_KEY},
    zone::{same_reading, Zone},
};

pub struct Ports {
    pub storage: Arc<dyn Storage>,
    pub relay: Arc<dyn RelayDriver>,
    pub display: Arc<dyn DisplayNotifier>,
    pub reports: Arc<dyn ReportSink>,
}

#[derive(Debug, Default)]
pub(crate) struct HcUrl {
    pub(crate) url: Option<String>,
    pub(crate) reload: bool,
}

/// The heating control engine: zone registry, ingestion, actuation and the
/// process-wide heating authorization flag.
pub struct Heating {
    pub(crate) config: HeatingConfig,
    pub(crate) registry: ZoneRegistry,
    relay: Arc<dyn RelayDriver>,
    display: Arc<dyn DisplayNotifier>,
    reports: Arc<dyn ReportSink>,
    local_zones: Vec<String>,
    hc_ok: AtomicBool,
    pub(crate) hc_url: Mutex<HcUrl>,
}

impl Heating {
    pub fn new(config: HeatingConfig, ports: Ports, local_zones: Vec<String>) -> Self {
        Self {
            config,
            registry: ZoneRegistry::new(ports.storage),
            relay: ports.relay,
            display: ports.display,
            reports: ports.reports,
            local_zones,
            hc_ok: AtomicBool::new(true),
            hc_url: Mutex::new(HcUrl {
                url: None,
                reload: true,
            }),
        }
    }

    pub fn config(&self) -> &HeatingConfig {
        &self.config
    }

    pub fn find_or_create(&self, name: &str, create: bool) -> Option<Zone> {
        self.registry.find_or_create(name, create)
    }

    pub fn iter(&self) -> ZoneIter<'_> {
        self.registry.iter()
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.local_zones.iter().any(|local| local == name)
    }

    pub fn hc_ok(&self) -> bool {
        self.hc_ok.load(Ordering::Acquire)
    }

    pub(crate) fn swap_hc(&self, ok: bool) -> bool {
        self.hc_ok.swap(ok, Ordering::AcqRel)
    }

    pub(crate) fn display_refresh(&self) {
        self.display.request_refresh();
    }

    pub fn record_sample(&self, name: &str, raw: f32, apply: bool, now_ms: u64) -> Option<Zone> {
        let (changed, zone) = self.registry.update(name, true, |zone| {
            let changed = zone.ingest(raw, now_ms);
            info!(
                "saving temp val `{}` = {:.1} => {:.1}",
                zone.name, zone.previous_value, zone.value
            );
            if apply {
                self.actuate(zone, now_ms);
            }
            (changed, zone.clone())
        })?;

        if changed {
            self.display.request_refresh();
        }
        if self.is_local(name) {
            self.reports.push(Datagram::report(name, zone.value, f32::NAN));
        }
        Some(zone)
    }

    pub fn record_setpoint(&self, name: &str, setpoint: f32, apply: bool, now_ms: u64) -> Result<Zone, HeatingError> {
        if !self.config.accepts_setpoint(setpoint) {
            info!("ignoring temp set `{name}` = {setpoint:.1}");
            return Err(HeatingError::SetpointOutOfRange {
                zone: name.to_string(),
                value: setpoint,
                max: self.config.setpoint_max,
            });
        }

        let storage = self.registry.storage();
        let (changed, zone, persisted) = self
            .registry
            .update(name, true, |zone| {
                let changed = !same_reading(zone.setpoint, setpoint);
                zone.setpoint = setpoint;
                info!("saving temp set `{name}` = {setpoint:.1}");
                let key = setpoint_key(name);
                let persisted = if setpoint.is_nan() {
                    storage.remove(&key)
                } else {
                    storage.write_string(&key, &format!("{setpoint:.1}"))
                };
                if apply {
                    self.actuate(zone, now_ms);
                }
                (changed, zone.clone(), persisted)
            })
            .ok_or_else(|| HeatingError::InvalidName(name.to_string()))?;

        if changed {
            self.display.request_refresh();
        }
        persisted?;
        Ok(zone)
    }

    /// Binds `relay` to the zone; `None` unbinds it and forgets the binding.
    pub fn set_relay(&self, name: &str, relay: Option<u8>) -> Result<Zone, HeatingError> {
        let stored = relay
            .map(|relay| {
                i8::try_from(relay).map_err(|_| HeatingError::RelayOutOfRange {
                    zone: name.to_string(),
                    relay,
                })
            })
            .transpose()?;
        let storage = self.registry.storage();
        let (zone, persisted) = self
            .registry
            .update(name, true, |zone| {
                zone.relay = relay;
                let key = relay_key(name);
                let persisted = match stored {
                    Some(stored) => storage.write_i8(&key, stored),
                    None => storage.remove(&key),
                };
                (zone.clone(), persisted)
            })
            .ok_or_else(|| HeatingError::InvalidName(name.to_string()))?;

        match relay {
            Some(relay) => info!("zone `{name}` bound to relay {relay}"),
            None => info!("zone `{name}` relay unassigned"),
        }
        persisted?;
        Ok(zone)
    }

    /// Administrative reset: relay unassigned, setpoint back to the default.
    pub fn clear(&self, name: &str) -> Result<Zone, HeatingError> {
        let storage = self.registry.storage();
        let (zone, removed) = self
            .registry
            .update(name, false, |zone| {
                zone.relay = None;
                zone.setpoint = f32::NAN;
                let removed = storage
                    .remove(&relay_key(name))
                    .and_then(|()| storage.remove(&setpoint_key(name)));
                (zone.clone(), removed)
            })
            .ok_or_else(|| HeatingError::InvalidName(name.to_string()))?;

        info!("zone `{name}` cleared");
        self.display.request_refresh();
        removed?;
        Ok(zone)
    }

    pub fn evaluate(&self, name: &str, now_ms: u64) -> Option<Actuation> {
        self.registry
            .update(name, false, |zone| self.actuate(zone, now_ms))
    }

    pub fn evaluate_all(&self, now_ms: u64) {
        let names: Vec<String> = self.iter().map(|zone| zone.name).collect();
        for name in names {
            self.evaluate(&name, now_ms);
        }
    }

    pub fn store_remote(&self, name: &str, value: f32, setpoint: f32) {
        let changed = self.registry.update(name, true, |zone| {
            let mut changed = false;
            if !value.is_nan() {
                changed |= !same_reading(zone.value, value);
                zone.previous_value = zone.value;
                zone.value = value;
            }
            if !setpoint.is_nan() && self.config.accepts_setpoint(setpoint) {
                changed |= !same_reading(zone.setpoint, setpoint);
                zone.setpoint = setpoint;
            }
            changed
        });
        if changed == Some(true) {
            self.display.request_refresh();
        }
    }

    pub fn hc_url_get(&self) -> Option<String> {
        match self.registry.storage().read_string(HC_URL_KEY) {
            Ok(url) => url,
            Err(err) => {
                warn!("failed to read hc url: {err}");
                None
            }
        }
    }

    /// Persists the heating authorization URL; the monitor picks it up on its next sweep.
    pub fn hc_url_set(&self, url: Option<&str>) -> Result<(), HeatingError> {
        let storage = self.registry.storage();
        match url.map(str::trim).filter(|url| !url.is_empty()) {
            Some(url) => storage.write_string(HC_URL_KEY, url)?,
            None => storage.remove(HC_URL_KEY)?,
        }
        let mut hc = self.hc_url.lock().unwrap_or_else(|err| err.into_inner());
        hc.reload = true;
        Ok(())
    }

    // Called with the registry lock held; the authorization flag must be read here, not before.
    fn actuate(&self, zone: &mut Zone, now_ms: u64) -> Actuation {
        let actuation = actuation::evaluate(zone, self.hc_ok(), &self.config, now_ms);
        match actuation {
            Actuation::Unassigned => error!("no relay for `{}`", zone.name),
            Actuation::Held { desired } => debug!(
                "`{}` holding {} until dwell guard passes",
                zone.name,
                desired.as_str()
            ),
            Actuation::Command {
                relay,
                state,
                reason,
            } => {
                debug!("`{}` relay {relay} -> {} ({reason:?})", zone.name, state.as_str());
                if let Err(err) = self.relay.set(relay, state) {
                    warn!("relay command for `{}` failed: {err}", zone.name);
                }
            }
        }
        actuation
    }
}
