use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::{ports::RelayVariant, zone::validate_name};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DwellGuard {
    pub min_on_after_s: u64,
    pub min_off_after_s: u64,
    pub immediate_diff_on: f32,
    pub immediate_diff_off: f32,
}

impl Default for DwellGuard {
    fn default() -> Self {
        Self {
            min_on_after_s: 0,
            min_off_after_s: 0,
            immediate_diff_on: 0.1,
            immediate_diff_off: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeatingConfig {
    pub setpoint_max: f32,
    pub setpoint_default: f32,
    pub setpoint_epsilon: f32,
    pub fault_low: f32,
    pub fault_high: f32,
    pub dwell: DwellGuard,
    pub sweep_interval_ms: u64,
    pub offline_reboot_budget_ms: u64,
    pub stale_margin_ms: u64,
    pub sleep_mode: bool,
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            setpoint_max: 25.0,
            setpoint_default: 15.0,
            setpoint_epsilon: 0.1,
            fault_low: 0.0,
            fault_high: 45.0,
            dwell: DwellGuard::default(),
            sweep_interval_ms: 10_000,
            offline_reboot_budget_ms: 150_000,
            stale_margin_ms: 20_000,
            sleep_mode: false,
        }
    }
}

impl HeatingConfig {
    /// Age after which a zone without a fresh reading is erased.
    pub fn stale_after_ms(&self) -> u64 {
        self.offline_reboot_budget_ms
            .saturating_add(self.stale_margin_ms)
    }

    pub fn accepts_setpoint(&self, setpoint: f32) -> bool {
        setpoint.is_nan() || setpoint <= self.setpoint_max + self.setpoint_epsilon
    }

    pub fn sanitize(&mut self) {
        if !self.setpoint_max.is_finite() {
            self.setpoint_max = 25.0;
        }
        if !self.setpoint_default.is_finite() {
            self.setpoint_default = 15.0;
        }
        self.setpoint_default = self.setpoint_default.min(self.setpoint_max);
        self.setpoint_epsilon = self.setpoint_epsilon.clamp(0.0, 1.0);
        if !(self.fault_low < self.fault_high) {
            self.fault_low = 0.0;
            self.fault_high = 45.0;
        }
        self.sweep_interval_ms = self.sweep_interval_ms.max(1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub key_b64: String,
    pub iv_b64: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    pub udp_port: u16,
    pub controller_ip: Option<IpAddr>,
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            udp_port: 1024,
            controller_ip: None,
            encryption: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub pending_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub sample_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pending_interval_ms: 1_000,
            idle_interval_ms: 5_000,
            sample_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub hostname: String,
    /// Zones whose sensors are wired to this node.
    #[serde(default)]
    pub local_zones: Vec<String>,
    #[serde(default)]
    pub relay_variant: RelayVariant,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_http_port() -> u16 {
    8080
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: "dummy".to_string(),
            local_zones: Vec::new(),
            relay_variant: RelayVariant::default(),
            http_port: default_http_port(),
        }
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        if validate_name(&self.hostname).is_err() {
            self.hostname = "dummy".to_string();
        }
        self.local_zones.retain(|name| validate_name(name).is_ok());
        self.local_zones.sort();
        self.local_zones.dedup();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub heating: HeatingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

impl RuntimeConfig {
    /// Applies `HEATZONE_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(hostname) = lookup("HEATZONE_HOSTNAME") {
            self.node.hostname = hostname;
        }
        if let Some(port) = lookup("HEATZONE_UDP_PORT").and_then(|value| value.parse().ok()) {
            self.sync.udp_port = port;
        }
        if let Some(ip) = lookup("HEATZONE_CONTROLLER_IP").and_then(|value| value.parse().ok()) {
            self.sync.controller_ip = Some(ip);
        }
        if let Some(port) = lookup("HEATZONE_HTTP_PORT").and_then(|value| value.parse().ok()) {
            self.node.http_port = port;
        }
    }

    pub fn sanitize(&mut self) {
        self.heating.sanitize();
        self.node.sanitize();
        self.client.pending_interval_ms = self.client.pending_interval_ms.max(100);
        self.client.idle_interval_ms = self
            .client
            .idle_interval_ms
            .max(self.client.pending_interval_ms);
    }
}
