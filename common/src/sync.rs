//! Datagram dispatch and the role-specific handling of reports.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    cipher::Framing,
    config::ClientConfig,
    error::{HeatingError, ProtocolError},
    heating::Heating,
    ports::DisplayNotifier,
    protocol::{Datagram, Request},
};

/// Side effects the host must carry out after handling a datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Send { to: SocketAddr, payload: Vec<u8> },
    Reboot { from: SocketAddr },
}

/// How a node reacts to a `'!'` snapshot.
pub trait Role: Send + Sync {
    fn name(&self) -> &'static str;
    fn handle_report(&self, heating: &Heating, report: &Datagram, now_ms: u64);
}

/// Aggregates all zones and owns actuation.
#[derive(Debug, Default)]
pub struct ControllerRole;

impl Role for ControllerRole {
    fn name(&self) -> &'static str {
        "controller"
    }

    fn handle_report(&self, heating: &Heating, report: &Datagram, now_ms: u64) {
        if heating.find_or_create(&report.name, true).is_none() {
            return;
        }

        if !report.setpoint.is_nan() {
            if let Err(err) = heating.record_setpoint(&report.name, report.setpoint, false, now_ms) {
                info!("report setpoint rejected: {err}");
            }
        }
        if !heating.is_local(&report.name) && !report.value.is_nan() {
            heating.record_sample(&report.name, report.value, false, now_ms);
        }
        heating.evaluate(&report.name, now_ms);
    }
}

/// What the client's own display shows for its local zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocalPanel {
    pub value: Option<f32>,
    pub setpoint: Option<f32>,
    /// User-requested setpoint not yet echoed back by the controller.
    pub pending: Option<f32>,
}

/// Measures locally and mirrors the controller's view for display.
pub struct ClientRole {
    identity: String,
    setpoint_limit: f32,
    panel: Mutex<LocalPanel>,
    display: Arc<dyn DisplayNotifier>,
}

impl ClientRole {
    pub fn new(identity: &str, heating: &Heating, display: Arc<dyn DisplayNotifier>) -> Self {
        let config = heating.config();
        Self {
            identity: identity.to_string(),
            setpoint_limit: config.setpoint_max + config.setpoint_epsilon,
            panel: Mutex::new(LocalPanel {
                value: None,
                setpoint: None,
                pending: None,
            }),
            display,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn panel(&self) -> LocalPanel {
        *self.lock()
    }

    pub fn request_setpoint(&self, setpoint: f32) -> Result<(), HeatingError> {
        if !setpoint.is_finite() || setpoint > self.setpoint_limit {
            return Err(HeatingError::SetpointOutOfRange {
                zone: self.identity.clone(),
                value: setpoint,
                max: self.setpoint_limit,
            });
        }
        self.lock().pending = Some(setpoint);
        self.display.request_refresh();
        info!("setpoint {setpoint:.1} pending for `{}`", self.identity);
        Ok(())
    }

    /// Datagrams for this round of the update loop and the wait before the next.
    pub fn update_plan(&self, config: &ClientConfig) -> (Vec<Datagram>, Duration) {
        let pending = self.lock().pending;
        let mut outgoing = Vec::with_capacity(2);
        if let Some(setpoint) = pending {
            outgoing.push(Datagram::report(&self.identity, f32::NAN, setpoint));
        }
        outgoing.push(Datagram::query_all());

        let wait_ms = if pending.is_some() {
            config.pending_interval_ms
        } else {
            config.idle_interval_ms
        };
        (outgoing, Duration::from_millis(wait_ms))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalPanel> {
        self.panel.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Role for ClientRole {
    fn name(&self) -> &'static str {
        "client"
    }

    fn handle_report(&self, heating: &Heating, report: &Datagram, _now_ms: u64) {
        if report.name != self.identity {
            heating.store_remote(&report.name, report.value, report.setpoint);
            return;
        }

        let mut refresh = false;
        {
            let mut panel = self.lock();
            if !report.value.is_nan() {
                refresh |= panel.value != Some(report.value);
                panel.value = Some(report.value);
            }
            if !report.setpoint.is_nan() && report.setpoint <= self.setpoint_limit {
                refresh |= panel.setpoint != Some(report.setpoint);
                panel.setpoint = Some(report.setpoint);
                if panel.pending == Some(report.setpoint) {
                    debug!("pending setpoint confirmed by controller");
                    panel.pending = None;
                    refresh = true;
                }
            }
        }
        if refresh {
            self.display.request_refresh();
        }
    }
}

/// One node's view of the sync protocol: framing, engine and role.
pub struct SyncNode {
    heating: Arc<Heating>,
    framing: Arc<Framing>,
    role: Arc<dyn Role>,
    port: u16,
}

impl SyncNode {
    pub fn new(heating: Arc<Heating>, framing: Arc<Framing>, role: Arc<dyn Role>, port: u16) -> Self {
        Self {
            heating,
            framing,
            role,
            port,
        }
    }

    pub fn heating(&self) -> &Arc<Heating> {
        &self.heating
    }

    pub fn framing(&self) -> &Arc<Framing> {
        &self.framing
    }

    pub fn seal(&self, datagram: &Datagram) -> Vec<u8> {
        self.framing.seal(datagram)
    }

    pub fn handle(&self, raw: &[u8], from: SocketAddr, now_ms: u64) -> Vec<SyncAction> {
        let datagram = match self.framing.open(raw) {
            Ok(datagram) => datagram,
            Err(ProtocolError::UnknownRequest(byte)) => {
                warn!(
                    "received unknown request type {:?} from {from}",
                    char::from(byte)
                );
                return Vec::new();
            }
            Err(err) => {
                info!("invalid datagram from {from}: {err}");
                return Vec::new();
            }
        };

        let reply_to = SocketAddr::new(from.ip(), self.port);
        match datagram.request {
            Request::Reboot => {
                warn!("remote reboot requested by {from}");
                vec![SyncAction::Reboot { from }]
            }
            Request::QueryOne => self
                .heating
                .find_or_create(&datagram.name, false)
                .map(|zone| vec![self.reply(reply_to, &zone.name, zone.value, zone.setpoint)])
                .unwrap_or_default(),
            Request::QueryAll => self
                .heating
                .iter()
                .map(|zone| self.reply(reply_to, &zone.name, zone.value, zone.setpoint))
                .collect(),
            Request::Report => {
                debug!("{} handling report for `{}` from {from}", self.role.name(), datagram.name);
                self.role.handle_report(&self.heating, &datagram, now_ms);
                Vec::new()
            }
        }
    }

    fn reply(&self, to: SocketAddr, name: &str, value: f32, setpoint: f32) -> SyncAction {
        debug!("sending `{name}` to {to}");
        SyncAction::Send {
            to,
            payload: self.seal(&Datagram::report(name, value, setpoint)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heating::tests::{rig, Rig},
        ports::RefreshFlag,
        zone::ActuationState,
    };
    use pretty_assertions::assert_eq;

    fn peer() -> SocketAddr {
        "10.0.0.7:40000".parse().unwrap()
    }

    fn controller(rig: &Rig) -> SyncNode {
        SyncNode::new(
            rig.heating.clone(),
            Arc::new(Framing::plaintext()),
            Arc::new(ControllerRole),
            1024,
        )
    }

    fn decode_replies(actions: &[SyncAction]) -> Vec<(SocketAddr, Datagram)> {
        actions
            .iter()
            .map(|action| match action {
                SyncAction::Send { to, payload } => (*to, Datagram::decode(payload).unwrap()),
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn query_one_replies_to_well_known_port() {
        let rig = rig(&[]);
        rig.heating.store_remote("bedroom", 21.8, 22.5);
        let node = controller(&rig);

        let replies = decode_replies(&node.handle(&Datagram::query_one("bedroom").encode(), peer(), 0));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "10.0.0.7:1024".parse().unwrap());
        assert_eq!(replies[0].1, Datagram::report("bedroom", 21.8, 22.5));
    }

    #[test]
    fn query_one_for_unknown_zone_is_silent_and_does_not_create() {
        let rig = rig(&[]);
        let node = controller(&rig);

        assert!(node.handle(&Datagram::query_one("ghost").encode(), peer(), 0).is_empty());
        assert!(rig.heating.find_or_create("ghost", false).is_none());
    }

    #[test]
    fn reboot_is_unconditional() {
        let rig = rig(&[]);
        let node = controller(&rig);
        assert_eq!(
            node.handle(&Datagram::reboot().encode(), peer(), 0),
            vec![SyncAction::Reboot { from: peer() }]
        );
    }

    #[test]
    fn malformed_and_unknown_datagrams_are_dropped() {
        let rig = rig(&[]);
        let node = controller(&rig);

        assert!(node.handle(&[b'!', b'x'], peer(), 0).is_empty());

        let mut unknown = Datagram::report("bedroom", 20.0, 21.0).encode();
        unknown[0] = b'%';
        assert!(node.handle(&unknown, peer(), 0).is_empty());
        assert!(rig.heating.find_or_create("bedroom", false).is_none());
    }

    #[test]
    fn controller_report_records_and_actuates() {
        let rig = rig(&[]);
        rig.heating.set_relay("bedroom", Some(6)).unwrap();
        let node = controller(&rig);

        let report = Datagram::report("bedroom", 18.0, 22.0).encode();
        assert!(node.handle(&report, peer(), 500).is_empty());

        let zone = rig.heating.find_or_create("bedroom", false).unwrap();
        assert_eq!(zone.value, 18.0);
        assert_eq!(zone.setpoint, 22.0);
        assert_eq!(zone.actuation_state, ActuationState::On);
        assert_eq!(
            *rig.relay.commands.lock().unwrap(),
            vec![(6, ActuationState::On)]
        );
    }

    #[test]
    fn controller_ignores_remote_values_for_local_zones() {
        let rig = rig(&["ctrl"]);
        rig.heating.record_sample("ctrl", 20.0, false, 0);
        let node = controller(&rig);

        node.handle(&Datagram::report("ctrl", 5.0, 21.0).encode(), peer(), 10);

        let zone = rig.heating.find_or_create("ctrl", false).unwrap();
        assert_eq!(zone.value, 20.0);
        assert_eq!(zone.setpoint, 21.0);
    }

    #[test]
    fn client_confirms_pending_setpoint() {
        let rig = rig(&["hall"]);
        let display = Arc::new(RefreshFlag::default());
        let role = Arc::new(ClientRole::new("hall", &rig.heating, display.clone()));
        let node = SyncNode::new(
            rig.heating.clone(),
            Arc::new(Framing::plaintext()),
            role.clone(),
            1024,
        );

        role.request_setpoint(21.5).unwrap();
        assert!(display.take());
        let (outgoing, wait) = role.update_plan(&ClientConfig::default());
        assert_eq!(outgoing.len(), 2);
        assert_eq!(outgoing[0].request, Request::Report);
        assert_eq!(outgoing[0].setpoint, 21.5);
        assert_eq!(outgoing[1].request, Request::QueryAll);
        assert_eq!(wait, Duration::from_secs(1));

        node.handle(&Datagram::report("hall", 19.0, 21.5).encode(), peer(), 0);

        assert_eq!(
            role.panel(),
            LocalPanel {
                value: Some(19.0),
                setpoint: Some(21.5),
                pending: None,
            }
        );
        assert!(display.take());
        let (outgoing, wait) = role.update_plan(&ClientConfig::default());
        assert_eq!(outgoing, vec![Datagram::query_all()]);
        assert_eq!(wait, Duration::from_secs(5));
    }

    #[test]
    fn client_stores_other_zones_passively() {
        let rig = rig(&[]);
        let role = ClientRole::new("hall", &rig.heating, Arc::new(RefreshFlag::default()));

        role.handle_report(&rig.heating, &Datagram::report("bedroom", 21.8, 22.5), 0);

        let zone = rig.heating.find_or_create("bedroom", false).unwrap();
        assert_eq!(zone.value, 21.8);
        assert_eq!(zone.setpoint, 22.5);
        assert!(rig.relay.commands.lock().unwrap().is_empty());
        assert_eq!(role.panel().value, None);
    }

    #[test]
    fn client_rejects_out_of_range_request() {
        let rig = rig(&[]);
        let role = ClientRole::new("hall", &rig.heating, Arc::new(RefreshFlag::default()));
        assert!(role.request_setpoint(30.0).is_err());
        assert!(role.request_setpoint(f32::NAN).is_err());
        assert_eq!(role.panel().pending, None);
    }
}
