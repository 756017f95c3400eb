use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use heatzone_common::{
    ActuationState, ClientConfig, ClientRole, ControllerRole, Datagram, DatagramCipher, Framing,
    Heating, HeatingConfig, MemoryStorage, NoReports, Ports, RefreshFlag, RelayDriver, RelayError,
    RelayVariant, ReportSink, Request, SyncAction, SyncNode,
};
use pretty_assertions::assert_eq;

const PORT: u16 = 1024;
const KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";
const IV: &[u8; 16] = b"fedcba9876543210";

#[derive(Default)]
struct Relays(Mutex<Vec<(u8, ActuationState)>>);

impl RelayDriver for Relays {
    fn variant(&self) -> RelayVariant {
        RelayVariant::Direct
    }

    fn set(&self, relay: u8, state: ActuationState) -> Result<(), RelayError> {
        self.0.lock().unwrap().push((relay, state));
        Ok(())
    }
}

#[derive(Default)]
struct Outbox(Mutex<Vec<Datagram>>);

impl ReportSink for Outbox {
    fn push(&self, datagram: Datagram) {
        self.0.lock().unwrap().push(datagram);
    }
}

struct Controller {
    node: SyncNode,
    heating: Arc<Heating>,
    relays: Arc<Relays>,
}

struct Client {
    node: SyncNode,
    heating: Arc<Heating>,
    role: Arc<ClientRole>,
    outbox: Arc<Outbox>,
}

fn controller(framing: Framing) -> Controller {
    let relays = Arc::new(Relays::default());
    let heating = Arc::new(Heating::new(
        HeatingConfig::default(),
        Ports {
            storage: Arc::new(MemoryStorage::new()),
            relay: relays.clone(),
            display: Arc::new(RefreshFlag::default()),
            reports: Arc::new(NoReports),
        },
        vec!["ctrl".to_string()],
    ));
    let node = SyncNode::new(heating.clone(), Arc::new(framing), Arc::new(ControllerRole), PORT);
    Controller {
        node,
        heating,
        relays,
    }
}

fn client(identity: &str, framing: Framing) -> Client {
    let outbox = Arc::new(Outbox::default());
    let display = Arc::new(RefreshFlag::default());
    let heating = Arc::new(Heating::new(
        HeatingConfig::default(),
        Ports {
            storage: Arc::new(MemoryStorage::new()),
            relay: Arc::new(Relays::default()),
            display: display.clone(),
            reports: outbox.clone(),
        },
        vec![identity.to_string()],
    ));
    let role = Arc::new(ClientRole::new(identity, &heating, display));
    let node = SyncNode::new(heating.clone(), Arc::new(framing), role.clone(), PORT);
    Client {
        node,
        heating,
        role,
        outbox,
    }
}

fn encrypted(secret: &str) -> Framing {
    Framing::encrypted(DatagramCipher::new(KEY, IV, secret).unwrap())
}

fn addr(last: u8) -> SocketAddr {
    SocketAddr::from(([192, 168, 1, last], 50_000))
}

fn payloads(actions: Vec<SyncAction>) -> Vec<Vec<u8>> {
    actions
        .into_iter()
        .map(|action| match action {
            SyncAction::Send { to, payload } => {
                assert_eq!(to.port(), PORT);
                payload
            }
            other => panic!("unexpected {other:?}"),
        })
        .collect()
}

#[test]
fn query_all_returns_one_report_per_zone() {
    let ctrl = controller(Framing::plaintext());
    ctrl.heating.record_sample("ctrl", 20.0, false, 0);
    ctrl.heating.record_setpoint("ctrl", 21.0, false, 0).unwrap();
    ctrl.heating.store_remote("bedroom", 21.8, 22.5);

    let replies = payloads(ctrl.node.handle(&Datagram::query_all().encode(), addr(20), 0));
    let mut tuples: Vec<_> = replies
        .iter()
        .map(|raw| Datagram::decode(raw).unwrap())
        .inspect(|datagram| assert_eq!(datagram.request, Request::Report))
        .map(|datagram| (datagram.name, datagram.value, datagram.setpoint))
        .collect();
    tuples.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(
        tuples,
        vec![
            ("bedroom".to_string(), 21.8, 22.5),
            ("ctrl".to_string(), 20.0, 21.0),
        ]
    );
}

#[test]
fn encrypted_report_reaches_controller() {
    let ctrl = controller(encrypted("topsecret"));
    let hall = client("bedroom", encrypted("topsecret"));
    ctrl.heating.set_relay("bedroom", Some(5)).unwrap();

    let sealed = hall.node.seal(&Datagram::report("bedroom", 21.8, 22.5));
    assert!(ctrl.node.handle(&sealed, addr(30), 1_000).is_empty());

    let zone = ctrl.heating.find_or_create("bedroom", false).unwrap();
    assert_eq!((zone.value, zone.setpoint), (21.8, 22.5));
    assert_eq!(zone.actuation_state, ActuationState::On);
    assert_eq!(*ctrl.relays.0.lock().unwrap(), vec![(5, ActuationState::On)]);
}

#[test]
fn wrong_secret_leaves_zone_untouched() {
    let ctrl = controller(encrypted("wrongsecret"));
    ctrl.heating.store_remote("bedroom", 19.0, 20.0);
    let hall = client("bedroom", encrypted("topsecret"));

    let sealed = hall.node.seal(&Datagram::report("bedroom", 21.8, 22.5));
    assert!(ctrl.node.handle(&sealed, addr(30), 1_000).is_empty());

    let zone = ctrl.heating.find_or_create("bedroom", false).unwrap();
    assert_eq!((zone.value, zone.setpoint), (19.0, 20.0));
    assert!(ctrl.relays.0.lock().unwrap().is_empty());
}

#[test]
fn plaintext_peer_is_rejected_by_encrypted_controller() {
    let ctrl = controller(encrypted("topsecret"));
    let raw = Datagram::report("attic", 12.0, 18.0).encode();

    assert!(ctrl.node.handle(&raw, addr(40), 0).is_empty());
    assert!(ctrl.heating.find_or_create("attic", false).is_none());
}

#[test]
fn client_setpoint_request_round_trips_through_controller() {
    let ctrl = controller(encrypted("topsecret"));
    let hall = client("hall", encrypted("topsecret"));
    ctrl.heating.set_relay("hall", Some(2)).unwrap();

    // Local sensor reading is queued for the controller.
    hall.heating.record_sample("hall", 18.4, false, 0);
    let pushed: Vec<Datagram> = hall.outbox.0.lock().unwrap().drain(..).collect();
    assert_eq!(pushed.len(), 1);
    for report in &pushed {
        ctrl.node.handle(&hall.node.seal(report), addr(50), 100);
    }

    hall.role.request_setpoint(21.0).unwrap();
    let (outgoing, _) = hall.role.update_plan(&ClientConfig::default());
    let mut replies = Vec::new();
    for datagram in &outgoing {
        replies.extend(payloads(ctrl.node.handle(&hall.node.seal(datagram), addr(50), 200)));
    }

    let zone = ctrl.heating.find_or_create("hall", false).unwrap();
    assert_eq!((zone.value, zone.setpoint), (18.4, 21.0));
    assert_eq!(zone.actuation_state, ActuationState::On);
    assert_eq!(replies.len(), 1);

    for reply in replies {
        hall.node.handle(&reply, addr(1), 300);
    }
    let panel = hall.role.panel();
    assert_eq!(panel.value, Some(18.4));
    assert_eq!(panel.setpoint, Some(21.0));
    assert_eq!(panel.pending, None);
}

#[test]
fn stale_zone_is_forced_off_after_threshold() {
    let ctrl = controller(Framing::plaintext());
    ctrl.heating.set_relay("co2", Some(7)).unwrap();
    ctrl.heating.record_setpoint("co2", 22.0, false, 0).unwrap();

    let t0 = 5_000;
    ctrl.node.handle(
        &Datagram::report("co2", 19.0, f32::NAN).encode(),
        addr(60),
        t0,
    );
    assert_eq!(
        ctrl.heating.find_or_create("co2", false).unwrap().actuation_state,
        ActuationState::On
    );

    let report = ctrl.heating.age_sweep(t0 + 171_000);
    assert_eq!(report.erased, vec!["co2".to_string()]);
    let zone = ctrl.heating.find_or_create("co2", false).unwrap();
    assert!(zone.value.is_nan());
    assert_eq!(zone.actuation_state, ActuationState::Off);
    assert_eq!(
        ctrl.relays.0.lock().unwrap().last(),
        Some(&(7, ActuationState::Off))
    );
}
