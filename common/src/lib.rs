pub mod actuation;
pub mod cipher;
pub mod config;
pub mod error;
pub mod heating;
pub mod monitor;
pub mod pacing;
pub mod ports;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod zone;

pub use actuation::{Actuation, Reason};
pub use cipher::{DatagramCipher, Framing};
pub use config::{ClientConfig, EncryptionConfig, HeatingConfig, NodeConfig, RuntimeConfig, SyncConfig};
pub use error::{HeatingError, ProtocolError, RelayError, StorageError};
pub use heating::{Heating, Ports};
pub use monitor::{HcPoll, SweepReport};
pub use pacing::Deadline;
pub use ports::{DisplayNotifier, NoReports, RefreshFlag, RelayDriver, RelayVariant, ReportSink};
pub use protocol::{Datagram, Request, DATAGRAM_LEN};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use sync::{ClientRole, ControllerRole, LocalPanel, Role, SyncAction, SyncNode};
pub use zone::{ActuationState, Zone, ZoneView};
