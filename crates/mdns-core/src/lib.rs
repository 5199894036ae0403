//! Finding other participants on the local network.
//!
//! Each participant announces one mDNS service whose TXT record carries its
//! participant id and display name; browsing turns resolved services back
//! into [`PeerRecord`]s.

pub mod announce;
pub mod discover;
pub mod model;
pub mod net;

pub use announce::Announcer;
pub use discover::{browse_blocking, browse_peers};
pub use model::{DiscoveredService, InterfaceIp, PeerRecord, ServiceAnnouncement};
pub use net::{list_interface_ips, pick_ip};
