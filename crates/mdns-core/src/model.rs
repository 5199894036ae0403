use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// TXT key carrying the announcer's participant id.
pub const TXT_PARTICIPANT_ID: &str = "pid";
/// TXT key carrying the announcer's display name.
pub const TXT_DISPLAY_NAME: &str = "name";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    /// e.g. "_fileshare._tcp.local."
    pub service_type: String,
    pub instance_name: String,
    /// e.g. "fileshare-1a2b3c4d.local."
    pub host_name: String,
    pub ip_addr: IpAddr,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub fullname: String,
    pub host_name: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: Vec<(String, String)>,
}

impl DiscoveredService {
    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A participant reachable for transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub participant_id: String,
    pub display_name: String,
    pub addr: SocketAddr,
}

impl PeerRecord {
    /// Services without a participant id or address are not ours to use.
    /// IPv4 addresses are preferred.
    pub fn from_service(service: &DiscoveredService) -> Option<Self> {
        let participant_id = service.txt_value(TXT_PARTICIPANT_ID)?.trim();
        if participant_id.is_empty() {
            return None;
        }

        let ip = service
            .addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| service.addresses.first())?;

        Some(Self {
            participant_id: participant_id.to_string(),
            display_name: service
                .txt_value(TXT_DISPLAY_NAME)
                .filter(|n| !n.is_empty())
                .unwrap_or("Guest")
                .to_string(),
            addr: SocketAddr::new(*ip, service.port),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub family: &'static str,  //ipv4 or ipv6
    pub is_loopback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn service(txt: &[(&str, &str)], addresses: Vec<IpAddr>) -> DiscoveredService {
        DiscoveredService {
            fullname: "ada._fileshare._tcp.local.".to_string(),
            host_name: "fileshare-abcd.local.".to_string(),
            port: 9876,
            addresses,
            txt: txt.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_peer_from_txt() {
        let peer = PeerRecord::from_service(&service(
            &[("pid", "abcd"), ("name", "Ada")],
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST), "192.168.1.20".parse().unwrap()],
        ))
        .unwrap();

        assert_eq!(peer.participant_id, "abcd");
        assert_eq!(peer.display_name, "Ada");
        assert_eq!(peer.addr, "192.168.1.20:9876".parse().unwrap());
    }

    #[test]
    fn test_unusable_services() {
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(PeerRecord::from_service(&service(&[("name", "Ada")], vec![ip])).is_none());
        assert!(PeerRecord::from_service(&service(&[("pid", " ")], vec![ip])).is_none());
        assert!(PeerRecord::from_service(&service(&[("pid", "abcd")], vec![])).is_none());

        let nameless = PeerRecord::from_service(&service(&[("pid", "abcd")], vec![ip])).unwrap();
        assert_eq!(nameless.display_name, "Guest");
    }
}
