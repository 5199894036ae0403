use crate::model::{DiscoveredService, PeerRecord};
use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Collect every service of `service_type` resolved within `timeout`.
pub fn browse_blocking(service_type: &str, timeout: Duration) -> Result<Vec<DiscoveredService>> {
    let daemon = ServiceDaemon::new()?;
    let service_type = if service_type.ends_with('.') {
        service_type.to_string()
    } else {
        format!("{}.", service_type)
    };

    let receiver = daemon.browse(&service_type)?;
    let mut out = Vec::new();

    let start = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        let Ok(event) = receiver.recv_timeout(remaining) else {
            continue;
        };
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let txt = info
                    .get_properties()
                    .iter()
                    .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
                    .collect::<Vec<_>>();

                out.push(DiscoveredService {
                    fullname: info.get_fullname().to_string(),
                    host_name: info.get_hostname().to_string(),
                    port: info.get_port(),
                    addresses: info.get_addresses().iter().copied().collect(),
                    txt,
                });
            }
            ServiceEvent::ServiceFound(service_type, fullname) => {
                tracing::debug!("Found {} ({})", fullname, service_type);
            }
            _ => {}
        }
    }

    if let Err(e) = daemon.shutdown() {
        tracing::debug!("mDNS daemon shutdown: {}", e);
    }
    Ok(out)
}

/// Participants announcing `service_type`, excluding `own_id`. A participant
/// announcing more than once is reported once.
pub fn browse_peers(service_type: &str, timeout: Duration, own_id: &str) -> Result<Vec<PeerRecord>> {
    Ok(peers_from(browse_blocking(service_type, timeout)?, own_id))
}

fn peers_from(services: Vec<DiscoveredService>, own_id: &str) -> Vec<PeerRecord> {
    let mut peers: HashMap<String, PeerRecord> = HashMap::new();
    for service in &services {
        match PeerRecord::from_service(service) {
            Some(peer) if peer.participant_id != own_id => {
                peers.insert(peer.participant_id.clone(), peer);
            }
            Some(_) => {}
            None => tracing::debug!("Ignoring {}: no participant id or address", service.fullname),
        }
    }

    let mut out: Vec<PeerRecord> = peers.into_values().collect();
    out.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(pid: &str, ip: &str) -> DiscoveredService {
        DiscoveredService {
            fullname: format!("{}._fileshare._tcp.local.", pid),
            host_name: "host.local.".to_string(),
            port: 9876,
            addresses: vec![ip.parse().unwrap()],
            txt: vec![("pid".to_string(), pid.to_string())],
        }
    }

    #[test]
    fn test_peers_exclude_self_and_duplicates() {
        let peers = peers_from(
            vec![
                service("bbbb", "10.0.0.2"),
                service("me", "10.0.0.1"),
                service("aaaa", "10.0.0.3"),
                service("bbbb", "10.0.0.2"),
            ],
            "me",
        );

        let ids: Vec<&str> = peers.iter().map(|p| p.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["aaaa", "bbbb"]);
    }
}
