use crate::model::{ServiceAnnouncement, TXT_DISPLAY_NAME, TXT_PARTICIPANT_ID};
use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;

/// Handle so the service stays registered while this is alive.
pub struct Announcer {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcer {
    pub fn register(ann: ServiceAnnouncement) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        // Ensure trailing dots as mdns-sd expects FQDNs.
        let service_type = ensure_dot(&ann.service_type);
        let host_name = ensure_dot(&ann.host_name);

        let info = ServiceInfo::new(
            &service_type,
            &ann.instance_name,
            &host_name,
            &ann.ip_addr.to_string(),
            ann.port,
            ann.txt,
        )?;

        daemon.register(info.clone())?;
        tracing::debug!("Registered {} at {}:{}", info.get_fullname(), ann.ip_addr, ann.port);
        Ok(Self {
            daemon,
            fullname: info.get_fullname().to_string(),
        })
    }

    /// Announce this participant's transfer listener.
    pub fn for_participant(
        service_type: &str,
        participant_id: &str,
        display_name: &str,
        ip_addr: IpAddr,
        port: u16,
    ) -> Result<Self> {
        let short_id: String = participant_id.chars().take(8).collect();
        Self::register(ServiceAnnouncement {
            service_type: service_type.to_string(),
            instance_name: instance_name(display_name, &short_id),
            host_name: format!("fileshare-{}.local.", short_id),
            ip_addr,
            port,
            txt: participant_txt(participant_id, display_name),
        })
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            tracing::debug!("Failed to unregister {}: {}", self.fullname, e);
        }
    }
}

pub fn participant_txt(participant_id: &str, display_name: &str) -> HashMap<String, String> {
    HashMap::from([
        (TXT_PARTICIPANT_ID.to_string(), participant_id.to_string()),
        (TXT_DISPLAY_NAME.to_string(), display_name.to_string()),
    ])
}

/// DNS labels are limited to 63 bytes.
fn instance_name(display_name: &str, short_id: &str) -> String {
    let mut name: String = display_name
        .chars()
        .filter(|c| !c.is_control() && *c != '.')
        .collect();
    while name.len() > 50 {
        name.pop();
    }
    if name.trim().is_empty() {
        name = "Guest".to_string();
    }
    format!("{}-{}", name.trim(), short_id)
}

fn ensure_dot(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{}.", s)
    }
}
