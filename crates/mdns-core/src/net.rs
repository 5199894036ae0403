use std::io::Error;
use std::net::IpAddr;
use crate::model::InterfaceIp;

pub fn list_interface_ips() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            let family = if ip.is_ipv4() {"ipv4"} else {"ipv6"};
            let is_loopback = ip.is_loopback();

            InterfaceIp {
                name: ifa.name,
                ip,
                family,
                is_loopback,
            }
        }).collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Address to announce: on `interface` if given, otherwise the first
/// non-loopback one. IPv4 wins over IPv6.
pub fn pick_ip(ips: &[InterfaceIp], interface: Option<&str>) -> Option<IpAddr> {
    let candidates: Vec<&InterfaceIp> = ips
        .iter()
        .filter(|i| match interface {
            Some(name) => i.name == name,
            None => !i.is_loopback,
        })
        .collect();

    candidates
        .iter()
        .find(|i| i.ip.is_ipv4())
        .or_else(|| candidates.first())
        .map(|i| i.ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(name: &str, addr: &str) -> InterfaceIp {
        let ip: IpAddr = addr.parse().unwrap();
        InterfaceIp {
            name: name.to_string(),
            ip,
            family: if ip.is_ipv4() { "ipv4" } else { "ipv6" },
            is_loopback: ip.is_loopback(),
        }
    }

    #[test]
    fn test_pick_ip() {
        let ips = vec![
            ip("eth0", "fe80::1"),
            ip("eth0", "192.168.1.5"),
            ip("lo", "127.0.0.1"),
            ip("wlan0", "fe80::2"),
        ];

        assert_eq!(pick_ip(&ips, None), Some("192.168.1.5".parse().unwrap()));
        assert_eq!(pick_ip(&ips, Some("lo")), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(pick_ip(&ips, Some("wlan0")), Some("fe80::2".parse().unwrap()));
        assert_eq!(pick_ip(&ips, Some("eth9")), None);
    }
}
