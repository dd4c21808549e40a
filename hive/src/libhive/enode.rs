//! Parsing and sanitizing of enode URLs reported by client containers.
//!
//! Clients report their p2p endpoint by shipping an `enode.sh` script. The
//! script runs inside the container, so the URL it prints may name a loopback
//! or wildcard address. Before handing the URL to simulators it is rewritten
//! to the container's IP on the simulation network.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::libhive::errors::{HiveError, HiveResult};

const DEFAULT_P2P_PORT: u16 = 30303;

fn enode_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // node id is the uncompressed secp256k1 public key, 64 bytes hex.
        Regex::new(r"^enode://([0-9a-fA-F]{128})@([^:@?]+|\[[0-9a-fA-F:.]+\]):(\d+)(\?discport=(\d+))?$")
            .unwrap_or_else(|_| unreachable!("pattern is constant"))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnodeUrl {
    pub node_id: String,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl FromStr for EnodeUrl {
    type Err = HiveError;

    fn from_str(s: &str) -> HiveResult<EnodeUrl> {
        let s = s.trim();
        let caps = enode_pattern()
            .captures(s)
            .ok_or_else(|| HiveError::BadRequest(format!("invalid enode URL {s:?}")))?;
        let host = caps[2].trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host
            .parse()
            .map_err(|_| HiveError::BadRequest(format!("enode URL has non-IP host {host:?}")))?;
        let tcp_port: u16 = caps[3]
            .parse()
            .map_err(|_| HiveError::BadRequest(format!("invalid enode TCP port in {s:?}")))?;
        let udp_port = match caps.get(5) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| HiveError::BadRequest(format!("invalid discport in {s:?}")))?,
            None => tcp_port,
        };
        Ok(EnodeUrl { node_id: caps[1].to_lowercase(), ip, tcp_port, udp_port })
    }
}

impl std::fmt::Display for EnodeUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "enode://{}@{}:{}", self.node_id, ip, self.tcp_port)?,
            IpAddr::V6(ip) => write!(f, "enode://{}@[{}]:{}", self.node_id, ip, self.tcp_port)?,
        }
        if self.udp_port != self.tcp_port {
            write!(f, "?discport={}", self.udp_port)?;
        }
        Ok(())
    }
}

impl EnodeUrl {
    /// Replaces the address with the container IP and fills in the default
    /// p2p port where the script reported port zero.
    pub fn rewritten_for(&self, container_ip: IpAddr) -> EnodeUrl {
        let mut fixed = self.clone();
        fixed.ip = container_ip;
        if fixed.tcp_port == 0 {
            fixed.tcp_port = DEFAULT_P2P_PORT;
        }
        if fixed.udp_port == 0 {
            fixed.udp_port = DEFAULT_P2P_PORT;
        }
        fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_ID: &str = "1ba850b467b3b96eacdcb6c133d2c7907878794dbdfc114269e7f5fdbfd4b55f6c8df9a4db48e5b9b6d8a0b29450054b262e85a6441eebb6f1591c0de7db0ccc";

    #[test]
    fn parse_and_rewrite() {
        let url: EnodeUrl =
            format!("enode://{NODE_ID}@127.0.0.1:8000").parse().unwrap();
        assert_eq!(url.tcp_port, 8000);
        assert_eq!(url.udp_port, 8000);

        let fixed = url.rewritten_for("172.17.0.3".parse().unwrap());
        assert_eq!(fixed.to_string(), format!("enode://{NODE_ID}@172.17.0.3:8000"));
    }

    #[test]
    fn zero_port_gets_default() {
        let url: EnodeUrl = format!("enode://{NODE_ID}@0.0.0.0:0?discport=0").parse().unwrap();
        let fixed = url.rewritten_for("172.17.0.3".parse().unwrap());
        assert_eq!(fixed.tcp_port, 30303);
        assert_eq!(fixed.udp_port, 30303);
        assert_eq!(fixed.to_string(), format!("enode://{NODE_ID}@172.17.0.3:30303"));
    }

    #[test]
    fn discport_is_preserved() {
        let url: EnodeUrl =
            format!("enode://{NODE_ID}@10.1.2.3:30303?discport=30304").parse().unwrap();
        assert_eq!(url.udp_port, 30304);
        assert!(url.to_string().ends_with("?discport=30304"));
    }

    #[test]
    fn rejects_garbage() {
        assert!("enode://nothex@1.2.3.4:30303".parse::<EnodeUrl>().is_err());
        assert!(format!("enode://{NODE_ID}@localhost:30303").parse::<EnodeUrl>().is_err());
        assert!("http://example.com".parse::<EnodeUrl>().is_err());
    }
}
