use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Error, Result};
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketProtocol {
    Tcp,
    Udp,
}

impl SocketProtocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketProtocol {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => bail!("unsupported protocol: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ExposedPort {
    pub protocol: SocketProtocol,
    pub port: u16,
}

/// An inclusive range of host ports for one protocol. Single ports have `from_port == to_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ExposedPortRange {
    pub protocol: SocketProtocol,
    pub from_port: u16,
    pub to_port: u16,
}

impl From<ExposedPort> for ExposedPortRange {
    fn from(port: ExposedPort) -> Self {
        Self::single(port.protocol, port.port)
    }
}

impl ExposedPortRange {
    #[must_use]
    pub fn single(protocol: SocketProtocol, port: u16) -> Self {
        Self {
            protocol,
            from_port: port,
            to_port: port,
        }
    }

    /// # Errors
    /// Returns an error if either bound is zero or the range is reversed.
    pub fn new(protocol: SocketProtocol, from_port: u16, to_port: u16) -> Result<Self> {
        if from_port == 0 || to_port == 0 {
            bail!("port 0 cannot be opened");
        }
        if from_port > to_port {
            bail!("port range {from_port}-{to_port} is reversed");
        }

        Ok(Self {
            protocol,
            from_port,
            to_port,
        })
    }

    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.from_port <= other.from_port
            && other.to_port <= self.to_port
    }

    /// Rule text accepted by `ufw allow`.
    #[must_use]
    pub fn ufw_rule(&self) -> String {
        if self.from_port == self.to_port {
            format!("{}/{}", self.from_port, self.protocol)
        } else {
            format!("{}:{}/{}", self.from_port, self.to_port, self.protocol)
        }
    }

    /// Parses `port` or `from-to`, as used in compose files and firewall settings.
    ///
    /// # Errors
    /// Returns an error for anything other than one or two decimal ports in range.
    pub fn parse_ports(protocol: SocketProtocol, value: &str) -> Result<Self> {
        let regex = Regex::new(r"^(\d+)(?:-(\d+))?$")
            .map_err(|error| anyhow!("invalid port validator: {error}"))?;

        let captures = regex
            .captures(value.trim())
            .ok_or_else(|| anyhow!("invalid port specification: {value}"))?;

        let from_port = captures[1]
            .parse::<u16>()
            .map_err(|_| anyhow!("port out of range: {value}"))?;
        let to_port = match captures.get(2) {
            Some(to_port) => to_port
                .as_str()
                .parse::<u16>()
                .map_err(|_| anyhow!("port out of range: {value}"))?,
            None => from_port,
        };

        Self::new(protocol, from_port, to_port)
    }
}

impl fmt::Display for ExposedPortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from_port == self.to_port {
            write!(f, "{}/{}", self.from_port, self.protocol)
        } else {
            write!(f, "{}-{}/{}", self.from_port, self.to_port, self.protocol)
        }
    }
}

/// Parses `22`, `22/tcp` or `1000-1001/udp`. The protocol defaults to TCP.
impl FromStr for ExposedPortRange {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (ports, protocol) = match value.trim().split_once('/') {
            Some((ports, protocol)) => (ports, protocol.parse()?),
            None => (value.trim(), SocketProtocol::Tcp),
        };

        Self::parse_ports(protocol, ports)
    }
}

/// Merges the ports the orchestrator needs with the ports a workload exposes.
///
/// The result is sorted, holds no duplicates and drops ranges already covered by a wider range
/// of the same protocol, so submitting it twice opens nothing new.
#[must_use]
pub fn resolve_firewall_ports(
    required: &[ExposedPortRange],
    exposed: &[ExposedPortRange],
) -> Vec<ExposedPortRange> {
    let unique = required
        .iter()
        .chain(exposed)
        .copied()
        .collect::<BTreeSet<_>>();

    unique
        .iter()
        .filter(|range| {
            !unique
                .iter()
                .any(|other| other != *range && other.contains(range))
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(from_port: u16, to_port: u16) -> ExposedPortRange {
        ExposedPortRange::new(SocketProtocol::Tcp, from_port, to_port).expect("range")
    }

    #[test]
    fn parse_accepts_single_ports_ranges_and_protocols() {
        assert_eq!("22".parse::<ExposedPortRange>().expect("parse"), tcp(22, 22));
        assert_eq!(
            "1000-1001/TCP".parse::<ExposedPortRange>().expect("parse"),
            tcp(1000, 1001)
        );
        assert_eq!(
            " 53/udp ".parse::<ExposedPortRange>().expect("parse"),
            ExposedPortRange::single(SocketProtocol::Udp, 53)
        );
        assert!("0/tcp".parse::<ExposedPortRange>().is_err());
        assert!("70000/tcp".parse::<ExposedPortRange>().is_err());
        assert!("10-5/tcp".parse::<ExposedPortRange>().is_err());
        assert!("22/sctp".parse::<ExposedPortRange>().is_err());
        assert!("http".parse::<ExposedPortRange>().is_err());
    }

    #[test]
    fn resolver_returns_required_ports_when_nothing_is_exposed() {
        let required = vec![tcp(22, 22)];
        assert_eq!(resolve_firewall_ports(&required, &[]), required);
    }

    #[test]
    fn resolver_merges_required_and_exposed_ports() {
        let required = vec![tcp(1000, 1001)];
        let exposed = vec![
            ExposedPort {
                protocol: SocketProtocol::Tcp,
                port: 1337,
            }
            .into(),
            tcp(1337, 1337),
        ];

        let resolved = resolve_firewall_ports(&required, &exposed);
        assert_eq!(resolved, vec![tcp(1000, 1001), tcp(1337, 1337)]);

        let reversed = resolve_firewall_ports(&exposed, &required);
        assert_eq!(reversed, resolved);
    }

    #[test]
    fn resolver_drops_ranges_covered_by_wider_ranges_of_the_same_protocol() {
        let required = vec![tcp(8000, 8010)];
        let exposed = vec![
            tcp(8005, 8005),
            ExposedPortRange::single(SocketProtocol::Udp, 8005),
        ];

        let resolved = resolve_firewall_ports(&required, &exposed);
        assert_eq!(
            resolved,
            vec![
                tcp(8000, 8010),
                ExposedPortRange::single(SocketProtocol::Udp, 8005)
            ]
        );
    }

    #[test]
    fn ufw_rules_use_colon_ranges() {
        assert_eq!(tcp(22, 22).ufw_rule(), "22/tcp");
        assert_eq!(tcp(1000, 1001).ufw_rule(), "1000:1001/tcp");
        assert_eq!(tcp(1000, 1001).to_string(), "1000-1001/tcp");
    }
}
