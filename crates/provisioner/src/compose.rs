//! Static extraction of host-bound ports from Docker Compose documents.

use serde_yaml::Value;

use crate::firewall::{ExposedPortRange, SocketProtocol};

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("compose document is not valid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("compose document is malformed: {0}")]
    Malformed(String),
    #[error("service {service} has an invalid port mapping `{mapping}`: {reason}")]
    InvalidPort {
        service: String,
        mapping: String,
        reason: String,
    },
}

/// Returns every host port the document publishes, in declaration order.
///
/// Container-only ports and ephemeral host ports are not part of the result.
///
/// # Errors
/// Returns an error if the YAML cannot be parsed or a port mapping is malformed.
pub fn parse_exposed_ports(document: &str) -> Result<Vec<ExposedPortRange>, ComposeError> {
    let root: Value = serde_yaml::from_str(document)?;

    let services = match root.get("services") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Mapping(services)) => services,
        Some(_) => {
            return Err(ComposeError::Malformed(
                "`services` must be a mapping".to_string(),
            ))
        }
    };

    let mut exposed = Vec::new();
    for (name, service) in services {
        let service_name = name.as_str().unwrap_or("<unnamed>").to_string();

        let ports = match service.get("ports") {
            None | Some(Value::Null) => continue,
            Some(Value::Sequence(ports)) => ports,
            Some(_) => {
                return Err(ComposeError::Malformed(format!(
                    "`services.{service_name}.ports` must be a list"
                )))
            }
        };

        for entry in ports {
            if let Some(range) = parse_port_entry(&service_name, entry)? {
                exposed.push(range);
            }
        }
    }

    Ok(exposed)
}

fn parse_port_entry(
    service: &str,
    entry: &Value,
) -> Result<Option<ExposedPortRange>, ComposeError> {
    match entry {
        Value::Number(_) => Ok(None),
        Value::String(mapping) => parse_short_syntax(service, mapping),
        Value::Mapping(_) => parse_long_syntax(service, entry),
        other => Err(invalid(service, &format!("{other:?}"), "unsupported value")),
    }
}

/// `[ip:]host:container[/protocol]`, where ports may be ranges and IPv6 hosts are bracketed.
fn parse_short_syntax(
    service: &str,
    mapping: &str,
) -> Result<Option<ExposedPortRange>, ComposeError> {
    let (ports, protocol) = match mapping.rsplit_once('/') {
        Some((ports, protocol)) => (
            ports,
            protocol
                .parse::<SocketProtocol>()
                .map_err(|error| invalid(service, mapping, &error.to_string()))?,
        ),
        None => (mapping, SocketProtocol::Tcp),
    };

    let without_ip = match ports.strip_prefix('[') {
        Some(rest) => match rest.split_once("]:") {
            Some((_, rest)) => rest,
            None => return Err(invalid(service, mapping, "unterminated IPv6 address")),
        },
        None => ports,
    };

    let segments = without_ip.split(':').collect::<Vec<_>>();
    let host_ports = match segments.as_slice() {
        [_container] => return Ok(None),
        [.., host, _container] => *host,
        [] => return Err(invalid(service, mapping, "empty mapping")),
    };

    if host_ports.is_empty() {
        return Ok(None);
    }

    ExposedPortRange::parse_ports(protocol, host_ports)
        .map(Some)
        .map_err(|error| invalid(service, mapping, &error.to_string()))
}

fn parse_long_syntax(
    service: &str,
    entry: &Value,
) -> Result<Option<ExposedPortRange>, ComposeError> {
    let protocol = match entry.get("protocol") {
        None | Some(Value::Null) => SocketProtocol::Tcp,
        Some(Value::String(protocol)) => protocol
            .parse::<SocketProtocol>()
            .map_err(|error| invalid(service, protocol, &error.to_string()))?,
        Some(other) => {
            return Err(invalid(
                service,
                &format!("{other:?}"),
                "protocol must be a string",
            ))
        }
    };

    let published = match entry.get("published") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(published)) if published.trim().is_empty() => return Ok(None),
        Some(Value::String(published)) => published.clone(),
        Some(other) => {
            return Err(invalid(
                service,
                &format!("{other:?}"),
                "published must be a port or range",
            ))
        }
    };

    ExposedPortRange::parse_ports(protocol, &published)
        .map(Some)
        .map_err(|error| invalid(service, &published, &error.to_string()))
}

fn invalid(service: &str, mapping: &str, reason: &str) -> ComposeError {
    ComposeError::InvalidPort {
        service: service.to_string(),
        mapping: mapping.to_string(),
        reason: reason.to_string(),
    }
}
