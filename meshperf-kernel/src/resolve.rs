use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::remote::RemoteExec;
use crate::topology::TopologyError;

#[derive(Debug, thiserror::Error)]
#[error("could not resolve {} host(s): {}", .failures.len(), render(.failures))]
pub struct ResolveError {
    pub failures: BTreeMap<String, String>,
}

fn render(failures: &BTreeMap<String, String>) -> String {
    failures
        .iter()
        .map(|(h, r)| format!("{h} ({r})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Adresse data-plane de chaque hôte listener.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerAddresses(BTreeMap<String, String>);

impl PeerAddresses {
    pub fn get(&self, host: &str) -> Result<&str, TopologyError> {
        self.0
            .get(host)
            .map(String::as_str)
            .ok_or_else(|| TopologyError::PeerResolution { host: host.to_string() })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for PeerAddresses {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub fn address_command(interface: &str) -> String {
    format!(
        "ip addr show {} | grep 'inet ' | awk '{{print $2}}' | cut -d'/' -f1",
        shell_words::quote(interface)
    )
}

/// Résout tous les hôtes en parallèle. Un seul hôte sans adresse fait échouer
/// toute la résolution; aucune adresse n'est jamais devinée.
pub async fn resolve_peers<E>(remote: &E, hosts: &[String], interface: &str) -> Result<PeerAddresses, ResolveError>
where
    E: RemoteExec + ?Sized,
{
    let cmd = address_command(interface);
    let cmd = cmd.as_str();
    let lookups = hosts.iter().map(|host| async move {
        let outcome = match remote.exec(host, cmd).await {
            Ok(res) if res.success() => match res.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                Some(ip) => Ok(ip.to_string()),
                None => Err(format!("no inet address on {interface}")),
            },
            Ok(res) => Err(res.diagnostic()),
            Err(e) => Err(e.to_string()),
        };
        (host.clone(), outcome)
    });

    let mut addresses = BTreeMap::new();
    let mut failures = BTreeMap::new();
    for (host, outcome) in join_all(lookups).await {
        match outcome {
            Ok(ip) => {
                debug!(%host, %ip, "[resolve] peer address");
                addresses.insert(host, ip);
            }
            Err(reason) => {
                failures.insert(host, reason);
            }
        }
    }

    if !failures.is_empty() {
        return Err(ResolveError { failures });
    }
    info!(hosts = addresses.len(), "[resolve] peer addresses resolved");
    Ok(PeerAddresses(addresses))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_command() {
        assert_eq!(
            address_command("bond0"),
            "ip addr show bond0 | grep 'inet ' | awk '{print $2}' | cut -d'/' -f1"
        );
    }

    #[test]
    fn test_missing_host_is_peer_resolution_error() {
        let peers = PeerAddresses::from_iter([("a".to_string(), "10.0.0.1".to_string())]);
        assert_eq!(peers.get("a").unwrap(), "10.0.0.1");
        assert!(matches!(peers.get("b"), Err(TopologyError::PeerResolution { .. })));
    }
}
