use serde::Serialize;
use std::collections::BTreeMap;

use super::{TopologyError, TopologySpec};
use crate::artifact::ArtifactName;
use crate::models::{ConnectionPair, Role, TestKind};
use crate::perftest::{CommandSettings, PerftestCommand};
use crate::resolve::PeerAddresses;

/// Séparateur entre sous-commandes d'un script d'hôte
pub const COMMAND_DELIMITER: &str = " && \\\n";

/// Commandes lancées par un hôte dans une phase, dans l'ordre des paires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostScript {
    pub host: String,
    pub commands: Vec<String>,
}

impl HostScript {
    /// Nombre de processus laissés en marche par ce script
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn render(&self) -> String {
        self.commands
            .iter()
            .map(|c| format!("( {c} )"))
            .collect::<Vec<_>>()
            .join(COMMAND_DELIMITER)
    }
}

/// Scripts par hôte pour un rôle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptBundle {
    pub role: Role,
    scripts: BTreeMap<String, HostScript>,
}

impl ScriptBundle {
    pub fn new(role: Role) -> Self {
        Self { role, scripts: BTreeMap::new() }
    }

    pub fn push(&mut self, host: &str, command: String) {
        self.scripts
            .entry(host.to_string())
            .or_insert_with(|| HostScript { host: host.to_string(), commands: Vec::new() })
            .commands
            .push(command);
    }

    pub fn hosts(&self) -> Vec<String> {
        self.scripts.keys().cloned().collect()
    }

    pub fn scripts(&self) -> impl Iterator<Item = &HostScript> {
        self.scripts.values()
    }

    pub fn get(&self, host: &str) -> Option<&HostScript> {
        self.scripts.get(host)
    }

    /// Nombre de processus attendus par hôte
    pub fn expectations(&self) -> BTreeMap<String, usize> {
        self.scripts
            .iter()
            .map(|(h, s)| (h.clone(), s.command_count()))
            .collect()
    }

    pub fn total_commands(&self) -> usize {
        self.scripts.values().map(HostScript::command_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Tout ce que produit une passe de génération.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptPlan {
    pub kind: TestKind,
    pub pairs: Vec<ConnectionPair>,
    pub server: ScriptBundle,
    pub client: ScriptBundle,
}

impl ScriptPlan {
    /// Range les commandes listener dans le lot serveur et les commandes
    /// initiateur dans le lot client. Chaque hôte listener doit être dans `peers`.
    pub fn build(
        spec: &TopologySpec,
        settings: &CommandSettings,
        peers: &PeerAddresses,
    ) -> Result<Self, TopologyError> {
        let pattern = spec.roles().pattern;
        let mut server = ScriptBundle::new(Role::Server);
        let mut client = ScriptBundle::new(Role::Client);
        let mut pairs = Vec::with_capacity(spec.total_pairs() as usize);

        for pair in spec.pairs() {
            let listener = pair.listener();
            let initiator = pair.initiator();
            let peer_ip = peers.get(&listener.host)?;

            let s_name = ArtifactName::for_pair(&pair, Role::Server, settings.kind, pattern).file_name();
            let c_name = ArtifactName::for_pair(&pair, Role::Client, settings.kind, pattern).file_name();

            server.push(
                &listener.host,
                PerftestCommand::listener(settings, &listener.adapter, pair.port)
                    .report_to(&s_name)
                    .render(),
            );
            client.push(
                &initiator.host,
                PerftestCommand::initiator(settings, &initiator.adapter, pair.port, peer_ip)
                    .report_to(&c_name)
                    .render(),
            );
            pairs.push(pair);
        }

        tracing::debug!(
            pairs = pairs.len(),
            server_hosts = server.scripts.len(),
            client_hosts = client.scripts.len(),
            "[topology] scripts built"
        );
        Ok(Self { kind: settings.kind, pairs, server, client })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::models::{EndpointGroup, Pattern};
    use crate::topology::TopologyRoles;

    fn incast() -> TopologySpec {
        let roles = TopologyRoles::for_pattern(
            Pattern::InCast,
            EndpointGroup::new(["srv"], ["mlx5_0", "mlx5_1"]),
            EndpointGroup::new(["c1", "c2"], ["mlx5_0"]),
        );
        TopologySpec::new(&roles, 20000).unwrap()
    }

    fn peers() -> PeerAddresses {
        PeerAddresses::from_iter([("srv".to_string(), "10.0.0.1".to_string())])
    }

    #[test]
    fn test_bundles_follow_pairs() {
        let settings = CommandSettings::from_config(&FleetConfig::default(), TestKind::Bandwidth);
        let plan = ScriptPlan::build(&incast(), &settings, &peers()).unwrap();

        assert_eq!(plan.pairs.len(), 4);
        assert_eq!(plan.server.hosts(), vec!["srv"]);
        assert_eq!(plan.server.expectations()["srv"], 4);
        assert_eq!(plan.client.expectations()["c1"], 2);
        assert_eq!(plan.client.total_commands(), 4);

        let srv = plan.server.get("srv").unwrap();
        assert!(srv.commands[0].contains("-p 20000"));
        assert!(srv.commands[0].contains("report_s_srv_mlx5_0_20000.json"));
        assert!(srv.commands[3].contains("-p 20003"));

        let c1 = plan.client.get("c1").unwrap();
        assert!(c1.commands.iter().all(|c| c.contains("10.0.0.1")));
        assert!(c1.commands[0].contains("report_c_c1_mlx5_0_20000.json"));
    }

    #[test]
    fn test_render_wraps_and_joins() {
        let script = HostScript {
            host: "h".into(),
            commands: vec!["a &".into(), "b &".into()],
        };
        assert_eq!(script.render(), "( a & ) && \\\n( b & )");
        assert_eq!(script.command_count(), 2);
    }

    #[test]
    fn test_unresolved_listener_is_error() {
        let settings = CommandSettings::from_config(&FleetConfig::default(), TestKind::Latency);
        let err = ScriptPlan::build(&incast(), &settings, &PeerAddresses::default()).unwrap_err();
        assert!(matches!(err, TopologyError::PeerResolution { host } if host == "srv"));
    }
}
