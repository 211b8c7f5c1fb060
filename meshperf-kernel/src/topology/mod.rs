//! Génération de topologie: quel endpoint teste contre lequel, sur quel port.
//!
//! Un [`TopologySpec`] est validé une fois (groupes, port de départ, budget de
//! ports) puis produit ses [`ConnectionPair`] à la demande. Le formatage des
//! commandes vit dans [`scripts`] et n'influence jamais l'énumération.

pub mod scripts;

use serde::{Deserialize, Serialize};

use crate::models::{ConnectionPair, Endpoint, EndpointGroup, Pattern};

pub const MAX_PORT: u16 = u16::MAX;

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not enough ports from {start_port}: required {required}, available {available}")]
    PortBudgetExceeded {
        start_port: u16,
        required: u64,
        available: u64,
    },
    #[error("no resolved address for listener host {host}")]
    PeerResolution { host: String },
}

/// Manière de combiner deux groupes d'endpoints en paires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingRule {
    /// Union des deux groupes, chaque endpoint contre tous les autres
    AllPairs,
    /// Chaque endpoint serveur écoute chaque endpoint client
    Bipartite,
    /// Hôtes appariés par index, cartes décalées d'un cran
    IndexedStaggered,
    /// Groupe serveur seul, diagonale comprise
    AllPairsWithSelf,
}

impl From<Pattern> for PairingRule {
    fn from(p: Pattern) -> Self {
        match p {
            Pattern::FullMesh => PairingRule::AllPairs,
            Pattern::InCast => PairingRule::Bipartite,
            Pattern::P2P => PairingRule::IndexedStaggered,
            Pattern::LocalTest => PairingRule::AllPairsWithSelf,
        }
    }
}

/// Groupe serveur, groupe client et règle qui les combine.
///
/// Jamais modifié sur place; [`TopologyRoles::swapped`] construit une nouvelle valeur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyRoles {
    pub pattern: Pattern,
    pub rule: PairingRule,
    pub server: EndpointGroup,
    pub client: EndpointGroup,
}

impl TopologyRoles {
    pub fn for_pattern(pattern: Pattern, server: EndpointGroup, client: EndpointGroup) -> Self {
        Self {
            pattern,
            rule: pattern.into(),
            server,
            client,
        }
    }

    pub fn swapped(&self) -> Self {
        Self {
            pattern: self.pattern,
            rule: self.rule,
            server: self.client.clone(),
            client: self.server.clone(),
        }
    }

    /// Hôtes des deux groupes, dédoublonnés, serveurs d'abord
    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for h in self.server.hosts.iter().chain(&self.client.hosts) {
            if !hosts.contains(h) {
                hosts.push(h.clone());
            }
        }
        hosts
    }
}

/// Énumération validée d'une passe de génération.
#[derive(Debug, Clone)]
pub struct TopologySpec {
    roles: TopologyRoles,
    start_port: u16,
    listeners: Vec<Endpoint>,
    initiators: Vec<Endpoint>,
    total: u64,
}

impl TopologySpec {
    /// Échoue tôt avec `Configuration` ou `PortBudgetExceeded`; rien n'est encore énuméré.
    pub fn new(roles: &TopologyRoles, start_port: u16) -> Result<Self, TopologyError> {
        if start_port == 0 {
            return Err(TopologyError::Configuration("start port must be greater than 0".into()));
        }
        let server = &roles.server;
        let client = &roles.client;

        let (listeners, initiators, total) = match roles.rule {
            PairingRule::AllPairs => {
                let mut all = server.endpoints();
                for ep in client.endpoints() {
                    if !all.contains(&ep) {
                        all.push(ep);
                    }
                }
                if all.len() < 2 {
                    return Err(TopologyError::Configuration(format!(
                        "{} needs at least two endpoints, got {}",
                        roles.pattern,
                        all.len()
                    )));
                }
                let n = all.len() as u64;
                (all.clone(), all, n * (n - 1))
            }
            PairingRule::Bipartite => {
                require_group("server", server)?;
                require_group("client", client)?;
                let total = server.len() as u64 * client.len() as u64;
                (server.endpoints(), client.endpoints(), total)
            }
            PairingRule::IndexedStaggered => {
                require_group("server", server)?;
                require_group("client", client)?;
                if server.hosts.len() != client.hosts.len() {
                    return Err(TopologyError::Configuration(format!(
                        "p2p needs as many server hosts as client hosts ({} != {})",
                        server.hosts.len(),
                        client.hosts.len()
                    )));
                }
                let total = server.hosts.len() as u64 * server.adapters.len() as u64;
                (Vec::new(), Vec::new(), total)
            }
            PairingRule::AllPairsWithSelf => {
                require_group("server", server)?;
                let eps = server.endpoints();
                let n = eps.len() as u64;
                (eps.clone(), eps, n * n)
            }
        };

        let available = available_ports(start_port);
        if total > available {
            return Err(TopologyError::PortBudgetExceeded {
                start_port,
                required: total,
                available,
            });
        }

        Ok(Self {
            roles: roles.clone(),
            start_port,
            listeners,
            initiators,
            total,
        })
    }

    pub fn roles(&self) -> &TopologyRoles {
        &self.roles
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    pub fn total_pairs(&self) -> u64 {
        self.total
    }

    /// Paires dans l'ordre de génération, ports contigus depuis le port de départ.
    pub fn pairs(&self) -> impl Iterator<Item = ConnectionPair> + '_ {
        self.endpoint_pairs()
            .zip(self.start_port..=MAX_PORT)
            .map(|((listener, initiator), port)| ConnectionPair::new(listener, initiator, port))
    }

    /// Hôtes qui écoutent dans au moins une paire, par ordre d'apparition
    pub fn listener_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for pair in self.pairs() {
            let host = &pair.listener().host;
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }

    fn endpoint_pairs(&self) -> Box<dyn Iterator<Item = (Endpoint, Endpoint)> + '_> {
        match self.roles.rule {
            PairingRule::AllPairs => Box::new(self.listeners.iter().flat_map(move |l| {
                self.initiators
                    .iter()
                    .filter(move |i| *i != l)
                    .map(move |i| (l.clone(), i.clone()))
            })),
            PairingRule::Bipartite | PairingRule::AllPairsWithSelf => {
                Box::new(self.listeners.iter().flat_map(move |l| {
                    self.initiators.iter().map(move |i| (l.clone(), i.clone()))
                }))
            }
            PairingRule::IndexedStaggered => {
                let server = &self.roles.server;
                let client = &self.roles.client;
                Box::new(server.hosts.iter().zip(&client.hosts).flat_map(
                    move |(s_host, c_host)| {
                        server.adapters.iter().enumerate().map(move |(i, s_adapter)| {
                            let c_adapter = &client.adapters[(i + 1) % client.adapters.len()];
                            (Endpoint::new(s_host, s_adapter), Endpoint::new(c_host, c_adapter))
                        })
                    },
                ))
            }
        }
    }
}

fn require_group(name: &str, group: &EndpointGroup) -> Result<(), TopologyError> {
    if group.is_empty() {
        return Err(TopologyError::Configuration(format!(
            "{name} group needs at least one host and one adapter"
        )));
    }
    Ok(())
}

/// Ports utilisables de `start_port` à 65535 inclus
pub fn available_ports(start_port: u16) -> u64 {
    MAX_PORT as u64 - start_port as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn group(hosts: &[&str], adapters: &[&str]) -> EndpointGroup {
        EndpointGroup::new(hosts.iter().copied(), adapters.iter().copied())
    }

    fn roles(pattern: Pattern, server: EndpointGroup, client: EndpointGroup) -> TopologyRoles {
        TopologyRoles::for_pattern(pattern, server, client)
    }

    #[test]
    fn test_fullmesh_two_hosts() {
        let r = roles(Pattern::FullMesh, group(&["a"], &["mlx5_0"]), group(&["b"], &["mlx5_0"]));
        let spec = TopologySpec::new(&r, 20000).unwrap();
        let pairs: Vec<_> = spec.pairs().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs.iter().map(|p| p.port).collect::<Vec<_>>(), vec![20000, 20001]);
        assert_eq!(pairs[0].listener().host, "a");
        assert_eq!(pairs[0].initiator().host, "b");
        assert_eq!(pairs[1].listener().host, "b");
    }

    #[test]
    fn test_fullmesh_union_deduplicates() {
        let r = roles(
            Pattern::FullMesh,
            group(&["a", "b"], &["mlx5_0"]),
            group(&["b", "c"], &["mlx5_0"]),
        );
        let spec = TopologySpec::new(&r, 20000).unwrap();
        assert_eq!(spec.total_pairs(), 6);
        assert_eq!(spec.pairs().count(), 6);
        assert!(spec.pairs().all(|p| p.listener() != p.initiator()));
    }

    #[test]
    fn test_incast_scenario() {
        let r = roles(
            Pattern::InCast,
            group(&["srv"], &["mlx5_0", "mlx5_1"]),
            group(&["c1", "c2"], &["mlx5_0"]),
        );
        let spec = TopologySpec::new(&r, 20000).unwrap();
        let pairs: Vec<_> = spec.pairs().collect();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs.first().unwrap().port, 20000);
        assert_eq!(pairs.last().unwrap().port, 20003);
        assert!(pairs.iter().all(|p| p.listener().host == "srv"));
        assert_eq!(spec.listener_hosts(), vec!["srv"]);
    }

    #[test]
    fn test_p2p_staggered_adapters() {
        let adapters = ["mlx5_0", "mlx5_1", "mlx5_2"];
        let r = roles(Pattern::P2P, group(&["s1"], &adapters), group(&["c1"], &adapters));
        let spec = TopologySpec::new(&r, 20000).unwrap();
        let pairs: Vec<_> = spec.pairs().collect();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].port, 20000);
        assert_eq!(pairs[0].listener().adapter, "mlx5_0");
        assert_eq!(pairs[0].initiator().adapter, "mlx5_1");
        assert_eq!(pairs[2].initiator().adapter, "mlx5_0");
        assert!(pairs.iter().all(|p| p.listener().adapter != p.initiator().adapter));
    }

    #[test]
    fn test_p2p_host_count_mismatch() {
        let r = roles(Pattern::P2P, group(&["s1", "s2"], &["m"]), group(&["c1"], &["m"]));
        assert!(matches!(TopologySpec::new(&r, 20000), Err(TopologyError::Configuration(_))));
    }

    #[test]
    fn test_localtest_includes_diagonal() {
        let r = roles(Pattern::LocalTest, group(&["a"], &["m0", "m1"]), EndpointGroup::default());
        let spec = TopologySpec::new(&r, 20000).unwrap();
        let pairs: Vec<_> = spec.pairs().collect();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs.iter().filter(|p| p.listener() == p.initiator()).count(), 2);
    }

    #[test]
    fn test_port_budget_exceeded() {
        let r = roles(
            Pattern::InCast,
            group(&["s"], &["m0", "m1"]),
            group(&["c1", "c2"], &["m0"]),
        );
        let err = TopologySpec::new(&r, 65534).unwrap_err();
        match err {
            TopologyError::PortBudgetExceeded { required, available, .. } => {
                assert_eq!(required, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(TopologySpec::new(&r, 65532).unwrap().pairs().last().unwrap().port, 65535);
    }

    #[test]
    fn test_zero_start_port_and_empty_groups() {
        let r = roles(Pattern::InCast, group(&["s"], &["m"]), group(&["c"], &["m"]));
        assert!(matches!(TopologySpec::new(&r, 0), Err(TopologyError::Configuration(_))));

        let r = roles(Pattern::InCast, group(&["s"], &["m"]), EndpointGroup::default());
        assert!(matches!(TopologySpec::new(&r, 20000), Err(TopologyError::Configuration(_))));

        let r = roles(Pattern::FullMesh, group(&["s"], &["m"]), EndpointGroup::default());
        assert!(matches!(TopologySpec::new(&r, 20000), Err(TopologyError::Configuration(_))));
    }

    #[test]
    fn test_swapped_is_new_value() {
        let r = roles(Pattern::InCast, group(&["s"], &["m0"]), group(&["c"], &["m1"]));
        let back = r.swapped();
        assert_eq!(back.server.hosts, vec!["c"]);
        assert_eq!(back.client.hosts, vec!["s"]);
        assert_eq!(r.server.hosts, vec!["s"]);
        assert_eq!(back.swapped(), r);
    }

    fn arb_pattern() -> impl Strategy<Value = Pattern> {
        prop_oneof![
            Just(Pattern::FullMesh),
            Just(Pattern::InCast),
            Just(Pattern::P2P),
            Just(Pattern::LocalTest),
        ]
    }

    proptest! {
        #[test]
        fn prop_ports_unique_and_contiguous(
            pattern in arb_pattern(),
            hosts in 1usize..4,
            s_adapters in 1usize..4,
            c_adapters in 1usize..4,
            start in 1024u16..60000,
        ) {
            let s_hosts: Vec<String> = (0..hosts).map(|i| format!("s{i}")).collect();
            let c_hosts: Vec<String> = (0..hosts).map(|i| format!("c{i}")).collect();
            let s_ad: Vec<String> = (0..s_adapters).map(|i| format!("mlx5_{i}")).collect();
            let c_ad: Vec<String> = (0..c_adapters).map(|i| format!("mlx5_{i}")).collect();
            let r = roles(pattern, EndpointGroup::new(s_hosts, s_ad), EndpointGroup::new(c_hosts, c_ad));

            let spec = TopologySpec::new(&r, start).unwrap();
            let pairs: Vec<_> = spec.pairs().collect();
            prop_assert_eq!(pairs.len() as u64, spec.total_pairs());

            let ports: Vec<u16> = pairs.iter().map(|p| p.port).collect();
            let expected: Vec<u16> = (0..pairs.len()).map(|i| start + i as u16).collect();
            prop_assert_eq!(&ports, &expected);
            prop_assert_eq!(ports.iter().collect::<HashSet<_>>().len(), ports.len());

            let n_server = hosts * s_adapters;
            let n_client = hosts * c_adapters;
            let expected_count = match pattern {
                Pattern::FullMesh => (n_server + n_client) * (n_server + n_client - 1),
                Pattern::InCast => n_server * n_client,
                Pattern::P2P => hosts * s_adapters,
                Pattern::LocalTest => n_server * n_server,
            };
            prop_assert_eq!(pairs.len(), expected_count);
        }
    }
}
