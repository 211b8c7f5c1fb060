use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Une carte sur un hôte, l'unité à partir de laquelle chaque paire est construite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub adapter: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            adapter: adapter.into(),
        }
    }

    /// Clé de matrice, `host:adapter`
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.adapter)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.adapter)
    }
}

/// Côté d'une paire: le listener (serveur/puits) ou l'initiateur (client/source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Jeton d'une lettre utilisé dans les noms de rapports
    pub fn marker(self) -> &'static str {
        match self {
            Role::Server => "s",
            Role::Client => "c",
        }
    }

    pub fn from_marker(token: &str) -> Option<Self> {
        match token {
            "s" => Some(Role::Server),
            "c" => Some(Role::Client),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }
}

/// Pattern de topologie choisi par `stream_type` dans la config de flotte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    FullMesh,
    InCast,
    P2P,
    LocalTest,
}

impl Pattern {
    pub const ALL: [Pattern; 4] = [
        Pattern::FullMesh,
        Pattern::InCast,
        Pattern::P2P,
        Pattern::LocalTest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Pattern::FullMesh => "fullmesh",
            Pattern::InCast => "incast",
            Pattern::P2P => "p2p",
            Pattern::LocalTest => "localtest",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == token)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binaire perftest qui pilote le lancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Bandwidth,
    Latency,
}

impl TestKind {
    pub fn tool(self) -> &'static str {
        match self {
            TestKind::Bandwidth => "ib_write_bw",
            TestKind::Latency => "ib_write_lat",
        }
    }
}

/// Relation de test orientée entre deux endpoints, avec son port.
///
/// `source_role` est le rôle joué par `source`. Les paires générées portent
/// toujours le listener en `source`; passer par [`ConnectionPair::listener`]
/// et [`ConnectionPair::initiator`] plutôt que de s'y fier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionPair {
    pub source: Endpoint,
    pub target: Endpoint,
    pub port: u16,
    pub source_role: Role,
}

impl ConnectionPair {
    pub fn new(listener: Endpoint, initiator: Endpoint, port: u16) -> Self {
        Self {
            source: listener,
            target: initiator,
            port,
            source_role: Role::Server,
        }
    }

    pub fn listener(&self) -> &Endpoint {
        match self.source_role {
            Role::Server => &self.source,
            Role::Client => &self.target,
        }
    }

    pub fn initiator(&self) -> &Endpoint {
        match self.source_role {
            Role::Server => &self.target,
            Role::Client => &self.source,
        }
    }

    /// Endpoint qui joue `role` dans cette paire
    pub fn endpoint(&self, role: Role) -> &Endpoint {
        match role {
            Role::Server => self.listener(),
            Role::Client => self.initiator(),
        }
    }
}

/// Hôtes et cartes d'un groupe de rôle. Chaque hôte porte toutes les cartes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointGroup {
    pub hosts: Vec<String>,
    pub adapters: Vec<String>,
}

impl EndpointGroup {
    /// Les doublons d'hôtes ou de cartes sont retirés, la première occurrence gagne.
    pub fn new<H, A>(hosts: H, adapters: A) -> Self
    where
        H: IntoIterator,
        H::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            hosts: dedup(hosts.into_iter().map(Into::into)),
            adapters: dedup(adapters.into_iter().map(Into::into)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() || self.adapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.len() * self.adapters.len()
    }

    /// Endpoints triés par hôte d'abord
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.hosts
            .iter()
            .flat_map(|h| self.adapters.iter().map(move |a| Endpoint::new(h, a)))
            .collect()
    }
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.filter(|i| seen.insert(i.clone())).collect()
}
