//! Grammaire des noms de rapports (version 1) et décodage du contenu.
//!
//! ```text
//! report_{c|s}_{host}_{adapter}_{port}.json
//! report_{host}_{adapter}_{port}.json                         (p2p)
//! latency_{pattern}_{c|s}_{host}_{adapter}_{to|from}_{peerHost}_{peerAdapter}_p{port}.json
//! ```
//!
//! Un hôte ne contient jamais `_`, une carte peut. L'hôte est le premier
//! jeton après le préfixe fixe, le port le dernier, la carte ce qui reste
//! entre les deux. `to`/`from` sont des séparateurs réservés en latence.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{ConnectionPair, Endpoint, Pattern, Role, TestKind};

pub const REPORT_EXT: &str = ".json";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact name {name}: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid payload in {path}: {source}")]
    Payload {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn invalid(name: &str, reason: impl Into<String>) -> ArtifactError {
    ArtifactError::InvalidName {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Nom de rapport décodé.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactName {
    Bandwidth {
        role: Role,
        endpoint: Endpoint,
        port: u16,
    },
    P2pBandwidth {
        endpoint: Endpoint,
        port: u16,
    },
    Latency {
        /// `None` pour l'ancienne forme sans pattern
        pattern: Option<Pattern>,
        role: Role,
        endpoint: Endpoint,
        peer: Endpoint,
        port: u16,
    },
}

impl ArtifactName {
    /// Nom du rapport écrit par le côté `role` de `pair`.
    pub fn for_pair(pair: &ConnectionPair, role: Role, kind: TestKind, pattern: Pattern) -> Self {
        let endpoint = pair.endpoint(role).clone();
        match (kind, pattern) {
            (TestKind::Bandwidth, Pattern::P2P) => ArtifactName::P2pBandwidth { endpoint, port: pair.port },
            (TestKind::Bandwidth, _) => ArtifactName::Bandwidth { role, endpoint, port: pair.port },
            (TestKind::Latency, _) => ArtifactName::Latency {
                pattern: Some(pattern),
                role,
                endpoint,
                peer: pair.endpoint(role.opposite()).clone(),
                port: pair.port,
            },
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            ArtifactName::Bandwidth { role, .. } | ArtifactName::Latency { role, .. } => Some(*role),
            ArtifactName::P2pBandwidth { .. } => None,
        }
    }

    /// Endpoint qui a écrit le rapport
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            ArtifactName::Bandwidth { endpoint, .. }
            | ArtifactName::P2pBandwidth { endpoint, .. }
            | ArtifactName::Latency { endpoint, .. } => endpoint,
        }
    }

    pub fn peer(&self) -> Option<&Endpoint> {
        match self {
            ArtifactName::Latency { peer, .. } => Some(peer),
            _ => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ArtifactName::Bandwidth { port, .. }
            | ArtifactName::P2pBandwidth { port, .. }
            | ArtifactName::Latency { port, .. } => *port,
        }
    }

    pub fn kind(&self) -> TestKind {
        match self {
            ArtifactName::Latency { .. } => TestKind::Latency,
            _ => TestKind::Bandwidth,
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            ArtifactName::Bandwidth { role, endpoint, port } => format!(
                "report_{}_{}_{}_{}{REPORT_EXT}",
                role.marker(),
                endpoint.host,
                endpoint.adapter,
                port
            ),
            ArtifactName::P2pBandwidth { endpoint, port } => {
                format!("report_{}_{}_{}{REPORT_EXT}", endpoint.host, endpoint.adapter, port)
            }
            ArtifactName::Latency { pattern, role, endpoint, peer, port } => {
                let prefix = match pattern {
                    Some(p) => format!("latency_{}_{}", p.as_str(), role.marker()),
                    None => format!("latency_{}", role.marker()),
                };
                format!(
                    "{prefix}_{}_{}_{}_{}_{}_p{port}{REPORT_EXT}",
                    endpoint.host,
                    endpoint.adapter,
                    direction_word(*role),
                    peer.host,
                    peer.adapter
                )
            }
        }
    }

    /// Décode n'importe quelle forme. `report_c_*`/`report_s_*` sont toujours lus
    /// comme la forme bande passante avec rôle; utiliser [`ArtifactName::parse_for`]
    /// quand le lancement est connu comme p2p.
    pub fn parse(name: &str) -> Result<Self, ArtifactError> {
        Self::parse_for(name, None)
    }

    pub fn parse_for(name: &str, pattern: Option<Pattern>) -> Result<Self, ArtifactError> {
        let stem = name
            .strip_suffix(REPORT_EXT)
            .ok_or_else(|| invalid(name, "missing .json extension"))?;

        if let Some(rest) = stem.strip_prefix("latency_") {
            return parse_latency(name, rest);
        }
        let rest = stem
            .strip_prefix("report_")
            .ok_or_else(|| invalid(name, "unknown prefix"))?;

        if pattern != Some(Pattern::P2P) {
            if let Some((marker, tail)) = rest.split_once('_') {
                if let Some(role) = Role::from_marker(marker) {
                    let (endpoint, port) = parse_endpoint_port(name, tail)?;
                    return Ok(ArtifactName::Bandwidth { role, endpoint, port });
                }
            }
        }
        let (endpoint, port) = parse_endpoint_port(name, rest)?;
        Ok(ArtifactName::P2pBandwidth { endpoint, port })
    }
}

fn direction_word(role: Role) -> &'static str {
    match role {
        Role::Client => "to",
        Role::Server => "from",
    }
}

/// `{host}_{adapter}_{port}`
fn parse_endpoint_port(name: &str, s: &str) -> Result<(Endpoint, u16), ArtifactError> {
    let (body, port) = s
        .rsplit_once('_')
        .ok_or_else(|| invalid(name, "missing port token"))?;
    let port = parse_port(name, port)?;
    let endpoint = parse_endpoint(name, body)?;
    Ok((endpoint, port))
}

/// `{host}_{adapter}`
fn parse_endpoint(name: &str, s: &str) -> Result<Endpoint, ArtifactError> {
    let (host, adapter) = s
        .split_once('_')
        .ok_or_else(|| invalid(name, "expected host_adapter"))?;
    if host.is_empty() || adapter.is_empty() {
        return Err(invalid(name, "empty host or adapter"));
    }
    Ok(Endpoint::new(host, adapter))
}

fn parse_port(name: &str, token: &str) -> Result<u16, ArtifactError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(name, format!("bad port token '{token}'")));
    }
    token
        .parse()
        .map_err(|_| invalid(name, format!("port {token} out of range")))
}

fn parse_latency(name: &str, rest: &str) -> Result<ArtifactName, ArtifactError> {
    let (first, tail) = rest
        .split_once('_')
        .ok_or_else(|| invalid(name, "truncated latency name"))?;

    let (pattern, role, tail) = match Role::from_marker(first) {
        Some(role) => (None, role, tail),
        None => {
            let pattern = Pattern::from_token(first)
                .ok_or_else(|| invalid(name, format!("unknown pattern token '{first}'")))?;
            let (marker, tail) = tail
                .split_once('_')
                .ok_or_else(|| invalid(name, "truncated latency name"))?;
            let role = Role::from_marker(marker)
                .ok_or_else(|| invalid(name, format!("bad role marker '{marker}'")))?;
            (Some(pattern), role, tail)
        }
    };

    let (body, port) = tail
        .rsplit_once("_p")
        .ok_or_else(|| invalid(name, "missing _p<port> token"))?;
    let port = parse_port(name, port)?;

    let separator = format!("_{}_", direction_word(role));
    let (local, remote) = body
        .split_once(separator.as_str())
        .ok_or_else(|| invalid(name, format!("missing '{separator}' separator")))?;

    Ok(ArtifactName::Latency {
        pattern,
        role,
        endpoint: parse_endpoint(name, local)?,
        peer: parse_endpoint(name, remote)?,
        port,
    })
}

#[derive(Debug, Default, Deserialize)]
struct BandwidthPayload {
    #[serde(default)]
    results: BandwidthResults,
}

#[derive(Debug, Default, Deserialize)]
struct BandwidthResults {
    #[serde(rename = "BW_average", default)]
    bw_average: f64,
}

#[derive(Debug, Default, Deserialize)]
struct LatencyPayload {
    #[serde(default)]
    results: LatencyResults,
}

#[derive(Debug, Default, Deserialize)]
struct LatencyResults {
    #[serde(default)]
    t_avg: f64,
    #[serde(default)]
    t_min: f64,
    #[serde(default)]
    t_max: f64,
}

/// Mesure portée par un rapport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Sample {
    Bandwidth { gbps: f64 },
    Latency { avg_us: f64, min_us: f64, max_us: f64 },
}

impl Sample {
    /// Valeur reportée dans les matrices
    pub fn value(&self) -> f64 {
        match self {
            Sample::Bandwidth { gbps } => *gbps,
            Sample::Latency { avg_us, .. } => *avg_us,
        }
    }

    pub fn decode(kind: TestKind, path: &Path, bytes: &[u8]) -> Result<Self, ArtifactError> {
        let payload_err = |source| ArtifactError::Payload {
            path: path.to_path_buf(),
            source,
        };
        match kind {
            TestKind::Bandwidth => {
                let p: BandwidthPayload = serde_json::from_slice(bytes).map_err(payload_err)?;
                Ok(Sample::Bandwidth { gbps: p.results.bw_average })
            }
            TestKind::Latency => {
                let p: LatencyPayload = serde_json::from_slice(bytes).map_err(payload_err)?;
                Ok(Sample::Latency {
                    avg_us: p.results.t_avg,
                    min_us: p.results.t_min,
                    max_us: p.results.t_max,
                })
            }
        }
    }
}

/// Un rapport collecté: nom décodé et contenu.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    pub name: ArtifactName,
    pub sample: Sample,
}

impl ArtifactRecord {
    /// Décode seulement le nom d'un chemin, sans IO
    pub fn decode_name(path: &Path, pattern: Option<Pattern>) -> Result<ArtifactName, ArtifactError> {
        let file = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| invalid(&path.display().to_string(), "not a utf-8 file name"))?;
        ArtifactName::parse_for(file, pattern)
    }

    pub fn load(path: &Path, pattern: Option<Pattern>) -> Result<Self, ArtifactError> {
        let name = Self::decode_name(path, pattern)?;
        let bytes = std::fs::read(path).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let sample = Sample::decode(name.kind(), path, &bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            name,
            sample,
        })
    }
}
