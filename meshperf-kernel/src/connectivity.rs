//! Santé bidirectionnelle des liens à partir de deux tests de latence incast.
//!
//! Le passage aller utilise les rôles configurés, le retour les rôles inversés.
//! Les deux aboutissent aux mêmes clés canoniques: chaque paire physique de
//! cartes a au plus un résultat par sens.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::artifact::{ArtifactName, Sample};
use crate::correlate::ArtifactSet;
use crate::models::{ConnectionPair, Endpoint, Pattern, Role};
use crate::remote::RemoteExec;
use crate::topology::TopologyRoles;
use crate::workflow::{Workflow, WorkflowError};

/// Clé indépendante du sens: le plus petit `host:adapter` d'abord, joint par `<->`.
pub fn canonical_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}<->{b}")
    } else {
        format!("{b}<->{a}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason")]
pub enum LinkStatus {
    Connected,
    Disconnected,
    Error(String),
}

impl LinkStatus {
    fn severity(&self) -> u8 {
        match self {
            LinkStatus::Connected => 0,
            LinkStatus::Disconnected => 1,
            LinkStatus::Error(_) => 2,
        }
    }

    pub fn worst(a: LinkStatus, b: LinkStatus) -> LinkStatus {
        if b.severity() > a.severity() {
            b
        } else {
            a
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub avg_us: f64,
    pub min_us: f64,
    pub max_us: f64,
}

/// Résultat initiateur vers listener d'un passage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionResult {
    pub source: Endpoint,
    pub target: Endpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectivityPairResult {
    pub key: String,
    pub forward: Option<DirectionResult>,
    pub backward: Option<DirectionResult>,
}

fn direction_status(slot: &Option<DirectionResult>) -> LinkStatus {
    slot.as_ref()
        .map_or(LinkStatus::Disconnected, |d| d.status.clone())
}

impl ConnectivityPairResult {
    fn new(key: String) -> Self {
        Self { key, forward: None, backward: None }
    }

    /// Un sens sans aucun résultat compte comme déconnecté
    pub fn forward_status(&self) -> LinkStatus {
        direction_status(&self.forward)
    }

    pub fn backward_status(&self) -> LinkStatus {
        direction_status(&self.backward)
    }

    /// Pire des deux sens: erreur, puis déconnecté, puis connecté
    pub fn status(&self) -> LinkStatus {
        LinkStatus::worst(self.forward_status(), self.backward_status())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectivitySummary {
    pub total_pairs: usize,
    pub connected_pairs: usize,
    pub disconnected_pairs: usize,
    pub error_pairs: usize,
    pub pairs: Vec<ConnectivityPairResult>,
}

impl ConnectivitySummary {
    fn from_pairs(pairs: Vec<ConnectivityPairResult>) -> Self {
        let mut summary = Self {
            total_pairs: pairs.len(),
            connected_pairs: 0,
            disconnected_pairs: 0,
            error_pairs: 0,
            pairs: Vec::new(),
        };
        for p in &pairs {
            match p.status() {
                LinkStatus::Connected => summary.connected_pairs += 1,
                LinkStatus::Disconnected => summary.disconnected_pairs += 1,
                LinkStatus::Error(_) => summary.error_pairs += 1,
            }
        }
        summary.pairs = pairs;
        summary
    }

    pub fn is_healthy(&self) -> bool {
        self.disconnected_pairs == 0 && self.error_pairs == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_healthy() {
            0
        } else {
            1
        }
    }
}

/// Ce qu'un test de latence a laissé derrière lui.
#[derive(Debug, Clone, Default)]
pub struct RunObservation {
    pub pairs: Vec<ConnectionPair>,
    pub artifacts: ArtifactSet,
    /// Hôtes dont les rapports n'ont pas pu être collectés, avec la raison
    pub failed_hosts: BTreeMap<String, String>,
}

type Link = (Endpoint, Endpoint);

impl RunObservation {
    /// Résultats orientés par (initiateur, listener): paires planifiées
    /// d'abord, puis liens vus uniquement dans les rapports.
    pub fn directions(&self) -> Vec<DirectionResult> {
        let mut samples: BTreeMap<Link, (u16, LatencyStats)> = BTreeMap::new();
        let mut listener_seen: BTreeMap<Link, u16> = BTreeMap::new();
        for rec in &self.artifacts.records {
            let (ArtifactName::Latency { role, endpoint, peer, port, .. }, Sample::Latency { avg_us, min_us, max_us }) =
                (&rec.name, rec.sample)
            else {
                continue;
            };
            let stats = LatencyStats { avg_us, min_us, max_us };
            match role {
                Role::Client => {
                    samples.entry((endpoint.clone(), peer.clone())).or_insert((*port, stats));
                }
                Role::Server => {
                    listener_seen.entry((peer.clone(), endpoint.clone())).or_insert(*port);
                }
            }
        }

        let mut unreadable: BTreeMap<Link, (u16, String)> = BTreeMap::new();
        for failure in &self.artifacts.failures {
            if let Some(ArtifactName::Latency { role: Role::Client, endpoint, peer, port, .. }) = &failure.name {
                unreadable
                    .entry((endpoint.clone(), peer.clone()))
                    .or_insert((*port, failure.error.clone()));
            }
        }

        let mut out = Vec::new();
        let mut seen: BTreeSet<Link> = BTreeSet::new();
        for pair in &self.pairs {
            let link = (pair.initiator().clone(), pair.listener().clone());
            if !seen.insert(link.clone()) {
                continue;
            }
            out.push(self.judge(&link, Some(pair.port), &samples, &unreadable));
        }

        let extra: BTreeSet<Link> = samples
            .keys()
            .chain(unreadable.keys())
            .chain(listener_seen.keys())
            .filter(|l| !seen.contains(*l))
            .cloned()
            .collect();
        for link in extra {
            let port = samples
                .get(&link)
                .map(|s| s.0)
                .or_else(|| unreadable.get(&link).map(|u| u.0))
                .or_else(|| listener_seen.get(&link).copied());
            out.push(self.judge(&link, port, &samples, &unreadable));
        }
        out
    }

    fn judge(
        &self,
        link: &Link,
        port: Option<u16>,
        samples: &BTreeMap<Link, (u16, LatencyStats)>,
        unreadable: &BTreeMap<Link, (u16, String)>,
    ) -> DirectionResult {
        let (source, target) = link.clone();
        let (status, latency) = if let Some((_, stats)) = samples.get(link) {
            (LinkStatus::Connected, Some(*stats))
        } else if let Some((_, reason)) = unreadable.get(link) {
            (LinkStatus::Error(reason.clone()), None)
        } else if let Some(reason) = self.failed_hosts.get(&source.host) {
            (LinkStatus::Error(format!("collection failed on {}: {reason}", source.host)), None)
        } else {
            (LinkStatus::Disconnected, None)
        };
        DirectionResult { source, target, port, status, latency }
    }
}

/// Fusionne aller et retour en un résultat par clé canonique.
pub fn merge(forward: &RunObservation, backward: &RunObservation) -> ConnectivitySummary {
    let mut pairs: BTreeMap<String, ConnectivityPairResult> = BTreeMap::new();
    for (run, is_forward) in [(forward, true), (backward, false)] {
        for dir in run.directions() {
            let key = canonical_key(&dir.source.key(), &dir.target.key());
            let entry = pairs
                .entry(key.clone())
                .or_insert_with(|| ConnectivityPairResult::new(key));
            let slot = if is_forward { &mut entry.forward } else { &mut entry.backward };
            if slot.is_none() {
                *slot = Some(dir);
            }
        }
    }
    ConnectivitySummary::from_pairs(pairs.into_values().collect())
}

/// Lance les passages de latence aller et retour via un [`Workflow`].
pub struct ConnectivityAnalyzer<'w, 'a, E: RemoteExec + ?Sized> {
    workflow: &'w Workflow<'a, E>,
}

impl<'w, 'a, E: RemoteExec + ?Sized> ConnectivityAnalyzer<'w, 'a, E> {
    pub fn new(workflow: &'w Workflow<'a, E>) -> Self {
        Self { workflow }
    }

    /// `roles` n'est que lu; le retour travaille sur une copie inversée.
    pub async fn check(&self, roles: &TopologyRoles) -> Result<ConnectivitySummary, WorkflowError> {
        let forward_roles = TopologyRoles::for_pattern(Pattern::InCast, roles.server.clone(), roles.client.clone());
        let backward_roles = forward_roles.swapped();
        let base = self.workflow.output_dir().join("connectivity");

        info!("[connectivity] forward pass");
        let forward = self
            .workflow
            .observe_latency(&forward_roles, &base.join("forward"))
            .await?;
        info!("[connectivity] backward pass");
        let backward = self
            .workflow
            .observe_latency(&backward_roles, &base.join("backward"))
            .await?;

        let summary = merge(&forward, &backward);
        if summary.is_healthy() {
            info!(pairs = summary.total_pairs, "[connectivity] all pairs connected");
        } else {
            warn!(
                total = summary.total_pairs,
                disconnected = summary.disconnected_pairs,
                errors = summary.error_pairs,
                "[connectivity] unhealthy links"
            );
        }
        Ok(summary)
    }
}
