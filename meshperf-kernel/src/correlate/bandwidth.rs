//! Débit par carte comparé au débit théorique de la ligne.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::{Aggregate, ArtifactSet};
use crate::artifact::ArtifactName;
use crate::models::{ConnectionPair, Endpoint, Role};

/// Écart toléré par rapport à la valeur théorique, en pourcent
pub const TOLERANCE_PERCENT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BandwidthStatus {
    Ok,
    NotOk,
}

impl BandwidthStatus {
    pub fn judge(delta_percent: f64) -> Self {
        if delta_percent.abs() > TOLERANCE_PERCENT {
            BandwidthStatus::NotOk
        } else {
            BandwidthStatus::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceBandwidth {
    pub endpoint: Endpoint,
    pub total_gbps: f64,
    pub samples: usize,
    pub theoretical_gbps: f64,
    pub delta_gbps: f64,
    pub delta_percent: f64,
    pub status: BandwidthStatus,
}

impl DeviceBandwidth {
    fn new(endpoint: Endpoint, agg: Aggregate, theoretical_gbps: f64) -> Self {
        let delta_gbps = agg.sum - theoretical_gbps;
        let delta_percent = if theoretical_gbps > 0.0 {
            delta_gbps / theoretical_gbps * 100.0
        } else {
            0.0
        };
        Self {
            endpoint,
            total_gbps: agg.sum,
            samples: agg.count,
            theoretical_gbps,
            delta_gbps,
            delta_percent,
            status: BandwidthStatus::judge(delta_percent),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct P2pDevice {
    pub endpoint: Endpoint,
    pub avg_gbps: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct P2pSummary {
    pub devices: Vec<P2pDevice>,
    pub total_endpoints: usize,
    pub avg_gbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthReport {
    /// Débit de ligne par carte, Gbps
    pub speed_gbps: f64,
    pub theoretical_per_client_gbps: f64,
    pub clients: Vec<DeviceBandwidth>,
    pub servers: Vec<DeviceBandwidth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p2p: Option<P2pSummary>,
}

impl BandwidthReport {
    /// Sommes client (tx) et serveur (rx) par carte. La charge étant répartie
    /// également, chaque client devrait voir `speed * serveurs / clients`, les
    /// deux comptés dans `plan`. Sans plan, les cartes observées font foi.
    pub fn build(set: &ArtifactSet, speed_gbps: f64, plan: &[ConnectionPair]) -> Self {
        let mut tx: BTreeMap<Endpoint, Aggregate> = BTreeMap::new();
        let mut rx: BTreeMap<Endpoint, Aggregate> = BTreeMap::new();
        let mut p2p: BTreeMap<Endpoint, Aggregate> = BTreeMap::new();

        for rec in &set.records {
            let v = rec.sample.value();
            match &rec.name {
                ArtifactName::Bandwidth { role: Role::Client, endpoint, .. } => {
                    tx.entry(endpoint.clone()).or_default().add(v)
                }
                ArtifactName::Bandwidth { role: Role::Server, endpoint, .. } => {
                    rx.entry(endpoint.clone()).or_default().add(v)
                }
                ArtifactName::P2pBandwidth { endpoint, .. } => p2p.entry(endpoint.clone()).or_default().add(v),
                ArtifactName::Latency { .. } => {}
            }
        }

        let (listeners, initiators) = if plan.is_empty() {
            (rx.len(), tx.len())
        } else {
            let listeners: BTreeSet<&Endpoint> = plan.iter().map(ConnectionPair::listener).collect();
            let initiators: BTreeSet<&Endpoint> = plan.iter().map(ConnectionPair::initiator).collect();
            (listeners.len(), initiators.len())
        };
        let theoretical_per_client = if initiators == 0 {
            0.0
        } else {
            speed_gbps * listeners as f64 / initiators as f64
        };

        let clients = tx
            .into_iter()
            .map(|(ep, agg)| DeviceBandwidth::new(ep, agg, theoretical_per_client))
            .collect();
        let servers = rx
            .into_iter()
            .map(|(ep, agg)| DeviceBandwidth::new(ep, agg, speed_gbps))
            .collect();

        Self {
            speed_gbps,
            theoretical_per_client_gbps: theoretical_per_client,
            clients,
            servers,
            p2p: (!p2p.is_empty()).then(|| p2p_summary(p2p)),
        }
    }

    pub fn unhealthy(&self) -> usize {
        self.clients
            .iter()
            .chain(&self.servers)
            .filter(|d| d.status == BandwidthStatus::NotOk)
            .count()
    }
}

fn p2p_summary(per_endpoint: BTreeMap<Endpoint, Aggregate>) -> P2pSummary {
    let devices: Vec<P2pDevice> = per_endpoint
        .into_iter()
        .map(|(endpoint, agg)| P2pDevice {
            endpoint,
            avg_gbps: agg.mean(),
            samples: agg.count,
        })
        .collect();
    let avg_gbps = if devices.is_empty() {
        0.0
    } else {
        devices.iter().map(|d| d.avg_gbps).sum::<f64>() / devices.len() as f64
    };
    P2pSummary {
        total_endpoints: devices.len(),
        avg_gbps,
        devices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactRecord, Sample};
    use std::path::PathBuf;

    fn rec(name: ArtifactName, gbps: f64) -> ArtifactRecord {
        ArtifactRecord {
            path: PathBuf::from(name.file_name()),
            name,
            sample: Sample::Bandwidth { gbps },
        }
    }

    fn bw(role: Role, host: &str, port: u16, gbps: f64) -> ArtifactRecord {
        rec(
            ArtifactName::Bandwidth {
                role,
                endpoint: Endpoint::new(host, "mlx5_0"),
                port,
            },
            gbps,
        )
    }

    #[test]
    fn test_incast_report() {
        // une carte serveur, deux clients: 200 sur 400 chacun
        let set = ArtifactSet {
            records: vec![
                bw(Role::Client, "c1", 20000, 195.0),
                bw(Role::Client, "c2", 20001, 100.0),
                bw(Role::Server, "srv", 20000, 195.0),
                bw(Role::Server, "srv", 20001, 100.0),
            ],
            failures: vec![],
        };
        let report = BandwidthReport::build(&set, 400.0, &[]);
        assert_eq!(report.theoretical_per_client_gbps, 200.0);
        assert_eq!(report.clients[0].status, BandwidthStatus::Ok);
        assert_eq!(report.clients[1].status, BandwidthStatus::NotOk);
        assert_eq!(report.clients[1].delta_percent, -50.0);
        assert_eq!(report.servers[0].total_gbps, 295.0);
        assert_eq!(report.servers[0].samples, 2);
        assert_eq!(report.servers[0].status, BandwidthStatus::NotOk);
        assert_eq!(report.unhealthy(), 2);
        assert!(report.p2p.is_none());
    }

    #[test]
    fn test_p2p_averages() {
        let ep = |h: &str| Endpoint::new(h, "mlx5_0");
        let set = ArtifactSet {
            records: vec![
                rec(ArtifactName::P2pBandwidth { endpoint: ep("a"), port: 20000 }, 380.0),
                rec(ArtifactName::P2pBandwidth { endpoint: ep("a"), port: 20001 }, 360.0),
                rec(ArtifactName::P2pBandwidth { endpoint: ep("b"), port: 20000 }, 390.0),
            ],
            failures: vec![],
        };
        let p2p = BandwidthReport::build(&set, 400.0, &[]).p2p.unwrap();
        assert_eq!(p2p.total_endpoints, 2);
        assert_eq!(p2p.devices[0].avg_gbps, 370.0);
        assert_eq!(p2p.avg_gbps, 380.0);
    }

    #[test]
    fn test_missing_client_report_keeps_planned_expectation() {
        let srv = Endpoint::new("srv", "mlx5_0");
        let plan = vec![
            ConnectionPair::new(srv.clone(), Endpoint::new("c1", "mlx5_0"), 20000),
            ConnectionPair::new(srv.clone(), Endpoint::new("c2", "mlx5_0"), 20001),
        ];
        // c2 n'a rien rapporté
        let set = ArtifactSet {
            records: vec![
                bw(Role::Client, "c1", 20000, 195.0),
                bw(Role::Server, "srv", 20000, 195.0),
            ],
            failures: vec![],
        };
        let report = BandwidthReport::build(&set, 400.0, &plan);
        assert_eq!(report.theoretical_per_client_gbps, 200.0);
        assert_eq!(report.clients.len(), 1);
        assert_eq!(report.clients[0].status, BandwidthStatus::Ok);

        let observed = BandwidthReport::build(&set, 400.0, &[]);
        assert_eq!(observed.theoretical_per_client_gbps, 400.0);
    }

    #[test]
    fn test_tolerance_boundary() {
        assert_eq!(BandwidthStatus::judge(20.0), BandwidthStatus::Ok);
        assert_eq!(BandwidthStatus::judge(-20.0), BandwidthStatus::Ok);
        assert_eq!(BandwidthStatus::judge(20.1), BandwidthStatus::NotOk);
    }
}
