//! Flux de bout en bout sur une config de flotte: génération, exécution,
//! attente, collecte, corrélation.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collect::{CollectError, CollectResult, Collector};
use crate::config::{ConfigError, FleetConfig};
use crate::connectivity::{ConnectivityAnalyzer, ConnectivitySummary, RunObservation};
use crate::correlate::bandwidth::BandwidthReport;
use crate::correlate::{ArtifactSet, Correlation, Correlator};
use crate::models::{ConnectionPair, TestKind};
use crate::orchestrator::{ExecutionReport, Orchestrator, OrchestratorError};
use crate::perftest::CommandSettings;
use crate::readiness::{self, ProbeSummary};
use crate::remote::RemoteExec;
use crate::resolve::{resolve_peers, ResolveError};
use crate::topology::scripts::ScriptPlan;
use crate::topology::{TopologyError, TopologyRoles, TopologySpec};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error("{tool} still running on {running} host(s) after {elapsed:?}")]
    CompletionTimeout {
        tool: &'static str,
        running: usize,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub plan: ScriptPlan,
    pub execution: ExecutionReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct BandwidthOutcome {
    pub report: BandwidthReport,
    pub correlation: Correlation,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyOutcome {
    pub correlation: Correlation,
    /// Hôtes dont les rapports n'ont pas pu être collectés
    pub failed_hosts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    pub stopped: Vec<String>,
    pub failures: BTreeMap<String, String>,
}

pub struct Workflow<'a, E: RemoteExec + ?Sized> {
    config: &'a FleetConfig,
    remote: &'a E,
}

impl<'a, E: RemoteExec + ?Sized> Workflow<'a, E> {
    pub fn new(config: &'a FleetConfig, remote: &'a E) -> Self {
        Self { config, remote }
    }

    pub fn config(&self) -> &FleetConfig {
        self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    fn collector(&self, local_dir: &Path) -> Collector<'a, E> {
        Collector::new(self.remote, self.config.report.dir.clone(), local_dir)
    }

    /// Topologie validée, adresses des listeners résolues, scripts par hôte.
    /// Rien n'est envoyé.
    pub async fn plan(&self, roles: &TopologyRoles, kind: TestKind) -> Result<ScriptPlan, WorkflowError> {
        let spec = TopologySpec::new(roles, self.config.start_port)?;
        info!(
            pattern = %roles.pattern,
            pairs = spec.total_pairs(),
            start_port = self.config.start_port,
            "[workflow] topology ready"
        );
        let peers = resolve_peers(self.remote, &spec.listener_hosts(), &self.config.network_interface).await?;
        let settings = CommandSettings::from_config(self.config, kind);
        Ok(ScriptPlan::build(&spec, &settings, &peers)?)
    }

    /// Plan pour les rôles configurés
    pub async fn generate(&self, kind: TestKind) -> Result<ScriptPlan, WorkflowError> {
        self.config.validate()?;
        self.plan(&self.config.roles(), kind).await
    }

    /// Génère et démarre un lancement. Rend la main une fois tous les initiateurs envoyés.
    pub async fn execute(&self, roles: &TopologyRoles, kind: TestKind) -> Result<RunOutcome, WorkflowError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("run", id = %run_id, tool = kind.tool());
        async {
            let plan = self.plan(roles, kind).await?;

            if CommandSettings::from_config(self.config, kind).writes_reports() {
                self.collector(self.output_dir()).purge(&roles.all_hosts()).await;
            }

            let orchestrator = Orchestrator::new(self.remote, kind, self.config.poll_settings());
            let execution = orchestrator.execute(&plan.server, &plan.client).await?;
            Ok::<_, WorkflowError>(RunOutcome { run_id: run_id.clone(), plan, execution })
        }
        .instrument(span)
        .await
    }

    /// Démarre un lancement avec les rôles configurés
    pub async fn run(&self, kind: TestKind) -> Result<RunOutcome, WorkflowError> {
        self.config.validate()?;
        self.execute(&self.config.roles(), kind).await
    }

    pub async fn probe(&self, kind: TestKind) -> ProbeSummary {
        let results = readiness::probe_hosts(self.remote, &self.config.all_hosts(), kind.tool()).await;
        ProbeSummary::new(results)
    }

    pub async fn wait_for_completion(&self, kind: TestKind, hosts: &[String]) -> Result<ProbeSummary, WorkflowError> {
        readiness::wait_for_completion(self.remote, hosts, kind.tool(), self.config.poll_settings())
            .await
            .map_err(|t| WorkflowError::CompletionTimeout {
                tool: kind.tool(),
                running: t.last.map_or(0, |s| s.running_hosts),
                elapsed: t.elapsed,
            })
    }

    pub async fn collect(&self, hosts: &[String], local_dir: &Path, cleanup_remote: bool) -> Result<CollectResult, WorkflowError> {
        Ok(self.collector(local_dir).collect(hosts, cleanup_remote).await?)
    }

    /// Paires planifiées pour les rôles configurés, sans aucune résolution
    fn configured_pairs(&self) -> Vec<ConnectionPair> {
        match TopologySpec::new(&self.config.roles(), self.config.start_port) {
            Ok(spec) => spec.pairs().collect(),
            Err(e) => {
                warn!(error = %e, "[workflow] no plan available, bandwidth targets unresolved");
                Vec::new()
            }
        }
    }

    /// Analyse de bande passante du contenu du répertoire de sortie
    pub fn analyze_bandwidth(&self) -> BandwidthOutcome {
        let pattern = self.config.stream_type;
        let set = ArtifactSet::load_dir(self.output_dir(), Some(pattern));
        let plan = self.configured_pairs();
        let correlation = Correlator::new(TestKind::Bandwidth, Some(pattern))
            .with_plan(&plan)
            .correlate(&set);
        let report = BandwidthReport::build(&set, self.config.speed, &plan);
        info!(
            clients = report.clients.len(),
            servers = report.servers.len(),
            unhealthy = report.unhealthy(),
            "[workflow] bandwidth analyzed"
        );
        BandwidthOutcome { report, correlation }
    }

    /// Flux bande passante complet: lancement, attente, collecte, analyse
    pub async fn bandwidth(&self) -> Result<BandwidthOutcome, WorkflowError> {
        let outcome = self.run(TestKind::Bandwidth).await?;
        let hosts = self.config.all_hosts();
        self.wait_for_completion(TestKind::Bandwidth, &hosts).await?;
        self.collect(&hosts, self.output_dir(), true).await?;
        info!(run = %outcome.run_id, "[workflow] bandwidth run collected");
        Ok(self.analyze_bandwidth())
    }

    /// Lance un test de latence pour `roles` et rassemble sa production dans `local_dir`.
    pub async fn observe_latency(&self, roles: &TopologyRoles, local_dir: &Path) -> Result<RunObservation, WorkflowError> {
        let outcome = self.execute(roles, TestKind::Latency).await?;
        let hosts = roles.all_hosts();
        self.wait_for_completion(TestKind::Latency, &hosts).await?;
        let collected = self.collect(&hosts, local_dir, true).await?;
        Ok(RunObservation {
            pairs: outcome.plan.pairs,
            artifacts: ArtifactSet::load_dir(local_dir, Some(roles.pattern)),
            failed_hosts: collected.failures,
        })
    }

    /// Matrice de latence pour les rôles configurés
    pub async fn latency(&self) -> Result<LatencyOutcome, WorkflowError> {
        self.config.validate()?;
        let roles = self.config.roles();
        let obs = self.observe_latency(&roles, self.output_dir()).await?;
        let correlation = Correlator::new(TestKind::Latency, Some(roles.pattern))
            .with_plan(&obs.pairs)
            .correlate(&obs.artifacts);
        info!(
            samples = correlation.statistics.count,
            mean_us = correlation.statistics.mean,
            missing = correlation.missing.len(),
            "[workflow] latency correlated"
        );
        Ok(LatencyOutcome {
            correlation,
            failed_hosts: obs.failed_hosts,
        })
    }

    pub async fn check_connectivity(&self) -> Result<ConnectivitySummary, WorkflowError> {
        self.config.validate()?;
        ConnectivityAnalyzer::new(self).check(&self.config.roles()).await
    }

    /// `killall` sur chaque hôte; un hôte sans rien à tuer n'est pas une erreur.
    pub async fn stop(&self, kind: TestKind) -> StopReport {
        let tool = kind.tool();
        let cmd = format!("killall {tool}");
        let cmd = cmd.as_str();
        let hosts = self.config.all_hosts();
        let kills = hosts.iter().map(|host| async move {
            let outcome = match self.remote.exec(host, cmd).await {
                Ok(res) if res.success() => Ok(()),
                Ok(res) if res.diagnostic().contains("no process found") => Ok(()),
                Ok(res) => Err(res.diagnostic()),
                Err(e) => Err(e.to_string()),
            };
            (host.clone(), outcome)
        });

        let mut report = StopReport::default();
        for (host, outcome) in join_all(kills).await {
            match outcome {
                Ok(()) => report.stopped.push(host),
                Err(reason) => {
                    warn!(%host, %reason, "[workflow] stop failed");
                    report.failures.insert(host, reason);
                }
            }
        }
        info!(stopped = report.stopped.len(), failed = report.failures.len(), "[workflow] {tool} stopped");
        report
    }
}
