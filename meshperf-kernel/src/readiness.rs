//! Comptage des processus et combinateur de polling pour les attentes de
//! disponibilité et de fin.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::remote::RemoteExec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Résultat d'un tour de polling
#[derive(Debug)]
pub enum Attempt<T, P> {
    Ready(T),
    Pending(P),
}

/// Délai dépassé, avec la dernière observation en attente
#[derive(Debug)]
pub struct WaitTimeout<P> {
    pub elapsed: Duration,
    pub attempts: u32,
    pub last: Option<P>,
}

/// Appelle `probe` toutes les `interval` jusqu'à ce qu'il soit prêt ou que
/// `timeout` soit écoulé. Au moins un appel a lieu.
pub async fn poll_until<T, P, F, Fut>(settings: PollSettings, mut probe: F) -> Result<T, WaitTimeout<P>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T, P>>,
{
    let start = Instant::now();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let last = match probe().await {
            Attempt::Ready(v) => return Ok(v),
            Attempt::Pending(p) => p,
        };
        let elapsed = start.elapsed();
        if elapsed >= settings.timeout {
            return Err(WaitTimeout { elapsed, attempts, last: Some(last) });
        }
        tokio::time::sleep(settings.interval).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub host: String,
    pub process_count: usize,
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn process_count_command(tool: &str) -> String {
    format!("ps aux | grep {tool} | grep -v grep | wc -l")
}

pub async fn probe_host<E>(remote: &E, host: &str, tool: &str) -> ProbeResult
where
    E: RemoteExec + ?Sized,
{
    let failed = |reason: String| ProbeResult {
        host: host.to_string(),
        process_count: 0,
        status: ProbeStatus::Error,
        error: Some(reason),
    };
    match remote.exec(host, &process_count_command(tool)).await {
        Ok(res) if res.success() => match res.stdout.trim().parse::<usize>() {
            Ok(count) => ProbeResult {
                host: host.to_string(),
                process_count: count,
                status: if count > 0 { ProbeStatus::Running } else { ProbeStatus::Completed },
                error: None,
            },
            Err(_) => failed(format!("unexpected probe output '{}'", res.stdout.trim())),
        },
        Ok(res) => failed(res.diagnostic()),
        Err(e) => failed(e.to_string()),
    }
}

/// Interroge tous les hôtes en parallèle; les résultats gardent l'ordre d'entrée.
pub async fn probe_hosts<E>(remote: &E, hosts: &[String], tool: &str) -> Vec<ProbeResult>
where
    E: RemoteExec + ?Sized,
{
    join_all(hosts.iter().map(|h| probe_host(remote, h, tool))).await
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostProgress {
    pub host: String,
    pub seen: usize,
    pub expected: usize,
}

/// Hôtes encore sous leur nombre de processus attendu. Vide signifie prêt.
pub fn lagging_hosts(expected: &BTreeMap<String, usize>, results: &[ProbeResult]) -> Vec<HostProgress> {
    expected
        .iter()
        .filter_map(|(host, &want)| {
            let seen = results
                .iter()
                .find(|r| &r.host == host && r.status != ProbeStatus::Error)
                .map_or(0, |r| r.process_count);
            (seen < want).then(|| HostProgress {
                host: host.clone(),
                seen,
                expected: want,
            })
        })
        .collect()
}

/// Attend que chaque hôte de `expected` fasse tourner au moins le nombre
/// attendu de processus `tool`.
pub async fn wait_for_readiness<E>(
    remote: &E,
    expected: &BTreeMap<String, usize>,
    tool: &str,
    settings: PollSettings,
) -> Result<Duration, WaitTimeout<Vec<HostProgress>>>
where
    E: RemoteExec + ?Sized,
{
    let hosts: Vec<String> = expected.keys().cloned().collect();
    let hosts = hosts.as_slice();
    let start = Instant::now();
    poll_until(settings, || async move {
        let results = probe_hosts(remote, hosts, tool).await;
        let lagging = lagging_hosts(expected, &results);
        if lagging.is_empty() {
            Attempt::Ready(start.elapsed())
        } else {
            debug!(lagging = lagging.len(), "[readiness] waiting for listeners");
            Attempt::Pending(lagging)
        }
    })
    .await
}

/// Attend qu'aucun hôte ne fasse plus tourner `tool`. Un hôte injoignable
/// ne bloque pas l'attente.
pub async fn wait_for_completion<E>(
    remote: &E,
    hosts: &[String],
    tool: &str,
    settings: PollSettings,
) -> Result<ProbeSummary, WaitTimeout<ProbeSummary>>
where
    E: RemoteExec + ?Sized,
{
    poll_until(settings, || async move {
        let summary = ProbeSummary::new(probe_hosts(remote, hosts, tool).await);
        for r in summary.results.iter().filter(|r| r.status == ProbeStatus::Error) {
            warn!(host = %r.host, error = ?r.error, "[readiness] probe failed");
        }
        if summary.running_hosts == 0 {
            Attempt::Ready(summary)
        } else {
            debug!(running = summary.running_hosts, processes = summary.total_processes, "[readiness] still running");
            Attempt::Pending(summary)
        }
    })
    .await
}

/// Instantané de la flotte pour un tour de comptage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub timestamp: String,
    pub results: Vec<ProbeResult>,
    pub running_hosts: usize,
    pub completed_hosts: usize,
    pub error_hosts: usize,
    pub total_processes: usize,
    pub all_completed: bool,
}

impl ProbeSummary {
    pub fn new(results: Vec<ProbeResult>) -> Self {
        let count = |s| results.iter().filter(|r| r.status == s).count();
        let running_hosts = count(ProbeStatus::Running);
        let completed_hosts = count(ProbeStatus::Completed);
        let error_hosts = count(ProbeStatus::Error);
        let total_processes = results.iter().map(|r| r.process_count).sum();
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            timestamp,
            all_completed: running_hosts == 0 && error_hosts == 0,
            results,
            running_hosts,
            completed_hosts,
            error_hosts,
            total_processes,
        }
    }
}
