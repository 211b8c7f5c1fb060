//! Exécution en deux phases sur la flotte: serveurs, barrière de disponibilité, clients.

use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::models::TestKind;
use crate::readiness::{self, HostProgress, PollSettings};
use crate::remote::RemoteExec;
use crate::state::{new_state, snapshot, Shared};
use crate::topology::scripts::ScriptBundle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    NotStarted,
    ServersDispatching,
    WaitingForReadiness,
    ClientsDispatching,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Servers,
    Clients,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Servers => f.write_str("server"),
            Phase::Clients => f.write_str("client"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostFailure {
    pub host: String,
    pub reason: String,
}

fn render_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.host, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

fn render_lagging(lagging: &[HostProgress]) -> String {
    lagging
        .iter()
        .map(|h| format!("{} {}/{}", h.host, h.seen, h.expected))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{phase} dispatch failed on {} host(s): {}", .failures.len(), render_failures(.failures))]
    Dispatch { phase: Phase, failures: Vec<HostFailure> },
    #[error("listeners not ready after {elapsed:?}: {}", render_lagging(.lagging))]
    ReadinessTimeout {
        elapsed: Duration,
        lagging: Vec<HostProgress>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub server_hosts: usize,
    pub client_hosts: usize,
    pub commands: usize,
    pub readiness_wait: Duration,
}

pub struct Orchestrator<'a, E: RemoteExec + ?Sized> {
    remote: &'a E,
    kind: TestKind,
    poll: PollSettings,
    state: Shared<ExecutionState>,
}

impl<'a, E: RemoteExec + ?Sized> Orchestrator<'a, E> {
    pub fn new(remote: &'a E, kind: TestKind, poll: PollSettings) -> Self {
        Self {
            remote,
            kind,
            poll,
            state: new_state(ExecutionState::NotStarted),
        }
    }

    /// Handle pour suivre la progression depuis une autre tâche
    pub fn state_handle(&self) -> Shared<ExecutionState> {
        self.state.clone()
    }

    pub fn state(&self) -> ExecutionState {
        snapshot(&self.state)
    }

    fn transition(&self, next: ExecutionState) {
        debug!(state = ?next, "[orchestrator] transition");
        *self.state.lock() = next;
    }

    /// Lance les deux phases. Les clients ne partent que si tous les envois
    /// serveur ont réussi et que chaque hôte listener est prêt.
    pub async fn execute(&self, servers: &ScriptBundle, clients: &ScriptBundle) -> Result<ExecutionReport, OrchestratorError> {
        let result = self.run_phases(servers, clients).await;
        match &result {
            Ok(report) => {
                self.transition(ExecutionState::Completed);
                info!(
                    servers = report.server_hosts,
                    clients = report.client_hosts,
                    commands = report.commands,
                    "[orchestrator] {} started on all hosts",
                    self.kind.tool()
                );
            }
            Err(e) => {
                error!("[orchestrator] {e}");
                self.transition(ExecutionState::Failed(e.to_string()));
            }
        }
        result
    }

    async fn run_phases(&self, servers: &ScriptBundle, clients: &ScriptBundle) -> Result<ExecutionReport, OrchestratorError> {
        self.transition(ExecutionState::ServersDispatching);
        self.dispatch(Phase::Servers, servers).await?;

        self.transition(ExecutionState::WaitingForReadiness);
        let readiness_wait = if servers.is_empty() {
            Duration::ZERO
        } else {
            let expected = servers.expectations();
            readiness::wait_for_readiness(self.remote, &expected, self.kind.tool(), self.poll)
                .await
                .map_err(|t| OrchestratorError::ReadinessTimeout {
                    elapsed: t.elapsed,
                    lagging: t.last.unwrap_or_default(),
                })?
        };
        info!(wait = ?readiness_wait, "[orchestrator] listeners ready");

        self.transition(ExecutionState::ClientsDispatching);
        self.dispatch(Phase::Clients, clients).await?;

        Ok(ExecutionReport {
            server_hosts: servers.hosts().len(),
            client_hosts: clients.hosts().len(),
            commands: servers.total_commands() + clients.total_commands(),
            readiness_wait,
        })
    }

    /// Envoie tous les scripts en parallèle et attend la fin de chacun
    /// avant d'examiner les échecs.
    async fn dispatch(&self, phase: Phase, bundle: &ScriptBundle) -> Result<(), OrchestratorError> {
        info!(hosts = bundle.hosts().len(), "[orchestrator] dispatching {phase} phase");
        let sends = bundle.scripts().map(|script| async move {
            debug!(host = %script.host, commands = script.command_count(), "[orchestrator] dispatch");
            let outcome = match self.remote.exec(&script.host, &script.render()).await {
                Ok(res) if res.success() => Ok(()),
                Ok(res) => Err(format!("exit {:?}: {}", res.exit_code, res.diagnostic())),
                Err(e) => Err(e.to_string()),
            };
            (script.host.clone(), outcome)
        });

        let failures: Vec<HostFailure> = join_all(sends)
            .await
            .into_iter()
            .filter_map(|(host, outcome)| outcome.err().map(|reason| HostFailure { host, reason }))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Dispatch { phase, failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ExecutionResult, RemoteError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};

    struct FakeRemote {
        running: usize,
        failing: Vec<String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeRemote {
        fn new(running: usize, failing: &[&str]) -> Self {
            Self {
                running,
                failing: failing.iter().map(|h| h.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn dispatched_to(&self, host: &str) -> bool {
            self.calls
                .lock()
                .iter()
                .any(|(h, c)| h == host && c.starts_with("( "))
        }
    }

    #[async_trait]
    impl RemoteExec for FakeRemote {
        async fn exec(&self, host: &str, command: &str) -> Result<ExecutionResult, RemoteError> {
            self.calls.lock().push((host.to_string(), command.to_string()));
            if command.starts_with("ps aux") {
                return Ok(ExecutionResult {
                    stdout: format!("{}\n", self.running),
                    exit_code: Some(0),
                    ..Default::default()
                });
            }
            if self.failing.iter().any(|h| h == host) {
                return Err(RemoteError::Timeout { host: host.to_string(), secs: 1 });
            }
            Ok(ExecutionResult { exit_code: Some(0), ..Default::default() })
        }

        async fn fetch(&self, _host: &str, _pattern: &str, _dir: &Path) -> Result<Vec<PathBuf>, RemoteError> {
            Ok(Vec::new())
        }
    }

    fn bundles() -> (ScriptBundle, ScriptBundle) {
        let mut servers = ScriptBundle::new(crate::models::Role::Server);
        servers.push("s1", "ib_write_bw -p 20000 &".into());
        servers.push("s1", "ib_write_bw -p 20001 &".into());
        servers.push("s2", "ib_write_bw -p 20002 &".into());
        let mut clients = ScriptBundle::new(crate::models::Role::Client);
        clients.push("c1", "ib_write_bw -p 20000 10.0.0.1 &".into());
        clients.push("c2", "ib_write_bw -p 20001 10.0.0.1 &".into());
        (servers, clients)
    }

    fn poll() -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_runs_both_phases() {
        let remote = FakeRemote::new(2, &[]);
        let orch = Orchestrator::new(&remote, TestKind::Bandwidth, poll());
        let (servers, clients) = bundles();

        let report = orch.execute(&servers, &clients).await.unwrap();
        assert_eq!(report.server_hosts, 2);
        assert_eq!(report.client_hosts, 2);
        assert_eq!(report.commands, 5);
        assert_eq!(orch.state(), ExecutionState::Completed);
        assert!(remote.dispatched_to("c1"));
        assert!(remote.dispatched_to("c2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failures_are_aggregated() {
        let remote = FakeRemote::new(2, &["s1", "s2"]);
        let orch = Orchestrator::new(&remote, TestKind::Bandwidth, poll());
        let (servers, clients) = bundles();

        let err = orch.execute(&servers, &clients).await.unwrap_err();
        match err {
            OrchestratorError::Dispatch { phase, failures } => {
                assert_eq!(phase, Phase::Servers);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(orch.state(), ExecutionState::Failed(_)));
        assert!(!remote.dispatched_to("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_blocks_clients() {
        let remote = FakeRemote::new(1, &[]);
        let orch = Orchestrator::new(&remote, TestKind::Bandwidth, poll());
        let handle = orch.state_handle();
        let (servers, clients) = bundles();

        let err = orch.execute(&servers, &clients).await.unwrap_err();
        match err {
            OrchestratorError::ReadinessTimeout { lagging, .. } => {
                assert_eq!(lagging.len(), 1);
                assert_eq!(lagging[0].host, "s1");
                assert_eq!(lagging[0].expected, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!remote.dispatched_to("c1"));
        assert!(!remote.dispatched_to("c2"));
        assert!(matches!(&*handle.lock(), ExecutionState::Failed(_)));
    }
}
