/*!
Remote Stub pour tests sans flotte réelle

Remplace ssh/scp par une flotte simulée en mémoire:
- Enregistre chaque commande envoyée par hôte
- Simule les processus perftest lancés (visibles par `ps aux`)
- Produit les rapports JSON que perftest aurait écrits
- Injection de pannes: ssh, scp, listeners qui ne démarrent jamais
*/

use async_trait::async_trait;
use meshperf::artifact::ArtifactName;
use meshperf::remote::{list_json, ExecutionResult, RemoteError, RemoteExec, NO_MATCH};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::fixtures::ArtifactWriter;

/// Valeur mesurée pour un rapport donné; `None` = pas de rapport écrit
pub type ResultFn = Arc<dyn Fn(&ArtifactName) -> Option<f64> + Send + Sync>;

/// Une commande reçue par la flotte simulée
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub host: String,
    pub command: String,
}

struct FleetState {
    addresses: HashMap<String, String>,
    unaddressed: HashSet<String>,
    failing_exec: HashSet<String>,
    failing_fetch: HashSet<String>,
    stalled: HashSet<String>,
    /// Nombre de sondes `ps` qui voient un processus avant qu'il ne se termine,
    /// compté à partir du lancement des initiateurs
    process_lifetime: usize,
    initiators_started: bool,
    processes: HashMap<String, Vec<usize>>,
    reports: HashMap<String, BTreeMap<String, Vec<u8>>>,
    results: Option<ResultFn>,
}

impl Default for FleetState {
    fn default() -> Self {
        Self {
            addresses: HashMap::new(),
            unaddressed: HashSet::new(),
            failing_exec: HashSet::new(),
            failing_fetch: HashSet::new(),
            stalled: HashSet::new(),
            process_lifetime: 1,
            initiators_started: false,
            processes: HashMap::new(),
            reports: HashMap::new(),
            results: None,
        }
    }
}

/// Flotte simulée implémentant `RemoteExec`
#[derive(Clone, Default)]
pub struct MockRemote {
    calls: Arc<Mutex<Vec<RemoteCall>>>,
    state: Arc<Mutex<FleetState>>,
}

fn reply(stdout: impl Into<String>) -> ExecutionResult {
    ExecutionResult {
        stdout: stdout.into(),
        exit_code: Some(0),
        ..Default::default()
    }
}

fn refuse(stderr: impl Into<String>) -> ExecutionResult {
    ExecutionResult {
        stderr: stderr.into(),
        exit_code: Some(1),
        ..Default::default()
    }
}

/// Noms des rapports demandés par `--out_json_file` dans un script
fn report_files(script: &str) -> Vec<String> {
    let tokens: Vec<&str> = script.split_whitespace().collect();
    tokens
        .windows(2)
        .filter(|w| w[0] == "--out_json_file")
        .filter_map(|w| Path::new(w[1]).file_name().and_then(|f| f.to_str()).map(String::from))
        .collect()
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adresse renvoyée par `ip addr show` pour cet hôte
    pub fn set_address(&self, host: &str, ip: &str) {
        self.state.lock().unwrap().addresses.insert(host.to_string(), ip.to_string());
    }

    /// L'interface de cet hôte n'a pas d'adresse IPv4
    pub fn remove_address(&self, host: &str) {
        self.state.lock().unwrap().unaddressed.insert(host.to_string());
    }

    /// ssh vers cet hôte échoue
    pub fn fail_exec(&self, host: &str) {
        self.state.lock().unwrap().failing_exec.insert(host.to_string());
    }

    /// scp depuis cet hôte échoue
    pub fn fail_fetch(&self, host: &str) {
        self.state.lock().unwrap().failing_fetch.insert(host.to_string());
    }

    /// Les processus lancés sur cet hôte ne démarrent jamais
    pub fn stall(&self, host: &str) {
        self.state.lock().unwrap().stalled.insert(host.to_string());
    }

    pub fn set_process_lifetime(&self, probes: usize) {
        self.state.lock().unwrap().process_lifetime = probes.max(1);
    }

    /// Décide de la valeur écrite dans chaque rapport produit par un lancement
    pub fn set_results<F>(&self, f: F)
    where
        F: Fn(&ArtifactName) -> Option<f64> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().results = Some(Arc::new(f));
    }

    /// Dépose un fichier brut dans le répertoire de rapports d'un hôte
    pub fn stage_report(&self, host: &str, file_name: &str, bytes: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .reports
            .entry(host.to_string())
            .or_default()
            .insert(file_name.to_string(), bytes);
    }

    /// Rapports présents côté hôte
    pub fn remote_reports(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .reports
            .get(host)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn running(&self, host: &str) -> usize {
        self.state.lock().unwrap().processes.get(host).map_or(0, Vec::len)
    }

    pub fn get_calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, host: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.host == host)
            .map(|c| c.command.clone())
            .collect()
    }

    /// Scripts perftest envoyés à cet hôte
    pub fn dispatched_to(&self, host: &str) -> Vec<String> {
        self.calls_to(host)
            .into_iter()
            .filter(|c| c.starts_with("( "))
            .collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
        let mut st = self.state.lock().unwrap();
        st.processes.clear();
        st.reports.clear();
        st.initiators_started = false;
    }

    fn record(&self, host: &str, command: &str) {
        self.calls.lock().unwrap().push(RemoteCall {
            host: host.to_string(),
            command: command.to_string(),
        });
    }

    fn answer(&self, host: &str, command: &str) -> ExecutionResult {
        let mut st = self.state.lock().unwrap();

        if command.starts_with("ip addr show") {
            if st.unaddressed.contains(host) {
                return reply("");
            }
            let next = format!("10.0.0.{}", st.addresses.len() + 1);
            let ip = st.addresses.entry(host.to_string()).or_insert(next).clone();
            return reply(format!("{ip}\n"));
        }

        if command.starts_with("ps aux") {
            let ticking = st.initiators_started;
            let procs = st.processes.entry(host.to_string()).or_default();
            let seen = procs.len();
            if ticking {
                for p in procs.iter_mut() {
                    *p -= 1;
                }
                procs.retain(|&left| left > 0);
            }
            return reply(format!("{seen}\n"));
        }

        if let Some(tool) = command.strip_prefix("killall ") {
            let killed = st.processes.remove(host).is_some_and(|p| !p.is_empty());
            return if killed {
                reply("")
            } else {
                refuse(format!("{tool}: no process found\n"))
            };
        }

        if command.starts_with("rm -f ") {
            st.reports.remove(host);
            return reply("");
        }

        if st.stalled.contains(host) {
            log::info!("🧊 [MOCK] {} accepted a script but nothing starts", host);
            return reply("");
        }

        // Un initiateur vise l'adresse d'un listener; les listeners attendent
        let initiator = {
            let tokens: HashSet<&str> = command.split_whitespace().collect();
            st.addresses.values().any(|ip| tokens.contains(ip.as_str()))
        };
        st.initiators_started = initiator;

        let launched = command.matches("2>&1 &").count();
        let lifetime = st.process_lifetime;
        st.processes.entry(host.to_string()).or_default().extend(std::iter::repeat(lifetime).take(launched));

        for file in report_files(command) {
            let Ok(name) = ArtifactName::parse(&file) else {
                log::warn!("⚠️ [MOCK] unparseable report name {}", file);
                continue;
            };
            let value = match &st.results {
                Some(f) => f(&name),
                None => Some(ArtifactWriter::default_value(name.kind())),
            };
            if let Some(v) = value {
                st.reports
                    .entry(host.to_string())
                    .or_default()
                    .insert(file, ArtifactWriter::payload(name.kind(), v));
            }
        }
        log::info!("🚀 [MOCK] {} launched {} process(es)", host, launched);
        reply("")
    }
}

#[async_trait]
impl RemoteExec for MockRemote {
    async fn exec(&self, host: &str, command: &str) -> Result<ExecutionResult, RemoteError> {
        self.record(host, command);
        if self.state.lock().unwrap().failing_exec.contains(host) {
            return Err(RemoteError::Failed {
                host: host.to_string(),
                code: Some(255),
                message: "ssh: connect to host: Connection refused".into(),
            });
        }
        Ok(self.answer(host, command))
    }

    async fn fetch(&self, host: &str, remote_pattern: &str, local_dir: &Path) -> Result<Vec<PathBuf>, RemoteError> {
        self.record(host, &format!("scp {remote_pattern}"));
        let files = {
            let st = self.state.lock().unwrap();
            if st.failing_fetch.contains(host) {
                return Err(RemoteError::Failed {
                    host: host.to_string(),
                    code: Some(1),
                    message: "scp: Connection closed".into(),
                });
            }
            st.reports.get(host).cloned().unwrap_or_default()
        };

        if files.is_empty() {
            log::info!("📭 [MOCK] {}: {}", host, NO_MATCH);
        }
        for (name, bytes) in files {
            let path = local_dir.join(&name);
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|source| RemoteError::Local { path, source })?;
        }
        log::info!("📥 [MOCK] fetched from {} into {}", host, local_dir.display());
        list_json(local_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshperf::readiness::process_count_command;
    use meshperf::resolve::address_command;

    const SCRIPT: &str = "( ib_write_lat -d mlx5_0 -p 20000 --out_json --out_json_file /tmp/perf/latency_incast_c_n1_mlx5_0_to_n2_mlx5_0_p20000.json >/dev/null 2>&1 & ) && \\\n( ib_write_lat -d mlx5_0 -p 20001 >/dev/null 2>&1 & )";

    #[test]
    fn test_report_files_extracted() {
        assert_eq!(
            report_files(SCRIPT),
            vec!["latency_incast_c_n1_mlx5_0_to_n2_mlx5_0_p20000.json"]
        );
    }

    #[tokio::test]
    async fn test_addresses_are_stable() {
        let remote = MockRemote::new();
        remote.set_address("n1", "192.168.1.10");
        let cmd = address_command("bond0");
        let a = remote.exec("n1", &cmd).await.unwrap();
        let b = remote.exec("n2", &cmd).await.unwrap();
        let b2 = remote.exec("n2", &cmd).await.unwrap();
        assert_eq!(a.stdout.trim(), "192.168.1.10");
        assert_eq!(b.stdout, b2.stdout);

        remote.remove_address("n3");
        assert_eq!(remote.exec("n3", &cmd).await.unwrap().stdout, "");
    }

    #[tokio::test]
    async fn test_listeners_wait_for_initiators() {
        let remote = MockRemote::new();
        remote.set_process_lifetime(2);
        remote.set_address("n2", "10.1.1.2");
        let ps = process_count_command("ib_write_lat");

        remote.exec("n2", SCRIPT).await.unwrap();
        for _ in 0..5 {
            assert_eq!(remote.exec("n2", &ps).await.unwrap().stdout.trim(), "2");
        }

        let initiator = "( ib_write_lat -d mlx5_0 -p 20000 10.1.1.2 >/dev/null 2>&1 & )";
        remote.exec("n1", initiator).await.unwrap();
        assert_eq!(remote.exec("n1", &ps).await.unwrap().stdout.trim(), "1");
        assert_eq!(remote.exec("n2", &ps).await.unwrap().stdout.trim(), "2");
        assert_eq!(remote.exec("n1", &ps).await.unwrap().stdout.trim(), "1");
        assert_eq!(remote.exec("n1", &ps).await.unwrap().stdout.trim(), "0");
        assert_eq!(remote.dispatched_to("n1").len(), 1);
    }

    #[tokio::test]
    async fn test_killall_without_processes() {
        let remote = MockRemote::new();
        let res = remote.exec("n1", "killall ib_write_bw").await.unwrap();
        assert!(!res.success());
        assert!(res.diagnostic().contains("no process found"));

        remote.exec("n1", SCRIPT).await.unwrap();
        assert!(remote.exec("n1", "killall ib_write_lat").await.unwrap().success());
        assert_eq!(remote.running("n1"), 0);
    }

    #[tokio::test]
    async fn test_launch_writes_reports_and_fetch_copies_them() {
        let remote = MockRemote::new();
        remote.set_results(|_| Some(3.5));
        remote.exec("n1", SCRIPT).await.unwrap();
        assert_eq!(remote.remote_reports("n1").len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let files = remote.fetch("n1", "/tmp/perf/*n1*.json", dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);

        remote.exec("n1", "rm -f /tmp/perf/*n1*.json").await.unwrap();
        assert!(remote.remote_reports("n1").is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let remote = MockRemote::new();
        remote.fail_exec("bad");
        remote.fail_fetch("n2");
        assert!(remote.exec("bad", "true").await.is_err());

        let dir = tempfile::tempdir().unwrap();
        assert!(remote.fetch("n2", "*", dir.path()).await.is_err());
        assert!(remote.fetch("n3", "*", dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_host_starts_nothing() {
        let remote = MockRemote::new();
        remote.stall("n1");
        remote.exec("n1", SCRIPT).await.unwrap();
        assert_eq!(remote.running("n1"), 0);
        assert!(remote.remote_reports("n1").is_empty());
        assert_eq!(remote.dispatched_to("n1").len(), 1);
    }
}
