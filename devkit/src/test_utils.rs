/*!
Test Harness pour scénarios meshperf

Facilite l'écriture de tests de bout en bout avec:
- Une flotte simulée (`MockRemote`) déjà branchée
- Une configuration rapide (sondes courtes, sorties en répertoire temporaire)
- Des assertions sur les scripts envoyés aux hôtes
*/

use anyhow::Result;
use meshperf::config::{FleetConfig, GroupConf};
use meshperf::correlate::ArtifactSet;
use meshperf::models::Pattern;
use meshperf::workflow::Workflow;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::remote_stub::MockRemote;

pub const DEFAULT_ADAPTER: &str = "mlx5_0";

/// Harness de test: configuration + flotte simulée + répertoire de travail
pub struct TestHarness {
    pub remote: MockRemote,
    pub config: FleetConfig,
    workdir: TempDir,
}

fn group(hosts: &[&str]) -> GroupConf {
    GroupConf {
        hostname: hosts.iter().map(|h| h.to_string()).collect(),
        hca: vec![DEFAULT_ADAPTER.to_string()],
    }
}

impl TestHarness {
    /// Flotte `servers` / `clients`, une carte `mlx5_0` par hôte
    pub fn new(pattern: Pattern, servers: &[&str], clients: &[&str]) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let workdir = tempfile::tempdir().unwrap();
        let mut config = FleetConfig {
            stream_type: pattern,
            server: group(servers),
            client: group(clients),
            output_dir: workdir.path().join("reports"),
            ..FleetConfig::default()
        };
        config.report.dir = "/tmp/perf".into();
        config.run.duration_seconds = 2;
        config.readiness.interval_ms = 100;
        config.readiness.timeout_seconds = 5;

        log::info!("🧪 Harness ready: {} server(s), {} client(s)", servers.len(), clients.len());
        Self {
            remote: MockRemote::new(),
            config,
            workdir,
        }
    }

    pub fn with_adapters(mut self, server: &[&str], client: &[&str]) -> Self {
        self.config.server.hca = server.iter().map(|a| a.to_string()).collect();
        self.config.client.hca = client.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn workflow(&self) -> Workflow<'_, MockRemote> {
        Workflow::new(&self.config, &self.remote)
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Écrit la configuration courante en YAML, pour les tests du chargeur
    pub fn write_config(&self) -> Result<PathBuf> {
        let path = self.workdir().join("config.yaml");
        std::fs::write(&path, serde_yaml::to_string(&self.config)?)?;
        log::info!("📄 Config written to {}", path.display());
        Ok(path)
    }

    /// Rapports actuellement présents dans le répertoire de sortie
    pub fn collected(&self) -> ArtifactSet {
        ArtifactSet::load_dir(self.output_dir(), Some(self.config.stream_type))
    }

    /// Assert que `host` a reçu exactement `count` scripts perftest
    pub fn assert_dispatched(&self, host: &str, count: usize) -> Result<()> {
        let actual = self.remote.dispatched_to(host).len();
        if actual != count {
            anyhow::bail!("Expected {} script(s) dispatched to {}, got {}", count, host, actual);
        }
        log::info!("✅ {}: {} script(s) as expected", host, actual);
        Ok(())
    }

    /// Assert qu'aucun hôte de la liste n'a reçu de script
    pub fn assert_untouched(&self, hosts: &[&str]) -> Result<()> {
        for host in hosts {
            self.assert_dispatched(host, 0)?;
        }
        Ok(())
    }

    /// Reset la flotte simulée pour un nouveau scénario
    pub fn reset(&mut self) {
        self.remote.clear();
        log::info!("🧹 Test harness reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshperf::config::load_config;

    #[test]
    fn test_harness_config_is_valid() {
        let harness = TestHarness::new(Pattern::InCast, &["s1"], &["c1", "c2"]);
        harness.config.validate().unwrap();
        assert!(harness.output_dir().starts_with(harness.workdir()));
        assert_eq!(harness.config.all_hosts(), vec!["s1", "c1", "c2"]);
        harness.assert_untouched(&["s1", "c1"]).unwrap();
    }

    #[tokio::test]
    async fn test_written_config_loads_back() {
        let harness = TestHarness::new(Pattern::FullMesh, &["a", "b"], &[]).with_adapters(&["mlx5_0", "mlx5_1"], &[]);
        let path = harness.write_config().unwrap();
        let loaded = load_config(&path).await.unwrap();
        assert_eq!(loaded.stream_type, Pattern::FullMesh);
        assert_eq!(loaded.server.hca, vec!["mlx5_0", "mlx5_1"]);
        assert_eq!(loaded.output_dir, harness.config.output_dir);
    }
}
