use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::models::{EndpointGroup, Pattern};
use crate::readiness::PollSettings;
use crate::topology::TopologyRoles;

pub const CONFIG_ENV: &str = "MESHPERF_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path} not found")]
    NotFound { path: PathBuf },
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("configuration error: {0}")]
    Invalid(String),
}

/// Configuration de flotte, un document YAML. Chaque champ a une valeur par défaut.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub start_port: u16,
    pub stream_type: Pattern,
    pub qp_num: u32,
    pub message_size_bytes: u32,
    /// Débit de ligne par carte, Gbps
    pub speed: f64,
    pub rdma_cm: bool,
    pub gid_index: u32,
    pub network_interface: String,
    pub report: ReportConf,
    pub run: RunConf,
    pub ssh: SshConf,
    pub server: GroupConf,
    pub client: GroupConf,
    pub readiness: ReadinessConf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConf {
    pub enable: bool,
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConf {
    pub infinitely: bool,
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConf {
    pub private_key: String,
    pub user: Option<String>,
    /// Délai par appel ssh/scp
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConf {
    pub hostname: Vec<String>,
    pub hca: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConf {
    pub interval_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            start_port: 20000,
            stream_type: Pattern::InCast,
            qp_num: 10,
            message_size_bytes: 4096,
            speed: 400.0,
            rdma_cm: false,
            gid_index: 3,
            network_interface: "bond0".into(),
            report: ReportConf::default(),
            run: RunConf::default(),
            ssh: SshConf::default(),
            server: GroupConf::default(),
            client: GroupConf::default(),
            readiness: ReadinessConf::default(),
            output_dir: PathBuf::from("reports"),
        }
    }
}

impl Default for ReportConf {
    fn default() -> Self {
        Self { enable: true, dir: "/root".into() }
    }
}

impl Default for RunConf {
    fn default() -> Self {
        Self { infinitely: false, duration_seconds: 10 }
    }
}

impl Default for SshConf {
    fn default() -> Self {
        Self {
            private_key: "~/.ssh/id_rsa".into(),
            user: None,
            timeout_seconds: 60,
        }
    }
}

impl Default for ReadinessConf {
    fn default() -> Self {
        Self { interval_ms: 1000, timeout_seconds: 600 }
    }
}

impl FleetConfig {
    pub fn from_yaml(path: &Path, txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn server_group(&self) -> EndpointGroup {
        EndpointGroup::new(self.server.hostname.iter().cloned(), self.server.hca.iter().cloned())
    }

    pub fn client_group(&self) -> EndpointGroup {
        EndpointGroup::new(self.client.hostname.iter().cloned(), self.client.hca.iter().cloned())
    }

    /// Rôles pour le `stream_type` configuré
    pub fn roles(&self) -> TopologyRoles {
        TopologyRoles::for_pattern(self.stream_type, self.server_group(), self.client_group())
    }

    /// Union dédoublonnée des hôtes serveur et client, serveurs d'abord
    pub fn all_hosts(&self) -> Vec<String> {
        self.roles().all_hosts()
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.readiness.interval_ms),
            timeout: Duration::from_secs(self.readiness.timeout_seconds),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_port == 0 {
            return Err(ConfigError::Invalid("start_port must be greater than 0".into()));
        }
        if self.server.hostname.is_empty() {
            return Err(ConfigError::Invalid("server.hostname is empty".into()));
        }
        if self.server.hca.is_empty() {
            return Err(ConfigError::Invalid("server.hca is empty".into()));
        }
        let needs_clients = !matches!(self.stream_type, Pattern::LocalTest);
        if needs_clients && (self.client.hostname.is_empty() || self.client.hca.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "stream_type {} needs client.hostname and client.hca",
                self.stream_type
            )));
        }
        if self.readiness.interval_ms == 0 {
            return Err(ConfigError::Invalid("readiness.interval_ms must be greater than 0".into()));
        }
        if self.speed <= 0.0 {
            return Err(ConfigError::Invalid("speed must be positive".into()));
        }
        for host in self.server.hostname.iter().chain(&self.client.hostname) {
            if host.contains('_') {
                return Err(ConfigError::Invalid(format!(
                    "hostname {host} contains '_', which report file names reserve as separator"
                )));
            }
        }
        for hca in self.server.hca.iter().chain(&self.client.hca) {
            if hca.split('_').any(|w| w == "to" || w == "from") {
                return Err(ConfigError::Invalid(format!(
                    "hca {hca} uses a reserved word ('to' or 'from')"
                )));
            }
        }
        Ok(())
    }
}

/// Chemin explicite, sinon `MESHPERF_CONFIG`, sinon `config.yaml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(p) => p.to_path_buf(),
        None => std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
    }
}

pub async fn load_config(path: &Path) -> Result<FleetConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound { path: path.to_path_buf() });
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = FleetConfig::from_yaml(path, &txt)?;
    tracing::debug!(path = %path.display(), pattern = %cfg.stream_type, "[config] loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
start_port: 21000
stream_type: fullmesh
speed: 200
server:
  hostname: [node1, node2]
  hca: [mlx5_0]
client:
  hostname: [node3]
  hca: [mlx5_0, mlx5_1]
report:
  dir: /tmp/reports
"#;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let cfg = FleetConfig::from_yaml(Path::new("x.yaml"), SAMPLE).unwrap();
        assert_eq!(cfg.start_port, 21000);
        assert_eq!(cfg.stream_type, Pattern::FullMesh);
        assert_eq!(cfg.qp_num, 10);
        assert_eq!(cfg.gid_index, 3);
        assert!(cfg.report.enable);
        assert_eq!(cfg.report.dir, "/tmp/reports");
        assert_eq!(cfg.run.duration_seconds, 10);
        assert_eq!(cfg.readiness.timeout_seconds, 600);
        assert_eq!(cfg.network_interface, "bond0");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        let cfg = FleetConfig::from_yaml(Path::new("x.yaml"), "  \n").unwrap();
        assert_eq!(cfg.start_port, 20000);
        assert_eq!(cfg.stream_type, Pattern::InCast);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = FleetConfig::from_yaml(Path::new("x.yaml"), SAMPLE).unwrap();
        cfg.start_port = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = FleetConfig::from_yaml(Path::new("x.yaml"), SAMPLE).unwrap();
        cfg.server.hostname.push("bad_host".into());
        assert!(cfg.validate().is_err());

        let mut cfg = FleetConfig::from_yaml(Path::new("x.yaml"), SAMPLE).unwrap();
        cfg.client.hca.push("port_to_x".into());
        assert!(cfg.validate().is_err());

        let mut cfg = FleetConfig::from_yaml(Path::new("x.yaml"), SAMPLE).unwrap();
        cfg.stream_type = Pattern::InCast;
        cfg.client.hostname.clear();
        assert!(cfg.validate().is_err());
        cfg.stream_type = Pattern::LocalTest;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_all_hosts_deduplicated() {
        let mut cfg = FleetConfig::from_yaml(Path::new("x.yaml"), SAMPLE).unwrap();
        cfg.client.hostname = vec!["node2".into(), "node3".into()];
        assert_eq!(cfg.all_hosts(), vec!["node1", "node2", "node3"]);
    }

    #[tokio::test]
    async fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = load_config(file.path()).await.unwrap();
        assert_eq!(cfg.server.hostname, vec!["node1", "node2"]);

        let missing = load_config(Path::new("/nonexistent/meshperf.yaml")).await;
        assert!(matches!(missing, Err(ConfigError::NotFound { .. })));
    }

    #[test]
    fn test_shipped_example_is_valid() {
        let txt = include_str!("../../config.example.yaml");
        let cfg = FleetConfig::from_yaml(Path::new("config.example.yaml"), txt).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.roles().server.len(), 2);
        assert_eq!(cfg.ssh.user, None);
    }

    #[test]
    fn test_invalid_yaml_reports_path() {
        let err = FleetConfig::from_yaml(Path::new("bad.yaml"), "start_port: [").unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }
}
