/*!
Fixtures de rapports perftest

Écrit des rapports JSON au format de `ib_write_bw` / `ib_write_lat`
(`--out_json`), nommés comme le ferait un vrai lancement.
*/

use anyhow::Result;
use meshperf::artifact::ArtifactName;
use meshperf::models::{ConnectionPair, Pattern, Role, TestKind};
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::remote_stub::MockRemote;

pub struct ArtifactWriter {
    kind: TestKind,
    pattern: Pattern,
}

impl ArtifactWriter {
    pub fn new(kind: TestKind, pattern: Pattern) -> Self {
        Self { kind, pattern }
    }

    /// Valeur plausible quand le test ne la précise pas
    pub fn default_value(kind: TestKind) -> f64 {
        match kind {
            TestKind::Bandwidth => 100.0,
            TestKind::Latency => 2.0,
        }
    }

    /// Corps JSON d'un rapport
    pub fn payload(kind: TestKind, value: f64) -> Vec<u8> {
        let body = match kind {
            TestKind::Bandwidth => json!({
                "test_name": "ib_write_bw",
                "results": {
                    "BW_peak": value * 1.02,
                    "BW_average": value,
                    "MsgRate": value * 30.5
                }
            }),
            TestKind::Latency => json!({
                "test_name": "ib_write_lat",
                "results": {
                    "t_min": value * 0.8,
                    "t_max": value * 1.5,
                    "t_avg": value,
                    "t_stdev": 0.05
                }
            }),
        };
        body.to_string().into_bytes()
    }

    pub fn name(&self, pair: &ConnectionPair, role: Role) -> ArtifactName {
        ArtifactName::for_pair(pair, role, self.kind, self.pattern)
    }

    /// Écrit le rapport du côté `role` de `pair` dans `dir`
    pub fn write(&self, dir: &Path, pair: &ConnectionPair, role: Role, value: f64) -> Result<PathBuf> {
        Self::write_raw(dir, &self.name(pair, role).file_name(), &Self::payload(self.kind, value))
    }

    /// Fichier arbitraire, pour les rapports corrompus ou mal nommés
    pub fn write_raw(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(file_name);
        std::fs::write(&path, bytes)?;
        log::info!("📝 Wrote fixture {}", path.display());
        Ok(path)
    }

    /// Dépose le rapport sur l'hôte simulé qui l'aurait produit
    pub fn stage(&self, remote: &MockRemote, pair: &ConnectionPair, role: Role, value: f64) {
        let host = &pair.endpoint(role).host;
        remote.stage_report(host, &self.name(pair, role).file_name(), Self::payload(self.kind, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshperf::artifact::{ArtifactRecord, Sample};
    use meshperf::models::Endpoint;

    fn pair() -> ConnectionPair {
        ConnectionPair::new(Endpoint::new("srv", "mlx5_0"), Endpoint::new("cli", "mlx5_1"), 20004)
    }

    #[test]
    fn test_written_reports_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(TestKind::Latency, Pattern::FullMesh);
        let path = writer.write(dir.path(), &pair(), Role::Client, 2.0).unwrap();

        let rec = ArtifactRecord::load(&path, Some(Pattern::FullMesh)).unwrap();
        assert_eq!(rec.name.endpoint().host, "cli");
        assert_eq!(rec.name.peer().unwrap().host, "srv");
        assert_eq!(rec.sample, Sample::Latency { avg_us: 2.0, min_us: 1.6, max_us: 3.0 });
    }

    #[test]
    fn test_stage_targets_the_writing_host() {
        let remote = MockRemote::new();
        let writer = ArtifactWriter::new(TestKind::Bandwidth, Pattern::InCast);
        writer.stage(&remote, &pair(), Role::Server, 180.0);
        assert_eq!(remote.remote_reports("srv"), vec!["report_s_srv_mlx5_0_20004.json"]);
        assert!(remote.remote_reports("cli").is_empty());
    }
}
