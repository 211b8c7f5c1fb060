use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::remote::RemoteExec;

#[derive(Debug, thiserror::Error)]
#[error("cannot prepare local report directory {path}: {source}")]
pub struct CollectError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Fichiers d'un hôte dans un répertoire de rapports
pub fn host_pattern(report_dir: &str, host: &str) -> String {
    format!("{}/*{}*.json", report_dir.trim_end_matches('/'), host)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectResult {
    pub local_dir: PathBuf,
    /// Fichiers rapatriés par hôte
    pub collected: BTreeMap<String, usize>,
    /// Hôtes dont le rapatriement a échoué, avec la raison
    pub failures: BTreeMap<String, String>,
}

impl CollectResult {
    pub fn total_files(&self) -> usize {
        self.collected.values().sum()
    }

    pub fn failed_hosts(&self) -> Vec<String> {
        self.failures.keys().cloned().collect()
    }
}

/// Rapatrie les rapports des hôtes dans `<local_dir>/<host>/`.
pub struct Collector<'a, E: RemoteExec + ?Sized> {
    remote: &'a E,
    report_dir: String,
    local_dir: PathBuf,
}

impl<'a, E: RemoteExec + ?Sized> Collector<'a, E> {
    pub fn new(remote: &'a E, report_dir: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote,
            report_dir: report_dir.into(),
            local_dir: local_dir.into(),
        }
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Vide le répertoire local puis rapatrie depuis tous les hôtes en parallèle.
    /// L'échec d'un hôte n'arrête jamais les autres.
    pub async fn collect(&self, hosts: &[String], cleanup_remote: bool) -> Result<CollectResult, CollectError> {
        self.reset_local_dir().await?;

        let fetches = hosts.iter().map(|host| async move {
            let outcome = self.collect_host(host, cleanup_remote).await;
            (host.clone(), outcome)
        });

        let mut result = CollectResult {
            local_dir: self.local_dir.clone(),
            ..Default::default()
        };
        for (host, outcome) in join_all(fetches).await {
            match outcome {
                Ok(n) => {
                    result.collected.insert(host, n);
                }
                Err(reason) => {
                    warn!(%host, %reason, "[collect] host skipped");
                    result.failures.insert(host, reason);
                }
            }
        }
        info!(
            files = result.total_files(),
            failed_hosts = result.failures.len(),
            dir = %self.local_dir.display(),
            "[collect] reports collected"
        );
        Ok(result)
    }

    async fn collect_host(&self, host: &str, cleanup_remote: bool) -> Result<usize, String> {
        let dir = self.local_dir.join(host);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("create {}: {e}", dir.display()))?;

        let files = self
            .remote
            .fetch(host, &host_pattern(&self.report_dir, host), &dir)
            .await
            .map_err(|e| e.to_string())?;

        if cleanup_remote {
            self.purge_host(host).await;
        }
        Ok(files.len())
    }

    /// Supprime les rapports de cet hôte dans son répertoire. Les échecs sont
    /// seulement journalisés.
    pub async fn purge_host(&self, host: &str) {
        let cmd = format!("rm -f {}", host_pattern(&self.report_dir, host));
        match self.remote.exec(host, &cmd).await {
            Ok(res) if res.success() => {}
            Ok(res) => warn!(%host, error = %res.diagnostic(), "[collect] remote cleanup failed"),
            Err(e) => warn!(%host, error = %e, "[collect] remote cleanup failed"),
        }
    }

    /// Purge des anciens rapports avant un lancement
    pub async fn purge(&self, hosts: &[String]) {
        join_all(hosts.iter().map(|h| self.purge_host(h))).await;
        info!(hosts = hosts.len(), "[collect] stale reports removed");
    }

    async fn reset_local_dir(&self) -> Result<(), CollectError> {
        let err = |source| CollectError {
            path: self.local_dir.clone(),
            source,
        };
        if tokio::fs::try_exists(&self.local_dir).await.map_err(err)? {
            tokio::fs::remove_dir_all(&self.local_dir).await.map_err(err)?;
        }
        tokio::fs::create_dir_all(&self.local_dir).await.map_err(err)
    }
}
