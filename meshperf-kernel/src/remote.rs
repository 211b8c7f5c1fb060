//! Exécution distante via ssh/scp.
//!
//! Tout ce qui touche un hôte de la flotte passe par [`RemoteExec`], ce qui
//! permet de piloter l'orchestration avec une doublure scriptée en test.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::config::SshConf;

/// Résultat d'une commande distante
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr si présent, sinon stdout, sans espaces autour
    pub fn diagnostic(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to spawn {program} for {host}: {source}")]
    Spawn {
        host: String,
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{host}: timed out after {secs}s")]
    Timeout { host: String, secs: u64 },
    #[error("{host}: exit {code:?}: {message}")]
    Failed {
        host: String,
        code: Option<i32>,
        message: String,
    },
    #[error("local io error on {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Capacité shell distant bloquante.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Exécute `command` via le shell distant. Un code de sortie non nul est un
    /// résultat, pas une erreur; une erreur signifie que la commande n'a pas abouti.
    async fn exec(&self, host: &str, command: &str) -> Result<ExecutionResult, RemoteError>;

    /// Copie les fichiers correspondant à `remote_pattern` dans `local_dir` et
    /// retourne les fichiers locaux présents. Aucune correspondance n'est pas une erreur.
    async fn fetch(&self, host: &str, remote_pattern: &str, local_dir: &Path) -> Result<Vec<PathBuf>, RemoteError>;
}

/// Transport de production: sous-processus `ssh` et `scp`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: Option<String>,
    private_key: Option<PathBuf>,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(conf: &SshConf) -> Self {
        let key = expand_home(&conf.private_key);
        Self {
            user: conf.user.clone(),
            private_key: key.filter(|k| k.exists()),
            timeout: Duration::from_secs(conf.timeout_seconds),
        }
    }

    fn destination(&self, host: &str) -> String {
        match &self.user {
            Some(u) => format!("{u}@{host}"),
            None => host.to_string(),
        }
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
        ];
        if let Some(key) = &self.private_key {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args
    }

    async fn run(&self, program: &'static str, host: &str, args: Vec<String>) -> Result<ExecutionResult, RemoteError> {
        let start = Instant::now();
        debug!(host, "[remote] {program} {}", shell_words::join(&args));

        let output = tokio::time::timeout(
            self.timeout,
            AsyncCommand::new(program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| RemoteError::Timeout {
            host: host.to_string(),
            secs: self.timeout.as_secs(),
        })?
        .map_err(|source| RemoteError::Spawn {
            host: host.to_string(),
            program,
            source,
        })?;

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            execution_time_ms: start.elapsed().as_millis(),
        })
    }
}

#[async_trait]
impl RemoteExec for SshExecutor {
    async fn exec(&self, host: &str, command: &str) -> Result<ExecutionResult, RemoteError> {
        let mut args = self.common_args();
        args.push(self.destination(host));
        args.push(command.to_string());
        self.run("ssh", host, args).await
    }

    async fn fetch(&self, host: &str, remote_pattern: &str, local_dir: &Path) -> Result<Vec<PathBuf>, RemoteError> {
        let mut args = self.common_args();
        args.push(format!("{}:{}", self.destination(host), remote_pattern));
        args.push(format!("{}/", local_dir.display()));

        let res = self.run("scp", host, args).await?;
        if !res.success() && !nothing_matched(&res) {
            return Err(RemoteError::Failed {
                host: host.to_string(),
                code: res.exit_code,
                message: res.diagnostic(),
            });
        }
        list_json(local_dir).await
    }
}

fn nothing_matched(res: &ExecutionResult) -> bool {
    res.diagnostic().contains(NO_MATCH)
}

/// Message de scp quand le glob distant ne correspond à rien
pub const NO_MATCH: &str = "No such file or directory";

/// Fichiers `.json` directement sous `dir`, triés
pub async fn list_json(dir: &Path) -> Result<Vec<PathBuf>, RemoteError> {
    let local = |source| RemoteError::Local { path: dir.to_path_buf(), source };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(local)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(local)? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn expand_home(path: &str) -> Option<PathBuf> {
    if path.is_empty() {
        return None;
    }
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME").map(|home| PathBuf::from(home).join(rest)),
        None => Some(PathBuf::from(path)),
    }
}
