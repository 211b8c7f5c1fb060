/**
 * MESHPERF - Point d'entrée en ligne de commande
 *
 * RÔLE : Charge la config de flotte, lance le flux demandé et affiche son
 * résultat en JSON sur stdout. Les logs partent sur stderr.
 *
 * CODE DE SORTIE : 0 en cas de succès, 1 sur toute erreur ou lien en mauvaise santé.
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshperf::config::{config_path, load_config};
use meshperf::models::TestKind;
use meshperf::remote::SshExecutor;
use meshperf::workflow::Workflow;

#[derive(Parser, Debug)]
#[command(name = "meshperf", author, version, about = "Orchestration perftest RDMA sur une flotte d'hôtes")]
struct Cli {
    /// Config de flotte (défaut: $MESHPERF_CONFIG, puis ./config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Affiche le plan de paires et les scripts par hôte sans rien lancer
    Generate {
        #[arg(short, long, value_enum, default_value_t = Kind::Bw)]
        kind: Kind,
    },
    /// Lance un test sur la flotte
    Run {
        #[arg(short, long, value_enum, default_value_t = Kind::Bw)]
        kind: Kind,
        /// Rend la main dès l'envoi des clients, sans attendre ni analyser
        #[arg(long)]
        detach: bool,
    },
    /// Compte les processus perftest actifs sur chaque hôte
    Probe {
        #[arg(short, long, value_enum, default_value_t = Kind::Bw)]
        kind: Kind,
    },
    /// Rapatrie les rapports de chaque hôte
    Collect {
        /// Laisse les copies distantes en place
        #[arg(long)]
        keep_remote: bool,
    },
    /// Rapport de bande passante à partir des fichiers déjà collectés
    Analyze,
    /// Test de latence avec matrice et statistiques
    Lat,
    /// Vérification de connectivité bidirectionnelle, sortie non nulle sur tout lien défaillant
    CheckConn,
    /// Tue les processus perftest sur chaque hôte
    Stop {
        #[arg(short, long, value_enum, default_value_t = Kind::Bw)]
        kind: Kind,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Bw,
    Lat,
}

impl From<Kind> for TestKind {
    fn from(k: Kind) -> Self {
        match k {
            Kind::Bw => TestKind::Bandwidth,
            Kind::Lat => TestKind::Latency,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("failed to encode result")?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshperf=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("[meshperf] {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let path = config_path(cli.config.as_deref());
    let cfg = load_config(&path).await.context("cannot load fleet config")?;
    info!(config = %path.display(), pattern = %cfg.stream_type, "[meshperf] config loaded");

    let ssh = SshExecutor::new(&cfg.ssh);
    let workflow = Workflow::new(&cfg, &ssh);

    match cli.command {
        Command::Generate { kind } => {
            let plan = workflow.generate(kind.into()).await?;
            print_json(&plan)?;
        }
        Command::Run { kind, detach } => {
            let kind: TestKind = kind.into();
            let detached = detach || cfg.run.infinitely;
            match kind {
                TestKind::Bandwidth if !detached => print_json(&workflow.bandwidth().await?)?,
                TestKind::Latency if !detached => print_json(&workflow.latency().await?)?,
                _ => print_json(&workflow.run(kind).await?)?,
            }
        }
        Command::Probe { kind } => {
            let summary = workflow.probe(kind.into()).await;
            print_json(&summary)?;
        }
        Command::Collect { keep_remote } => {
            let hosts = cfg.all_hosts();
            let result = workflow.collect(&hosts, &cfg.output_dir, !keep_remote).await?;
            print_json(&result)?;
            if !result.failures.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Analyze => {
            let outcome = workflow.analyze_bandwidth();
            print_json(&outcome)?;
        }
        Command::Lat => {
            let outcome = workflow.latency().await?;
            print_json(&outcome)?;
        }
        Command::CheckConn => {
            let summary = workflow.check_connectivity().await?;
            print_json(&summary)?;
            if !summary.is_healthy() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Stop { kind } => {
            let report = workflow.stop(kind.into()).await;
            print_json(&report)?;
            if !report.failures.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
