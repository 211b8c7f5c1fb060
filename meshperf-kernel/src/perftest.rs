//! Lignes de commande des outils perftest (`ib_write_bw`, `ib_write_lat`).

use crate::config::FleetConfig;
use crate::models::TestKind;

/// Durée fixe des tests de latence, quel que soit `run.duration_seconds`.
pub const LATENCY_DURATION_SECS: u32 = 5;

/// Réglages communs à toutes les commandes d'un lancement.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSettings {
    pub kind: TestKind,
    pub qp_num: u32,
    pub message_size_bytes: u32,
    pub duration_seconds: u32,
    pub infinitely: bool,
    pub rdma_cm: bool,
    pub gid_index: u32,
    pub report: bool,
    pub report_dir: String,
}

impl CommandSettings {
    pub fn from_config(cfg: &FleetConfig, kind: TestKind) -> Self {
        let (duration_seconds, infinitely) = match kind {
            TestKind::Bandwidth => (cfg.run.duration_seconds, cfg.run.infinitely),
            TestKind::Latency => (LATENCY_DURATION_SECS, false),
        };
        Self {
            kind,
            qp_num: cfg.qp_num,
            message_size_bytes: cfg.message_size_bytes,
            duration_seconds,
            infinitely,
            rdma_cm: cfg.rdma_cm,
            gid_index: cfg.gid_index,
            report: cfg.report.enable,
            report_dir: cfg.report.dir.trim_end_matches('/').to_string(),
        }
    }

    /// Rapports écrits seulement pour un lancement fini avec rapports activés
    pub fn writes_reports(&self) -> bool {
        self.report && !self.infinitely
    }
}

/// Une invocation perftest, côté listener quand `peer_ip` vaut `None`.
#[derive(Debug, Clone)]
pub struct PerftestCommand<'a> {
    settings: &'a CommandSettings,
    device: &'a str,
    port: u16,
    peer_ip: Option<&'a str>,
    report_file: Option<&'a str>,
}

impl<'a> PerftestCommand<'a> {
    pub fn listener(settings: &'a CommandSettings, device: &'a str, port: u16) -> Self {
        Self { settings, device, port, peer_ip: None, report_file: None }
    }

    pub fn initiator(settings: &'a CommandSettings, device: &'a str, port: u16, peer_ip: &'a str) -> Self {
        Self { settings, device, port, peer_ip: Some(peer_ip), report_file: None }
    }

    /// Nom du rapport, placé sous le répertoire de rapports configuré
    pub fn report_to(mut self, file_name: &'a str) -> Self {
        self.report_file = Some(file_name);
        self
    }

    pub fn render(&self) -> String {
        let s = self.settings;
        let mut args: Vec<String> = vec![s.kind.tool().to_string(), "-d".into(), self.device.to_string()];

        if s.infinitely {
            args.push("--run_infinitely".into());
        } else {
            args.push("-D".into());
            args.push(s.duration_seconds.to_string());
        }
        if s.kind == TestKind::Bandwidth {
            args.push("-q".into());
            args.push(s.qp_num.to_string());
            args.push("-m".into());
            args.push(s.message_size_bytes.to_string());
        }
        args.push("-p".into());
        args.push(self.port.to_string());
        if s.rdma_cm {
            args.push("-R".into());
        }
        if s.gid_index > 0 {
            args.push("-x".into());
            args.push(s.gid_index.to_string());
        }
        if let Some(ip) = self.peer_ip {
            args.push(ip.to_string());
        }
        if let (true, Some(file)) = (s.writes_reports(), self.report_file) {
            let path = format!("{}/{}", s.report_dir, file);
            if s.kind == TestKind::Bandwidth {
                args.push("--report_gbits".into());
            }
            args.push("--out_json".into());
            args.push("--out_json_file".into());
            args.push(path);
        }

        let mut line = shell_words::join(&args);
        line.push_str(" >/dev/null 2>&1 &");
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(kind: TestKind) -> CommandSettings {
        CommandSettings::from_config(&FleetConfig::default(), kind)
    }

    #[test]
    fn test_bandwidth_listener() {
        let s = settings(TestKind::Bandwidth);
        let cmd = PerftestCommand::listener(&s, "mlx5_0", 20000)
            .report_to("report_s_node1_mlx5_0_20000.json")
            .render();
        assert_eq!(
            cmd,
            "ib_write_bw -d mlx5_0 -D 10 -q 10 -m 4096 -p 20000 -x 3 --report_gbits --out_json \
             --out_json_file /root/report_s_node1_mlx5_0_20000.json >/dev/null 2>&1 &"
        );
    }

    #[test]
    fn test_latency_initiator_has_peer_and_no_bandwidth_flags() {
        let s = settings(TestKind::Latency);
        let cmd = PerftestCommand::initiator(&s, "mlx5_1", 20001, "10.0.0.2")
            .report_to("lat.json")
            .render();
        assert!(cmd.starts_with("ib_write_lat -d mlx5_1 -D 5 -p 20001 -x 3 10.0.0.2 --out_json"));
        assert!(!cmd.contains("-q "));
        assert!(!cmd.contains("-m "));
        assert!(!cmd.contains("--report_gbits"));
    }

    #[test]
    fn test_infinite_run_skips_report() {
        let mut cfg = FleetConfig::default();
        cfg.run.infinitely = true;
        cfg.rdma_cm = true;
        cfg.gid_index = 0;
        let s = CommandSettings::from_config(&cfg, TestKind::Bandwidth);
        let cmd = PerftestCommand::listener(&s, "mlx5_0", 20000).report_to("r.json").render();
        assert!(cmd.contains("--run_infinitely"));
        assert!(cmd.contains(" -R"));
        assert!(!cmd.contains("-x"));
        assert!(!cmd.contains("--out_json"));
    }

    #[test]
    fn test_report_dir_with_spaces_is_quoted() {
        let mut s = settings(TestKind::Bandwidth);
        s.report_dir = "/data/perf runs".into();
        let cmd = PerftestCommand::listener(&s, "mlx5_0", 20000).report_to("r.json").render();
        assert!(cmd.contains("'/data/perf runs/r.json'"));
    }
}
