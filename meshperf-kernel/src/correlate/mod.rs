//! Transforme un répertoire de rapports collectés en matrices d'endpoints.
//!
//! Seul le côté initiateur d'une paire porte une mesure. Les rapports listener
//! prouvent que le listener a tourné et sont comptés, rien de plus. Les noms de
//! bande passante n'ont pas de pair, la cible vient donc du plan via le port.

pub mod bandwidth;

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::artifact::{ArtifactName, ArtifactRecord, REPORT_EXT};
use crate::models::{ConnectionPair, Endpoint, Pattern, Role, TestKind};

/// Rapport inutilisable
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactFailure {
    pub path: PathBuf,
    /// Renseigné quand le nom se décode mais pas le contenu
    pub name: Option<ArtifactName>,
    pub error: String,
}

/// Tous les rapports trouvés sous un répertoire de collecte.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArtifactSet {
    pub records: Vec<ArtifactRecord>,
    pub failures: Vec<ArtifactFailure>,
}

impl ArtifactSet {
    /// Charge chaque fichier `.json` sous `dir`, dans l'ordre des chemins. Un
    /// répertoire absent donne un ensemble vide.
    pub fn load_dir(dir: &Path, pattern: Option<Pattern>) -> Self {
        let mut files = Vec::new();
        if let Err(e) = walk(dir, &mut files) {
            warn!(dir = %dir.display(), error = %e, "[correlate] cannot list reports");
        }
        files.sort();

        let mut set = Self::default();
        for path in files {
            match ArtifactRecord::load(&path, pattern) {
                Ok(rec) => set.records.push(rec),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "[correlate] skipping artifact");
                    set.failures.push(ArtifactFailure {
                        name: ArtifactRecord::decode_name(&path, pattern).ok(),
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }
        debug!(records = set.records.len(), failures = set.failures.len(), "[correlate] artifacts loaded");
        set
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.failures.is_empty()
    }
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // file_type() ne suit pas les liens symboliques: pas de boucle possible
        if entry.file_type()?.is_dir() {
            walk(&path, out)?;
        } else if path.to_string_lossy().ends_with(REPORT_EXT) {
            out.push(path);
        }
    }
    Ok(())
}

/// Somme courante et nombre d'échantillons d'une cellule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub sum: f64,
    pub count: usize,
}

impl Aggregate {
    pub fn add(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Lecture d'une cellule de matrice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Value(f64),
    /// Cellule attendue sans échantillon: la mesure a échoué
    Gap,
    /// Diagonale non planifiée: la paire n'a jamais été testée
    SelfPair,
}

/// `source -> cible -> agrégat`, indexé par `host:adapter`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    kind: TestKind,
    cells: BTreeMap<String, BTreeMap<String, Aggregate>>,
    planned: BTreeSet<(String, String)>,
}

impl Matrix {
    pub fn new(kind: TestKind) -> Self {
        Self {
            kind,
            cells: BTreeMap::new(),
            planned: BTreeSet::new(),
        }
    }

    /// Marque une cellule comme attendue: une diagonale vide devient un trou
    pub fn expect(&mut self, source: &str, target: &str) {
        self.planned.insert((source.to_string(), target.to_string()));
    }

    fn is_planned(&self, source: &str, target: &str) -> bool {
        self.planned.contains(&(source.to_string(), target.to_string()))
    }

    pub fn add(&mut self, source: &str, target: &str, v: f64) {
        self.cells
            .entry(source.to_string())
            .or_default()
            .entry(target.to_string())
            .or_default()
            .add(v);
    }

    /// Bande passante cumulée, latence moyennée
    pub fn value(&self, source: &str, target: &str) -> Option<f64> {
        let agg = self.cells.get(source)?.get(target)?;
        Some(match self.kind {
            TestKind::Bandwidth => agg.sum,
            TestKind::Latency => agg.mean(),
        })
    }

    pub fn cell(&self, source: &str, target: &str) -> Cell {
        match self.value(source, target) {
            Some(v) => Cell::Value(v),
            None if source == target && !self.is_planned(source, target) => Cell::SelfPair,
            None => Cell::Gap,
        }
    }

    pub fn aggregate(&self, source: &str, target: &str) -> Option<&Aggregate> {
        self.cells.get(source)?.get(target)
    }

    pub fn sources(&self) -> Vec<String> {
        self.cells.keys().cloned().collect()
    }

    pub fn targets(&self) -> Vec<String> {
        self.cells
            .values()
            .flat_map(|row| row.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cells.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn values(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        self.cells
            .iter()
            .map(|(s, row)| {
                let row = row
                    .keys()
                    .filter_map(|t| self.value(s, t).map(|v| (t.clone(), v)))
                    .collect();
                (s.clone(), row)
            })
            .collect()
    }
}

impl Serialize for Matrix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values().serialize(serializer)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Statistics {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = samples.iter().sum();
        Self {
            count: samples.len(),
            min,
            max,
            mean: sum / samples.len() as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GroupMean {
    pub mean: f64,
    pub count: usize,
}

impl From<Aggregate> for GroupMean {
    fn from(a: Aggregate) -> Self {
        Self { mean: a.mean(), count: a.count }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correlation {
    pub kind: TestKind,
    pub matrix: Matrix,
    pub statistics: Statistics,
    /// Échantillons par endpoint source, y compris ceux sans cible connue
    pub endpoint_totals: BTreeMap<String, Aggregate>,
    /// Lancements bipartis uniquement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_source: Option<BTreeMap<String, GroupMean>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_target: Option<BTreeMap<String, GroupMean>>,
    pub sink_reports: usize,
    /// Paires planifiées sans échantillon initiateur
    pub missing: Vec<ConnectionPair>,
    pub skipped: Vec<ArtifactFailure>,
}

enum Orientation {
    Source { source: Endpoint, target: Option<Endpoint> },
    Sink,
}

/// Corrèle les rapports d'un lancement, éventuellement avec son plan de génération.
#[derive(Debug, Clone)]
pub struct Correlator {
    kind: TestKind,
    pattern: Option<Pattern>,
    plan: BTreeMap<u16, ConnectionPair>,
}

impl Correlator {
    pub fn new(kind: TestKind, pattern: Option<Pattern>) -> Self {
        Self {
            kind,
            pattern,
            plan: BTreeMap::new(),
        }
    }

    pub fn with_plan(mut self, pairs: &[ConnectionPair]) -> Self {
        self.plan = pairs.iter().map(|p| (p.port, p.clone())).collect();
        self
    }

    fn orient(&self, name: &ArtifactName) -> Orientation {
        match name {
            ArtifactName::Latency { role: Role::Client, endpoint, peer, .. } => Orientation::Source {
                source: endpoint.clone(),
                target: Some(peer.clone()),
            },
            ArtifactName::Bandwidth { role: Role::Client, endpoint, port } => Orientation::Source {
                source: endpoint.clone(),
                target: self
                    .plan
                    .get(port)
                    .filter(|p| p.initiator() == endpoint)
                    .map(|p| p.listener().clone()),
            },
            ArtifactName::P2pBandwidth { endpoint, port } => match self.plan.get(port) {
                Some(p) if p.listener() == endpoint && p.initiator() != endpoint => Orientation::Sink,
                Some(p) if p.initiator() == endpoint => Orientation::Source {
                    source: endpoint.clone(),
                    target: Some(p.listener().clone()),
                },
                _ => Orientation::Source { source: endpoint.clone(), target: None },
            },
            ArtifactName::Latency { role: Role::Server, .. }
            | ArtifactName::Bandwidth { role: Role::Server, .. } => Orientation::Sink,
        }
    }

    pub fn correlate(&self, set: &ArtifactSet) -> Correlation {
        let mut matrix = Matrix::new(self.kind);
        for p in self.plan.values() {
            matrix.expect(&p.initiator().key(), &p.listener().key());
        }
        let mut endpoint_totals: BTreeMap<String, Aggregate> = BTreeMap::new();
        let mut samples = Vec::new();
        let mut sink_reports = 0;
        let mut skipped = set.failures.clone();
        let mut covered: BTreeSet<u16> = BTreeSet::new();

        for rec in &set.records {
            if rec.name.kind() != self.kind {
                skipped.push(ArtifactFailure {
                    path: rec.path.clone(),
                    name: Some(rec.name.clone()),
                    error: format!("not a {:?} report", self.kind),
                });
                continue;
            }
            match self.orient(&rec.name) {
                Orientation::Sink => sink_reports += 1,
                Orientation::Source { source, target } => {
                    let v = rec.sample.value();
                    samples.push(v);
                    endpoint_totals.entry(source.key()).or_default().add(v);
                    if let Some(target) = target {
                        matrix.add(&source.key(), &target.key(), v);
                        if self.planned(rec.name.port(), &source, &target) {
                            covered.insert(rec.name.port());
                        }
                    }
                }
            }
        }

        let bipartite = self.pattern == Some(Pattern::InCast);
        let (per_source, per_target) = if bipartite {
            let (s, t) = group_means(&matrix);
            (Some(s), Some(t))
        } else {
            (None, None)
        };

        let missing = self
            .plan
            .values()
            .filter(|p| !covered.contains(&p.port))
            .cloned()
            .collect();

        Correlation {
            kind: self.kind,
            statistics: Statistics::from_samples(&samples),
            matrix,
            endpoint_totals,
            per_source,
            per_target,
            sink_reports,
            missing,
            skipped,
        }
    }

    fn planned(&self, port: u16, source: &Endpoint, target: &Endpoint) -> bool {
        self.plan
            .get(&port)
            .is_some_and(|p| p.initiator() == source && p.listener() == target)
    }
}

type GroupMeans = BTreeMap<String, GroupMean>;

fn group_means(matrix: &Matrix) -> (GroupMeans, GroupMeans) {
    let mut by_source: BTreeMap<String, Aggregate> = BTreeMap::new();
    let mut by_target: BTreeMap<String, Aggregate> = BTreeMap::new();
    for source in matrix.sources() {
        for target in matrix.targets() {
            if let Some(v) = matrix.value(&source, &target) {
                by_source.entry(source.clone()).or_default().add(v);
                by_target.entry(target.clone()).or_default().add(v);
            }
        }
    }
    let into = |m: BTreeMap<String, Aggregate>| -> GroupMeans {
        m.into_iter().map(|(k, a)| (k, GroupMean::from(a))).collect()
    };
    (into(by_source), into(by_target))
}
