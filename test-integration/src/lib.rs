/*!
Scénarios de bout en bout sur flotte simulée

Les tests vivent dans `tests/`; ce module fournit les règles de résultats
partagées (quelle mesure chaque rapport contient).
*/

use meshperf::artifact::ArtifactName;
use meshperf::models::Role;
use meshperf_devkit::test_utils::DEFAULT_ADAPTER;
use std::collections::HashMap;

/// `host:mlx5_0`
pub fn key(host: &str) -> String {
    format!("{host}:{DEFAULT_ADAPTER}")
}

/// Rapports initiateurs uniquement, valeur choisie par hôte initiateur.
/// Les hôtes absents n'écrivent rien.
pub fn initiators(values: &[(&str, f64)]) -> impl Fn(&ArtifactName) -> Option<f64> + Send + Sync + 'static {
    let values: HashMap<String, f64> = values.iter().map(|(h, v)| (h.to_string(), *v)).collect();
    move |name| match name.role() {
        Some(Role::Client) => values.get(&name.endpoint().host).copied(),
        _ => None,
    }
}

/// Comme [`initiators`], plus une valeur fixe pour chaque rapport listener.
pub fn with_listeners(
    values: &[(&str, f64)],
    listener_value: f64,
) -> impl Fn(&ArtifactName) -> Option<f64> + Send + Sync + 'static {
    let clients = initiators(values);
    move |name| match name.role() {
        Some(Role::Server) => Some(listener_value),
        _ => clients(name),
    }
}

/// Même valeur pour tous les rapports
pub fn uniform(value: f64) -> impl Fn(&ArtifactName) -> Option<f64> + Send + Sync + 'static {
    move |_| Some(value)
}
