/*!
# meshperf DevKit - Stubs et Utilitaires pour Tests

Bibliothèque facilitant les tests des flux meshperf avec:
- Flotte simulée implémentant `RemoteExec` (pas de ssh ni scp)
- Fixtures de rapports perftest au format JSON
- Harness de scénario prêt à l'emploi
*/

pub mod fixtures;
pub mod remote_stub;
pub mod test_utils;

pub use fixtures::ArtifactWriter;
pub use remote_stub::{MockRemote, RemoteCall};
pub use test_utils::TestHarness;
