use parking_lot::Mutex;
use std::sync::Arc;

/// État partagé entre un flux en cours et ceux qui l'observent.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Copie de la valeur courante, verrou relâché au retour
pub fn snapshot<T: Clone>(state: &Shared<T>) -> T {
    state.lock().clone()
}
