//! Guest-PC → translation mapping.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dbt::translation::Translation;

/// Concurrent map from guest PC to the installed translation.
///
/// Readers share the lock; installs take it exclusively. Each PC maps to
/// at most one translation, and simultaneous first-translations of the
/// same PC resolve first-commit-wins: the losing thread gets the winner
/// back and discards its own output. Dropping an entry only releases the
/// backing code once every in-flight invocation has dropped its `Arc`.
#[derive(Debug, Default)]
pub struct TranslationCache {
    translations: RwLock<HashMap<u64, Arc<Translation>>>,
}

impl TranslationCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The translation installed for `pc`, if any.
    pub fn lookup(&self, pc: u64) -> Option<Arc<Translation>> {
        self.translations.read().get(&pc).cloned()
    }

    /// Install a translation for `pc`. Returns the winning translation
    /// and whether `translation` was the one installed.
    pub fn insert(&self, pc: u64, translation: Translation) -> (Arc<Translation>, bool) {
        let mut map = self.translations.write();

        match map.entry(pc) {
            std::collections::hash_map::Entry::Occupied(existing) => (existing.get().clone(), false),
            std::collections::hash_map::Entry::Vacant(slot) => {
                let installed = Arc::new(translation);
                slot.insert(installed.clone());
                (installed, true)
            }
        }
    }

    /// Remove the translation for `pc`, handing it to the caller for
    /// unchaining. The buffer itself dies when the last reference does.
    pub fn remove(&self, pc: u64) -> Option<Arc<Translation>> {
        self.translations.write().remove(&pc)
    }

    /// Number of installed translations.
    pub fn len(&self) -> usize {
        self.translations.read().len()
    }

    /// `true` when nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.translations.read().is_empty()
    }
}
