//! Known-available module cache.
//!
//! Append-only: once a deployment reports a module version as available the
//! fact is never revoked, so racing writers recording the same module are
//! harmless. One cache is shared by every provisioner of a deployment.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::model::Module;

#[derive(Debug, Clone, Default)]
pub struct ModuleCache {
    available: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, module: &Module) -> bool {
        self.available
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&module.name)
            .is_some_and(|versions| versions.contains(&module.version))
    }

    /// Record `module` as available. Returns whether it was new.
    pub fn insert(&self, module: &Module) -> bool {
        self.available
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(module.name.clone())
            .or_default()
            .insert(module.version.clone())
    }

    /// Number of distinct module versions recorded.
    pub fn len(&self) -> usize {
        self.available
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
