use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identity of a loaded module: its name plus the root it was imported from.
///
/// Two tenants importing `site` from different roots get distinct modules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub name: String,
    pub origin: PathBuf,
}

impl ModuleKey {
    pub fn new(name: impl Into<String>, origin: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
        }
    }
}

struct ModuleRecord<M> {
    source: PathBuf,
    module: Arc<M>,
}

/// Table of loaded modules owned by one guest runtime.
///
/// Entries stay registered (and are reused by later imports) until purged.
pub struct ModuleRegistry<M> {
    modules: HashMap<ModuleKey, ModuleRecord<M>>,
}

impl<M> Default for ModuleRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ModuleRegistry<M> {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    pub fn get(&self, key: &ModuleKey) -> Option<Arc<M>> {
        self.modules.get(key).map(|r| Arc::clone(&r.module))
    }

    /// Register `module`, loaded from the file or directory at `source`.
    pub fn insert(&mut self, key: ModuleKey, source: PathBuf, module: M) -> Arc<M> {
        let module = Arc::new(module);
        self.modules.insert(
            key,
            ModuleRecord {
                source,
                module: Arc::clone(&module),
            },
        );
        module
    }

    /// Remove every module whose source lies under `dir`.
    ///
    /// Matching is component-wise: `/app` covers `/app/x.wasm` but not
    /// `/application/x.wasm`.
    pub fn purge_under(&mut self, dir: &Path) -> usize {
        let before = self.modules.len();
        self.modules
            .retain(|_, record| !record.source.starts_with(dir));
        let purged = before - self.modules.len();
        if purged > 0 {
            tracing::debug!(dir = %dir.display(), purged, "Purged modules");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn contains(&self, key: &ModuleKey) -> bool {
        self.modules.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_registered_module() {
        let mut registry = ModuleRegistry::new();
        let key = ModuleKey::new("site", "/srv/a");
        registry.insert(key.clone(), PathBuf::from("/srv/a/site.wasm"), 1u32);
        assert_eq!(registry.get(&key).map(|m| *m), Some(1));
        assert!(registry.get(&ModuleKey::new("site", "/srv/b")).is_none());
    }

    #[test]
    fn purge_matches_whole_path_components() {
        let mut registry = ModuleRegistry::new();
        registry.insert(
            ModuleKey::new("a", "/app"),
            PathBuf::from("/app/a.wasm"),
            (),
        );
        registry.insert(
            ModuleKey::new("b", "/app"),
            PathBuf::from("/app/pkg/b.wasm"),
            (),
        );
        registry.insert(
            ModuleKey::new("c", "/application"),
            PathBuf::from("/application/c.wasm"),
            (),
        );

        assert_eq!(registry.purge_under(Path::new("/app")), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&ModuleKey::new("c", "/application")));
    }
}
