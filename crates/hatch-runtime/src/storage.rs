// Ported from microsoft/wassette (MIT License, with hatch-specific modifications)
// Copyright (c) Microsoft Corporation.

use std::path::{Path, PathBuf};

use anyhow::Result;
use sha2::{Digest, Sha256};
use wasmtime::Engine;
use wasmtime::component::Component;

use crate::error::RuntimeError;

const SOURCE_EXT: &str = "wasm";
const PRECOMPILED_EXT: &str = "cwasm";

/// Module lookup plus a disk cache of precompiled components.
///
/// Cache layout under `cache_dir`:
/// ```text
/// {cache_dir}/
///   {sha256 of source}.cwasm   - precompiled (Wasmtime serialized)
/// ```
/// Keying by content means an edited source always recompiles and an
/// unchanged one never does, wherever it lives.
pub struct ComponentStorage {
    cache_dir: PathBuf,
}

impl ComponentStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hatch")
            .join("cache")
    }

    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cwasm_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{hash}.{PRECOMPILED_EXT}"))
    }

    /// Find `module` under each root in order. Returns the root and the file.
    pub fn locate(&self, module: &str, roots: &[PathBuf]) -> Result<(PathBuf, PathBuf), RuntimeError> {
        let relative = module_file(module);
        for root in roots {
            let candidate = root.join(&relative);
            if candidate.is_file() {
                return Ok((root.clone(), candidate));
            }
        }
        Err(RuntimeError::ModuleNotFound {
            module: module.to_string(),
            searched: roots.to_vec(),
        })
    }

    /// Load or compile a component, using the precompiled cache when valid.
    pub fn load_or_compile(&self, wasm_path: &Path, engine: &Engine) -> Result<Component, RuntimeError> {
        let wasm_bytes = std::fs::read(wasm_path).map_err(|e| {
            RuntimeError::StorageError(format!("Cannot read {}: {e}", wasm_path.display()))
        })?;
        let hash = hash_bytes(&wasm_bytes);
        let cwasm_path = self.cwasm_path(&hash);

        if cwasm_path.exists() {
            match self.load_precompiled(&cwasm_path, engine) {
                Ok(cached) => {
                    tracing::debug!(path = %wasm_path.display(), hash, "Loaded from precompiled cache");
                    return Ok(cached);
                }
                Err(e) => {
                    tracing::debug!(path = %wasm_path.display(), "Precompiled cache invalid, recompiling: {e}");
                }
            }
        }

        let component = Component::from_binary(engine, &wasm_bytes).map_err(|e| {
            RuntimeError::CompilationFailed(format!("{}: {e}", wasm_path.display()))
        })?;

        match component.serialize() {
            Ok(serialized) => {
                if let Err(e) = std::fs::write(&cwasm_path, serialized) {
                    tracing::warn!(path = %cwasm_path.display(), "Failed to save precompiled cache: {e}");
                } else {
                    tracing::debug!(path = %wasm_path.display(), hash, "Saved precompiled cache");
                }
            }
            Err(e) => tracing::warn!(path = %wasm_path.display(), "Failed to serialize component: {e}"),
        }

        Ok(component)
    }

    fn load_precompiled(&self, path: &Path, engine: &Engine) -> Result<Component> {
        // SAFETY: cwasm files in the cache directory are only ever written by
        // `load_or_compile` above, from a component compiled by this Wasmtime
        // version. The safety contract of `deserialize_file` is satisfied.
        unsafe { Component::deserialize_file(engine, path) }
    }
}

/// `pkg.module` lives at `pkg/module.wasm` relative to a search root.
pub fn module_file(module: &str) -> PathBuf {
    let mut path: PathBuf = module.split('.').collect();
    path.set_extension(SOURCE_EXT);
    path
}

/// SHA-256 hex of a component's bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_module_maps_to_nested_file() {
        assert_eq!(module_file("main"), PathBuf::from("main.wasm"));
        assert_eq!(module_file("api.v1.app"), PathBuf::from("api/v1/app.wasm"));
    }

    #[test]
    fn locate_searches_roots_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(second.path().join("pkg")).unwrap();
        std::fs::write(second.path().join("pkg/app.wasm"), b"x").unwrap();

        let storage = ComponentStorage::new(first.path().join("cache"));
        let roots = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let (root, file) = storage.locate("pkg.app", &roots).unwrap();
        assert_eq!(root, second.path());
        assert_eq!(file, second.path().join("pkg/app.wasm"));

        std::fs::write(first.path().join("pkg.wasm"), b"y").unwrap();
        let (root, _) = storage.locate("pkg", &roots).unwrap();
        assert_eq!(root, first.path());

        assert!(matches!(
            storage.locate("missing", &roots),
            Err(RuntimeError::ModuleNotFound { .. })
        ));
    }

    #[test]
    fn hash_is_content_addressed() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
        assert_eq!(hash_bytes(b"").len(), 64);
    }

    #[test]
    fn invalid_component_fails_compilation() {
        let dir = tempfile::tempdir().unwrap();
        let wasm = dir.path().join("bad.wasm");
        std::fs::write(&wasm, b"not a component").unwrap();
        let storage = ComponentStorage::new(dir.path().join("cache"));
        storage.init().unwrap();
        let context = crate::runtime_context::RuntimeContext::new().unwrap();
        assert!(matches!(
            storage.load_or_compile(&wasm, &context.engine),
            Err(RuntimeError::CompilationFailed(_))
        ));
    }
}
