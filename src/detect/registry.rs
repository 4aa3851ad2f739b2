use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::result::RawDetectorOutput;
use crate::frame::Frame;

use super::backend::DetectorBackend;

type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Named detector backends with one active default.
///
/// `infer` takes `&mut self` on the backend, so each one sits behind a `Mutex`.
pub struct BackendRegistry {
    backends: BTreeMap<String, SharedBackend>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Add a backend under its own name, replacing any backend with that
    /// name. The first one added becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        log::info!("BackendRegistry: registered detector '{}'", name);
        self.default_name.get_or_insert_with(|| name.clone());
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("detector backend '{}' is not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_deref().and_then(|name| self.get(name))
    }

    /// Registered names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Run the default backend on `frame`.
    pub fn infer(&self, frame: &Frame) -> Result<RawDetectorOutput> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.infer_with(name, frame)
    }

    /// Run a specific backend on `frame`.
    pub fn infer_with(&self, name: &str, frame: &Frame) -> Result<RawDetectorOutput> {
        let backend = self
            .get(name)
            .ok_or_else(|| anyhow!("detector backend '{}' is not registered", name))?;
        let mut backend = backend
            .lock()
            .map_err(|_| anyhow!("detector backend '{}' lock poisoned", name))?;
        backend.infer(frame)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubBackend;
    use crate::Timestamp;

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        assert!(registry.default_backend().is_none());
        registry.register(StubBackend::new());
        assert_eq!(registry.list(), vec!["stub".to_string()]);
        assert!(registry.set_default("tract").is_err());
        registry.set_default("stub").unwrap();

        let frame = Frame::solid(8, 8, [1, 2, 3], Timestamp::EPOCH).unwrap();
        let raw = registry.infer(&frame).unwrap();
        assert!(matches!(raw, RawDetectorOutput::Table(_)));
    }

    #[test]
    fn infer_without_backends_fails() {
        let registry = BackendRegistry::default();
        let frame = Frame::solid(2, 2, [0, 0, 0], Timestamp::EPOCH).unwrap();
        assert!(registry.infer(&frame).is_err());
        assert!(registry.infer_with("stub", &frame).is_err());
    }

    #[test]
    fn scripted_backend_is_reachable_by_name() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::scripted(vec![RawDetectorOutput::Missing]));
        let frame = Frame::solid(2, 2, [0, 0, 0], Timestamp::EPOCH).unwrap();
        assert_eq!(registry.infer_with("stub", &frame).unwrap(), RawDetectorOutput::Missing);
        assert_eq!(registry.infer(&frame).unwrap(), RawDetectorOutput::empty());
    }
}
