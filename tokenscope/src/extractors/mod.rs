use std::collections::HashMap;

use crate::project_ref::{HostContext, RawDependency};

mod composer;
mod gomod;
mod npm;

pub use composer::{ComposerLockExtractor, ComposerManifestExtractor};
pub use gomod::GoModExtractor;
pub use npm::NpmLockExtractor;

/// One ecosystem's manifest parser. Extraction never fails: malformed input
/// is logged and yields an empty list.
pub trait ManifestExtractor: Send + Sync {
    fn extract(&self, content: &str, host: &HostContext) -> Vec<RawDependency>;
}

/// Maps manifest basenames to their extractor. Built once and handed to the
/// scanner; tests construct their own instead of mutating shared state.
#[derive(Default)]
pub struct ExtractorRegistry {
    handlers: HashMap<String, Box<dyn ManifestExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with every supported ecosystem registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("go.mod", Box::new(GoModExtractor));
        registry.register("composer.json", Box::new(ComposerManifestExtractor));
        registry.register("composer.lock", Box::new(ComposerLockExtractor));
        registry.register("package-lock.json", Box::new(NpmLockExtractor));
        registry
    }

    pub fn register(&mut self, basename: &str, extractor: Box<dyn ManifestExtractor>) {
        self.handlers.insert(basename.to_string(), extractor);
    }

    pub fn get(&self, basename: &str) -> Option<&dyn ManifestExtractor> {
        self.handlers.get(basename).map(Box::as_ref)
    }

    /// Sorted manifest basenames, used as the discovery filter.
    pub fn basenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
