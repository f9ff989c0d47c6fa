use crate::block::BlockExecutor;
use crate::error::EngineError;
use std::collections::HashMap;
use std::sync::Arc;

type BlockConstructor = Box<dyn Fn() -> Arc<dyn BlockExecutor> + Send + Sync>;

/// Explicit registry mapping block type tags to constructors.
///
/// Built once at startup and passed by `Arc` injection; tests create fresh
/// instances instead of sharing process-wide state.
#[derive(Default)]
pub struct BlockRegistry {
    constructors: HashMap<String, BlockConstructor>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a type tag. Re-registering a tag replaces
    /// the previous constructor.
    pub fn register<F>(&mut self, type_tag: impl Into<String>, constructor: F)
    where
        F: Fn() -> Arc<dyn BlockExecutor> + Send + Sync + 'static,
    {
        let tag = type_tag.into();
        if self.constructors.contains_key(&tag) {
            tracing::warn!("Replacing block constructor for type {}", tag);
        }
        self.constructors.insert(tag, Box::new(constructor));
    }

    /// Instantiate an executor for a type tag.
    pub fn create(&self, type_tag: &str) -> Result<Arc<dyn BlockExecutor>, EngineError> {
        self.constructors
            .get(type_tag)
            .map(|ctor| ctor())
            .ok_or_else(|| EngineError::UnknownBlockType(type_tag.to_string()))
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.constructors.contains_key(type_tag)
    }

    /// Registered type tags, sorted for stable listings.
    pub fn type_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.constructors.keys().cloned().collect();
        tags.sort();
        tags
    }
}
