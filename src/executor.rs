use std::{fmt, sync::Arc};

use dashmap::DashMap;
use tracing::info;

use crate::node::NodeExecutor;

/// Maps node type tags to the executor that runs them.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Arc<DashMap<String, Arc<dyn NodeExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `tag`, replacing any previous registration.
    pub fn register(&self, tag: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        let tag = tag.into();
        info!("Registered executor: {} -> {}", tag, executor.name());
        self.executors.insert(tag, executor);
    }

    pub fn unregister(&self, tag: &str) -> bool {
        self.executors.remove(tag).is_some()
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(tag).map(|e| e.value().clone())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.executors.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
