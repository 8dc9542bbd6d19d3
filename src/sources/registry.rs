use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::traits::RevenueSource;
use crate::ledger::models::SourceType;

/// Source fetchers keyed by the connection type they serve
pub struct SourceRegistry {
    sources: HashMap<SourceType, Arc<dyn RevenueSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    pub fn register(&mut self, source: Arc<dyn RevenueSource>) {
        info!("Registering revenue source: {}", source.source_type());
        self.sources.insert(source.source_type(), source);
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn RevenueSource>> {
        self.sources.get(&source_type).cloned()
    }

    pub fn registered(&self) -> Vec<SourceType> {
        SourceType::all()
            .into_iter()
            .filter(|s| self.sources.contains_key(s))
            .collect()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
