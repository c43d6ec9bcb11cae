use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod dtmi;
pub mod entity;
pub mod parser;
pub mod repository;

pub use dtmi::{dtmi_to_path, is_valid_dtmi, Dtmi, InvalidDtmi};
pub use entity::{Entity, EntityKind, ModelSet, Schema, SupplementalType};
pub use parser::{ModelParser, ParseError};
pub use repository::{ModelRepository, ModelSource, ResolveError, PUBLIC_MODEL_REPOSITORY};

/// Resolves a device model identifier to its parsed symbol table.
///
/// Parsed sets are kept for the lifetime of the worker; model versions are
/// immutable so a cached set never goes stale.
pub struct ModelResolver {
    source: Arc<dyn ModelSource>,
    cache: Mutex<HashMap<Dtmi, Arc<ModelSet>>>,
}

impl ModelResolver {
    pub fn new(source: Arc<dyn ModelSource>) -> Self {
        ModelResolver {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn parse_model(&self, model_id: &str) -> Result<Arc<ModelSet>, ResolveError> {
        let dtmi = Dtmi::parse(model_id)?;

        if let Some(models) = self.cache.lock().await.get(&dtmi) {
            debug!("model {} found in cache", dtmi);
            return Ok(models.clone());
        }

        let content = self.source.fetch(&dtmi).await?;
        let models = ModelParser::new(self.source.clone())
            .parse(&[content])
            .await?;

        if models.interface(&dtmi).is_none() {
            return Err(ResolveError::Parse(ParseError::Unresolved {
                dtmi: dtmi.to_string(),
                reason: "model document does not define the requested interface".to_string(),
            }));
        }

        info!("parsed model {} ({} entities)", dtmi, models.len());
        let models = Arc::new(models);
        self.cache.lock().await.insert(dtmi, models.clone());
        Ok(models)
    }
}
