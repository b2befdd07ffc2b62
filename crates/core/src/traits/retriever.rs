//! Knowledge retrieval interface

use async_trait::async_trait;

use crate::Result;

/// One-shot text-in/text-out knowledge lookup
///
/// Called once per session before the pipeline starts. Implementations
/// return the generated answer text; an empty string means nothing was found.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync + 'static {
    /// Run the query against the configured knowledge source
    async fn retrieve(&self, query: &str) -> Result<String>;

    /// Name for logging
    fn name(&self) -> &str {
        "retriever"
    }
}
