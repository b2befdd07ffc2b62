//! Retrieval preloader
//!
//! Runs the knowledge query once, before a session's pipeline starts. Any
//! failure degrades to empty knowledge; session start is never blocked past
//! the timeout and the query is never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_config::RetrievalConfig;
use parley_core::KnowledgeRetriever;

use crate::{HttpKnowledgeRetriever, RagError};

/// Result of a preload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Knowledge {
    pub text: String,
    /// True when the session runs without knowledge
    pub degraded: bool,
}

impl Knowledge {
    fn degraded() -> Self {
        Self {
            text: String::new(),
            degraded: true,
        }
    }
}

#[derive(Clone)]
pub struct RetrievalPreloader {
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    query: String,
    timeout: Duration,
}

impl RetrievalPreloader {
    pub fn new(
        retriever: Arc<dyn KnowledgeRetriever>,
        query: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            retriever: Some(retriever),
            query: query.into(),
            timeout,
        }
    }

    /// Preloader without a knowledge source; every preload is degraded
    pub fn disabled() -> Self {
        Self {
            retriever: None,
            query: String::new(),
            timeout: Duration::ZERO,
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Result<Self, RagError> {
        Ok(match HttpKnowledgeRetriever::from_config(config)? {
            Some(retriever) => {
                Self::new(Arc::new(retriever), config.query.clone(), config.timeout())
            }
            None => Self::disabled(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.retriever.is_some()
    }

    /// Fetch knowledge for one session
    pub async fn preload(&self, session_id: &str) -> Knowledge {
        let Some(retriever) = &self.retriever else {
            Self::record_degraded("unconfigured");
            tracing::warn!(
                session_id,
                "No knowledge base configured, starting without knowledge"
            );
            return Knowledge::degraded();
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, retriever.retrieve(&self.query)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                tracing::info!(
                    session_id,
                    retriever = retriever.name(),
                    chars = text.len(),
                    elapsed_ms,
                    "Knowledge preloaded"
                );
                Knowledge {
                    text,
                    degraded: false,
                }
            }
            Ok(Ok(_)) => {
                Self::record_degraded("empty");
                tracing::warn!(
                    session_id,
                    elapsed_ms,
                    "Knowledge base returned nothing, starting degraded"
                );
                Knowledge::degraded()
            }
            Ok(Err(e)) => {
                Self::record_degraded("error");
                tracing::warn!(
                    session_id,
                    error = %e,
                    elapsed_ms,
                    "Knowledge retrieval failed, starting degraded"
                );
                Knowledge::degraded()
            }
            Err(_) => {
                Self::record_degraded("timeout");
                tracing::warn!(
                    session_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Knowledge retrieval timed out, starting degraded"
                );
                Knowledge::degraded()
            }
        }
    }

    fn record_degraded(cause: &'static str) {
        metrics::counter!("parley_retrieval_degraded_total", "cause" => cause).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Reply {
        Text(&'static str),
        Fail,
        Hang,
    }

    struct FakeRetriever {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl FakeRetriever {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl KnowledgeRetriever for FakeRetriever {
        async fn retrieve(&self, _query: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Reply::Text(text) => Ok(text.to_string()),
                Reply::Fail => Err(Error::Retrieval("access denied".into())),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    fn preloader(retriever: Arc<FakeRetriever>, timeout_ms: u64) -> RetrievalPreloader {
        RetrievalPreloader::new(retriever, "List all fields", Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_preload_success() {
        let fake = FakeRetriever::new(Reply::Text("Field: date (required, ISO-8601)."));
        let knowledge = preloader(fake.clone(), 500).preload("s").await;
        assert_eq!(knowledge.text, "Field: date (required, ISO-8601).");
        assert!(!knowledge.degraded);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_degrades_without_retry() {
        let fake = FakeRetriever::new(Reply::Fail);
        let knowledge = preloader(fake.clone(), 500).preload("s").await;
        assert_eq!(knowledge, Knowledge::degraded());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blank_result_degrades() {
        let knowledge = preloader(FakeRetriever::new(Reply::Text("  \n")), 500)
            .preload("s")
            .await;
        assert!(knowledge.degraded);
        assert!(knowledge.text.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_degrades() {
        let start = Instant::now();
        let knowledge = preloader(FakeRetriever::new(Reply::Hang), 50).preload("s").await;
        assert!(knowledge.degraded);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unconfigured_is_degraded() {
        let preloader = RetrievalPreloader::from_config(&RetrievalConfig::default()).unwrap();
        assert!(!preloader.is_enabled());
        assert!(preloader.preload("s").await.degraded);
    }
}
