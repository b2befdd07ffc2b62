//! HTTP knowledge-base retriever
//!
//! Sends one retrieve-and-generate request per query and returns the
//! generated answer text.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use parley_config::RetrievalConfig;
use parley_core::{KnowledgeRetriever, Result};

use crate::RagError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveAndGenerateRequest<'a> {
    input: QueryInput<'a>,
    retrieve_and_generate_configuration: GenerateConfiguration<'a>,
}

#[derive(Debug, Serialize)]
struct QueryInput<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateConfiguration<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    knowledge_base_configuration: KnowledgeBaseConfiguration<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KnowledgeBaseConfiguration<'a> {
    knowledge_base_id: &'a str,
    model_arn: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct RetrieveAndGenerateResponse {
    #[serde(default)]
    output: Option<GeneratedOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct GeneratedOutput {
    #[serde(default)]
    text: Option<String>,
}

impl RetrieveAndGenerateResponse {
    /// Missing output or text counts as an empty answer
    fn into_text(self) -> String {
        self.output.and_then(|o| o.text).unwrap_or_default()
    }
}

pub struct HttpKnowledgeRetriever {
    client: Client,
    endpoint: String,
    knowledge_base_id: String,
    model_arn: String,
}

impl HttpKnowledgeRetriever {
    pub fn new(
        endpoint: impl Into<String>,
        knowledge_base_id: impl Into<String>,
        model_arn: impl Into<String>,
        timeout: std::time::Duration,
    ) -> std::result::Result<Self, RagError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            knowledge_base_id: knowledge_base_id.into(),
            model_arn: model_arn.into(),
        })
    }

    /// `None` when no knowledge base is configured
    pub fn from_config(config: &RetrievalConfig) -> std::result::Result<Option<Self>, RagError> {
        match &config.knowledge_base_id {
            Some(id) if !id.trim().is_empty() => Ok(Some(Self::new(
                config.endpoint.clone(),
                id.clone(),
                config.model_arn.clone(),
                config.timeout(),
            )?)),
            _ => Ok(None),
        }
    }

    fn request<'a>(&'a self, query: &'a str) -> RetrieveAndGenerateRequest<'a> {
        RetrieveAndGenerateRequest {
            input: QueryInput { text: query },
            retrieve_and_generate_configuration: GenerateConfiguration {
                kind: "KNOWLEDGE_BASE",
                knowledge_base_configuration: KnowledgeBaseConfiguration {
                    knowledge_base_id: &self.knowledge_base_id,
                    model_arn: &self.model_arn,
                },
            },
        }
    }

    async fn fetch(&self, query: &str) -> std::result::Result<String, RagError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&self.request(query))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RetrieveAndGenerateResponse = response.json().await?;
        Ok(parsed.into_text())
    }
}

#[async_trait]
impl KnowledgeRetriever for HttpKnowledgeRetriever {
    async fn retrieve(&self, query: &str) -> Result<String> {
        let start = Instant::now();
        let text = self.fetch(query).await?;
        metrics::histogram!("parley_retrieval_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        tracing::debug!(
            knowledge_base_id = %self.knowledge_base_id,
            chars = text.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Knowledge retrieved"
        );
        Ok(text)
    }

    fn name(&self) -> &str {
        "http_knowledge_base"
    }
}
