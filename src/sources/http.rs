use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{ItemWriter, PageRequest, SourceFetcher, SourcePage};
use crate::models::item::{DraftPayload, Item};

/// A source reached over HTTP: the page request is POSTed as JSON to `endpoint`.
#[derive(Debug, Clone)]
pub struct HttpSourceFetcher {
    name: String,
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpSourceFetcher {
    pub fn new(name: impl Into<String>, endpoint: Url) -> Self {
        Self::with_client(name, endpoint, reqwest::Client::new())
    }

    pub fn with_client(name: impl Into<String>, endpoint: Url, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            endpoint,
            client,
        }
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(&self, request: &PageRequest) -> anyhow::Result<SourcePage> {
        debug!("Fetching page from {} at {}", self.name, self.endpoint);
        let body = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(request)?)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        serde_json::from_slice(&body)
            .with_context(|| format!("source {} answered with an unexpected body", self.name))
    }
}

/// The write endpoint answers with either the confirmed item or `{ "error": reason }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum WriteResponse {
    Confirmed(Item),
    Rejected { error: String },
}

/// Persists drafts by POSTing them to `endpoint`. The viewer identity travels in `auth_token`.
#[derive(Debug, Clone)]
pub struct HttpItemWriter {
    endpoint: Url,
    auth_token: String,
    client: reqwest::Client,
}

impl HttpItemWriter {
    pub fn new(endpoint: Url, auth_token: impl Into<String>) -> Self {
        Self {
            endpoint,
            auth_token: auth_token.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, draft: &DraftPayload) -> anyhow::Result<WriteResponse> {
        let body = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(&self.auth_token)
            .body(serde_json::to_vec(draft)?)
            .send()
            .await?
            .bytes()
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ItemWriter for HttpItemWriter {
    async fn create_item(&self, draft: &DraftPayload) -> Result<Item, String> {
        match self.post(draft).await {
            Ok(WriteResponse::Confirmed(item)) => Ok(item),
            Ok(WriteResponse::Rejected { error }) => Err(error),
            Err(e) => Err(e.to_string()),
        }
    }
}
