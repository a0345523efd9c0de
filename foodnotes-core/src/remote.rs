//! Remote store client: versioned per-entity records behind an async trait,
//! with an HTTP implementation. Writes carry the caller's version token; a
//! concurrent write surfaces as a conflict holding the server's authoritative
//! record.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// One entity's stored content plus its server-issued version token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedContent {
    pub content: Value,
    pub version: i64,
}

/// Batch response for the initial load: the family record (if any) and every
/// member record the server knows.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAllResponse {
    pub family_record: Option<VersionedContent>,
    #[serde(default)]
    pub member_records: BTreeMap<String, VersionedContent>,
}

/// Result of a versioned put.
#[derive(Clone, Debug, PartialEq)]
pub enum PutOutcome {
    Stored { version: i64 },
    /// The server's stored version differed from the submitted one; carries
    /// the authoritative current record.
    Conflict(VersionedContent),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_all(&self) -> Result<FetchAllResponse>;
    async fn put_family(&self, content: Value, version: i64) -> Result<PutOutcome>;
    async fn put_member(&self, member_id: &str, content: Value, version: i64)
        -> Result<PutOutcome>;
    async fn fetch_summary(&self) -> Result<String>;
}

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct PutRequest<'a> {
    content: &'a Value,
    version: i64,
}

#[derive(Deserialize)]
struct PutResponse {
    version: i64,
}

#[derive(Deserialize)]
struct SummaryResponse {
    summary: String,
}

/// HTTP-backed remote store. Conflicts surface as 409 responses whose body is
/// the authoritative `{content, version}` record.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteStore {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn put_record(&self, path: &str, content: Value, version: i64) -> Result<PutOutcome> {
        let resp = self
            .client
            .put(self.url(path))
            .json(&PutRequest {
                content: &content,
                version,
            })
            .send()
            .await
            .with_context(|| format!("put {path} failed"))?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            let authoritative: VersionedContent = resp
                .json()
                .await
                .with_context(|| format!("conflict body for {path} was malformed"))?;
            return Ok(PutOutcome::Conflict(authoritative));
        }
        if !resp.status().is_success() {
            return Err(anyhow!("put {path} returned status {}", resp.status()));
        }
        let stored: PutResponse = resp
            .json()
            .await
            .with_context(|| format!("put response for {path} was malformed"))?;
        Ok(PutOutcome::Stored {
            version: stored.version,
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_all(&self) -> Result<FetchAllResponse> {
        let resp = self
            .client
            .get(self.url("family/records"))
            .send()
            .await
            .context("fetch_all failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("fetch_all returned status {}", resp.status()));
        }
        resp.json().await.context("fetch_all body was malformed")
    }

    async fn put_family(&self, content: Value, version: i64) -> Result<PutOutcome> {
        self.put_record("family/record", content, version).await
    }

    async fn put_member(
        &self,
        member_id: &str,
        content: Value,
        version: i64,
    ) -> Result<PutOutcome> {
        let path = format!("family/members/{member_id}/record");
        self.put_record(&path, content, version).await
    }

    async fn fetch_summary(&self) -> Result<String> {
        let resp = self
            .client
            .get(self.url("family/summary"))
            .send()
            .await
            .context("fetch_summary failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("fetch_summary returned status {}", resp.status()));
        }
        let body: SummaryResponse = resp
            .json()
            .await
            .context("summary body was malformed")?;
        Ok(body.summary)
    }
}
