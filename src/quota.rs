//! Admission-time quota policy.
//!
//! Consulted by the dispatcher for each candidate it is about to claim. An
//! `exhausted` verdict parks the task in `insufficient_quota`; an error
//! leaves it pending for a later fetch.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::QuotaError;
use crate::tasks::model::Task;

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaVerdict {
    pub exhausted: bool,
}

#[async_trait]
pub trait QuotaPolicy: Send + Sync {
    async fn check_task_admission(
        &self,
        namespace_id: &str,
        task: &Task,
    ) -> Result<QuotaVerdict, QuotaError>;
}

/// Admits everything.
pub struct Unlimited;

#[async_trait]
impl QuotaPolicy for Unlimited {
    async fn check_task_admission(
        &self,
        _namespace_id: &str,
        _task: &Task,
    ) -> Result<QuotaVerdict, QuotaError> {
        Ok(QuotaVerdict::default())
    }
}

/// Namespace usage as reported by the billing service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamespaceUsage {
    #[serde(default, alias = "storageQuota")]
    pub storage_quota: i64,
    #[serde(default, alias = "storageUsage")]
    pub storage_usage: i64,
    #[serde(default, alias = "taskPriority")]
    pub task_priority: i64,
    #[serde(default, alias = "taskParallelism")]
    pub task_parallelism: i64,
    #[serde(default, alias = "fileUploadSizeLimit")]
    pub file_upload_size_limit: i64,
    #[serde(default, alias = "trashRetentionDays")]
    pub trash_retention_days: i64,
}

impl NamespaceUsage {
    /// Over a positive storage quota; the namespace is read-only.
    pub fn is_readonly(&self) -> bool {
        self.storage_quota > 0 && self.storage_usage > self.storage_quota
    }
}

/// Asks the billing service for namespace usage over HTTP.
pub struct HttpQuotaPolicy {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpQuotaPolicy {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn usages_url(&self, namespace_id: &str) -> String {
        format!(
            "{}/internal/api/v1/namespaces/{namespace_id}/usages",
            self.base_url
        )
    }

    pub async fn namespace_usage(&self, namespace_id: &str) -> Result<NamespaceUsage, QuotaError> {
        let mut req = self.client.get(self.usages_url(namespace_id));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| QuotaError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(QuotaError::Request(format!("{status}: {body}")));
        }

        resp.json::<NamespaceUsage>()
            .await
            .map_err(|e| QuotaError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl QuotaPolicy for HttpQuotaPolicy {
    async fn check_task_admission(
        &self,
        namespace_id: &str,
        _task: &Task,
    ) -> Result<QuotaVerdict, QuotaError> {
        let usage = self.namespace_usage(namespace_id).await?;
        Ok(QuotaVerdict {
            exhausted: usage.is_readonly(),
        })
    }
}
