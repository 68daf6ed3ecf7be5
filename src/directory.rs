//! Namespace and resource collaborators.
//!
//! The scheduler consults these; it does not own them. `LibSqlBackend`
//! provides both over the same database as the task store.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DatabaseError;

/// A tenant scope with its running-task cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    pub max_running_tasks: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Folder,
    Doc,
    File,
    Link,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Doc => "doc",
            Self::File => "file",
            Self::Link => "link",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "folder" => Self::Folder,
            "file" => Self::File,
            "link" => Self::Link,
            _ => Self::Doc,
        }
    }
}

/// A workspace resource that tasks may reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub namespace_id: String,
    pub user_id: Option<String>,
    pub parent_id: Option<String>,
    pub name: String,
    pub resource_type: ResourceType,
    pub content: String,
    /// Free-form attributes (`original_name`, `filename`, `mimetype`, ...).
    pub attrs: Map<String, Value>,
}

impl Resource {
    pub fn new(
        id: impl Into<String>,
        namespace_id: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            id: id.into(),
            namespace_id: namespace_id.into(),
            user_id: None,
            parent_id: None,
            name: String::new(),
            resource_type,
            content: String::new(),
            attrs: Map::new(),
        }
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }
}

/// Partial update applied by completion processors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUpdate {
    pub name: Option<String>,
    pub content: Option<String>,
    pub attrs: Option<Map<String, Value>>,
}

impl ResourceUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.content.is_none() && self.attrs.is_none()
    }
}

#[async_trait]
pub trait NamespaceDirectory: Send + Sync {
    /// Look up a namespace; `None` when it does not exist.
    async fn get_namespace(&self, id: &str) -> Result<Option<Namespace>, DatabaseError>;
}

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    /// Look up a live (not deleted) resource.
    async fn get_resource(
        &self,
        namespace_id: &str,
        id: &str,
    ) -> Result<Option<Resource>, DatabaseError>;

    /// Which of `ids` still exist in the namespace.
    async fn existing_resource_ids(
        &self,
        namespace_id: &str,
        ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError>;

    /// Apply a partial update. Returns `false` if the resource is gone.
    async fn update_resource(
        &self,
        namespace_id: &str,
        id: &str,
        update: ResourceUpdate,
    ) -> Result<bool, DatabaseError>;
}
