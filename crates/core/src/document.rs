//! Documents (chapters) that workflows write generated content into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub project_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<i64>,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub status: String,
    pub order_index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub project_id: i64,
    pub volume_id: Option<i64>,
    pub title: String,
    pub content: String,
    pub summary: String,
    pub status: String,
    pub order_index: i64,
}

impl NewDocument {
    pub fn into_document(self, id: i64) -> Document {
        let now = Utc::now();
        Document {
            id,
            project_id: self.project_id,
            volume_id: self.volume_id,
            title: self.title,
            content: self.content,
            summary: self.summary,
            status: self.status,
            order_index: self.order_index,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A partial document update. Only fields that are `Some` are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub status: Option<String>,
}

impl DocumentUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_status(mut self, status: Option<String>) -> Self {
        if status.is_some() {
            self.status = status;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.summary.is_none() && self.status.is_none()
    }

    /// Apply the present fields to `doc`, bumping `updated_at` if anything changed.
    pub fn apply(&self, doc: &mut Document) {
        if self.is_empty() {
            return;
        }
        if let Some(title) = &self.title {
            doc.title = title.clone();
        }
        if let Some(content) = &self.content {
            doc.content = content.clone();
        }
        if let Some(summary) = &self.summary {
            doc.summary = summary.clone();
        }
        if let Some(status) = &self.status {
            doc.status = status.clone();
        }
        doc.updated_at = Utc::now();
    }
}
