//! Publication approval state machine
//!
//! `created -> sent_to_make -> published | failed`, or `created -> rejected`.
//! Each transition is a compare-and-swap under one write lock; the outbound
//! dispatch happens outside the lock, once per approved item.

use crate::error::OrchestrationError;
use crate::models::PublicationDraft;
use crate::tools::DeliveryEndpoint;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_DELIVERY_ACTION: &str = "publish_facebook";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    Created,
    SentToMake,
    Published,
    Rejected,
    Failed,
}

impl PublicationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PublicationStatus::Published | PublicationStatus::Rejected | PublicationStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationStatus::Created => "created",
            PublicationStatus::SentToMake => "sent_to_make",
            PublicationStatus::Published => "published",
            PublicationStatus::Rejected => "rejected",
            PublicationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub status: PublicationStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicationItem {
    pub id: Uuid,
    pub content: String,
    pub attachment_reference: Option<String>,
    pub tags: Vec<String>,
    pub status: PublicationStatus,
    pub created_at: DateTime<Utc>,
    pub status_history: Vec<StatusChange>,
    /// Rejection or delivery failure reason.
    pub reason: Option<String>,
    pub source_run_id: Option<Uuid>,
    /// Set on items created by retrying a failed one.
    pub retry_of: Option<Uuid>,
}

impl PublicationItem {
    fn new(draft: PublicationDraft, source_run_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: draft.content,
            attachment_reference: draft.attachment_reference,
            tags: draft.tags,
            status: PublicationStatus::Created,
            created_at: now,
            status_history: vec![StatusChange {
                status: PublicationStatus::Created,
                at: now,
            }],
            reason: None,
            source_run_id,
            retry_of: None,
        }
    }

    fn draft(&self) -> PublicationDraft {
        PublicationDraft {
            content: self.content.clone(),
            attachment_reference: self.attachment_reference.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Body of the single outbound call for an approved item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchPayload {
    pub action: String,
    pub data: DispatchData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchData {
    pub content: String,
    pub attachment_reference: Option<String>,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl DispatchPayload {
    pub fn for_item(action: &str, item: &PublicationItem) -> Self {
        Self {
            action: action.to_string(),
            data: DispatchData {
                content: item.content.clone(),
                attachment_reference: item.attachment_reference.clone(),
                tags: item.tags.clone(),
                timestamp: Utc::now(),
            },
        }
    }
}

pub struct PublicationStore {
    items: RwLock<HashMap<Uuid, PublicationItem>>,
    delivery: Arc<dyn DeliveryEndpoint>,
    action: String,
}

impl PublicationStore {
    pub fn new(delivery: Arc<dyn DeliveryEndpoint>, action: impl Into<String>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            delivery,
            action: action.into(),
        }
    }

    pub async fn create(&self, draft: PublicationDraft, source_run_id: Option<Uuid>) -> PublicationItem {
        let item = PublicationItem::new(draft, source_run_id);
        self.items.write().await.insert(item.id, item.clone());

        info!(publication_id = %item.id, "Publication created, awaiting approval");
        item
    }

    /// Approve, dispatch once, then record the delivery result.
    ///
    /// Only an item still in `created` can be approved; any other status
    /// (including a concurrent approval that got there first) is a
    /// `StateConflictError` and nothing is dispatched.
    pub async fn approve(&self, id: Uuid) -> Result<PublicationItem> {
        let item = self
            .transition(id, PublicationStatus::Created, PublicationStatus::SentToMake, None)
            .await?;

        let payload = DispatchPayload::for_item(&self.action, &item);
        info!(publication_id = %id, delivery = self.delivery.name(), "Dispatching approved publication");

        match self.delivery.deliver(&payload).await {
            Ok(()) => self.confirm_published(id).await,
            Err(e) => {
                warn!(publication_id = %id, error = %e, "Dispatch failed");
                self.mark_failed(id, &e.to_string()).await
            }
        }
    }

    pub async fn confirm_published(&self, id: Uuid) -> Result<PublicationItem> {
        self.transition(id, PublicationStatus::SentToMake, PublicationStatus::Published, None)
            .await
    }

    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<PublicationItem> {
        self.transition(
            id,
            PublicationStatus::SentToMake,
            PublicationStatus::Failed,
            Some(reason.to_string()),
        )
        .await
    }

    pub async fn reject(&self, id: Uuid, reason: Option<&str>) -> Result<PublicationItem> {
        self.transition(
            id,
            PublicationStatus::Created,
            PublicationStatus::Rejected,
            reason.map(str::to_string),
        )
        .await
    }

    /// New `created` item carrying a failed item's content. The failed item
    /// stays failed.
    pub async fn retry(&self, id: Uuid) -> Result<PublicationItem> {
        let mut items = self.items.write().await;

        let failed = items
            .get(&id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("publication {}", id)))?;

        if failed.status != PublicationStatus::Failed {
            return Err(OrchestrationError::StateConflictError(format!(
                "publication {} is {}, only failed items can be retried",
                id, failed.status
            )));
        }

        let mut item = PublicationItem::new(failed.draft(), failed.source_run_id);
        item.retry_of = Some(id);
        items.insert(item.id, item.clone());

        info!(publication_id = %item.id, retry_of = %id, "Publication re-created from failed item");
        Ok(item)
    }

    pub async fn get(&self, id: Uuid) -> Result<PublicationItem> {
        self.items
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestrationError::NotFound(format!("publication {}", id)))
    }

    /// Items in creation order, optionally filtered by status.
    pub async fn list(&self, status: Option<PublicationStatus>) -> Vec<PublicationItem> {
        let items = self.items.read().await;
        let mut listed: Vec<PublicationItem> = items
            .values()
            .filter(|item| status.map_or(true, |s| item.status == s))
            .cloned()
            .collect();

        listed.sort_by_key(|item| item.created_at);
        listed
    }

    pub async fn pending(&self) -> Vec<PublicationItem> {
        self.list(Some(PublicationStatus::Created)).await
    }

    // Status check and write happen under the same write guard.
    async fn transition(
        &self,
        id: Uuid,
        expected: PublicationStatus,
        next: PublicationStatus,
        reason: Option<String>,
    ) -> Result<PublicationItem> {
        let mut items = self.items.write().await;

        let item = items
            .get_mut(&id)
            .ok_or_else(|| OrchestrationError::NotFound(format!("publication {}", id)))?;

        if item.status.is_terminal() {
            return Err(OrchestrationError::StateConflictError(format!(
                "publication {} is already {} and final",
                id, item.status
            )));
        }
        if item.status != expected {
            return Err(OrchestrationError::StateConflictError(format!(
                "publication {} is {}, cannot move to {}",
                id, item.status, next
            )));
        }

        item.status = next;
        item.status_history.push(StatusChange {
            status: next,
            at: Utc::now(),
        });
        if reason.is_some() {
            item.reason = reason;
        }

        info!(publication_id = %id, from = %expected, to = %next, "Publication status changed");
        Ok(item.clone())
    }
}
