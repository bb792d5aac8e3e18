//! Clients for the hosted backend and the notification endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use leadline_proto::{ApiResponse, SubscribeRequest, UnsubscribeRequest};
use reqwest::{RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::models::{MutationKind, Payload, PushSubscription, ReminderTask};
use crate::session::AuthProvider;

/// Remote write/read surface the sync engine and scheduler depend on.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Apply one mutation and return the remote representation of the affected row.
    async fn write(&self, kind: MutationKind, payload: &Payload) -> Result<Value>;

    /// Follow-up tasks of `user_id` that are still pending, earliest first.
    async fn pending_reminders(&self, user_id: &str) -> Result<Vec<ReminderTask>>;
}

/// Persistence of push subscriptions keyed by `(user_id, endpoint)`.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn upsert_subscription(&self, user_id: &str, subscription: &PushSubscription)
        -> Result<()>;

    async fn delete_subscription(&self, user_id: &str, endpoint: &str) -> Result<()>;
}

/// REST client for the hosted backend's collections (PostgREST conventions).
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    auth: Arc<dyn AuthProvider>,
}

/// Upper bound on one remote call, so claimed mutations always settle
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            auth,
        })
    }

    fn rest_url(&self, collection: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, collection)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request;
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        match self.auth.access_token().or_else(|| self.api_key.clone()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn insert(&self, collection: &str, body: Value, upsert_on: Option<&str>) -> Result<Value> {
        let mut request = self
            .client
            .post(self.rest_url(collection))
            .json(&body);
        request = match upsert_on {
            Some(columns) => request
                .query(&[("on_conflict", columns)])
                .header("Prefer", "resolution=merge-duplicates,return=representation"),
            None => request.header("Prefer", "return=representation"),
        };
        let rows = read_rows(self.authorize(request).send().await?).await?;
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    }

    /// PATCH rows matching `filters`; returns the updated rows.
    async fn update(&self, collection: &str, filters: &[(&str, String)], body: Value) -> Result<Vec<Value>> {
        let request = self
            .client
            .patch(self.rest_url(collection))
            .query(filters)
            .header("Prefer", "return=representation")
            .json(&body);
        read_rows(self.authorize(request).send().await?).await
    }

    async fn update_lead(&self, payload: &Payload) -> Result<Value> {
        let id = text(payload, "id")?;
        let mut filters = vec![("id", format!("eq.{id}"))];
        let seen = payload.get("updated_at").and_then(Value::as_str);
        if let Some(seen) = seen {
            filters.push(("updated_at", format!("eq.{seen}")));
        }

        let mut changes = payload.clone();
        changes.remove("id");
        changes.remove("updated_at");
        changes.insert("updated_at".into(), json!(Utc::now()));

        let rows = self.update("leads", &filters, Value::Object(changes)).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(row),
            None if seen.is_some() => Err(SyncError::Conflict(format!(
                "lead {id} was modified after {}",
                seen.unwrap_or_default()
            ))),
            None => Err(SyncError::Validation(format!("lead {id} does not exist"))),
        }
    }

    async fn complete_reminder(&self, payload: &Payload) -> Result<Value> {
        let id = text(payload, "id")?;
        let rows = self
            .update(
                "follow_ups",
                &[("id", format!("eq.{id}")), ("status", "eq.pending".to_string())],
                json!({ "status": "completed", "completed_at": Utc::now() }),
            )
            .await?;
        rows.into_iter().next().ok_or_else(|| {
            SyncError::Conflict(format!("follow-up {id} is no longer pending"))
        })
    }
}

fn text<'a>(payload: &'a Payload, field: &str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Validation(format!("`{field}` is required")))
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::from_status(status.as_u16(), &body))
}

async fn read_rows(response: Response) -> Result<Vec<Value>> {
    let response = check(response).await?;
    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(&text)
        .map_err(|e| SyncError::Validation(format!("unexpected response body: {e}")))?
    {
        Value::Array(rows) => Ok(rows),
        other => Ok(vec![other]),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn write(&self, kind: MutationKind, payload: &Payload) -> Result<Value> {
        debug!("Writing {kind} to {}", kind.collection());
        match kind {
            MutationKind::CreateLead | MutationKind::LogCall => {
                self.insert(kind.collection(), Value::Object(payload.clone()), None)
                    .await
            }
            MutationKind::AddNote => {
                let mut body = payload.clone();
                body.insert("action".into(), json!("note"));
                self.insert(kind.collection(), Value::Object(body), None).await
            }
            MutationKind::MarkAttendance => {
                self.insert(
                    kind.collection(),
                    Value::Object(payload.clone()),
                    Some("user_id,date"),
                )
                .await
            }
            MutationKind::UpdateLead => self.update_lead(payload).await,
            MutationKind::CompleteReminder => self.complete_reminder(payload).await,
        }
    }

    async fn pending_reminders(&self, user_id: &str) -> Result<Vec<ReminderTask>> {
        let request = self.client.get(self.rest_url("follow_ups")).query(&[
            ("user_id", format!("eq.{user_id}")),
            ("status", "eq.pending".to_string()),
            ("order", "scheduled_at.asc".to_string()),
        ]);
        let response = check(self.authorize(request).send().await?).await?;
        Ok(response.json().await?)
    }
}

/// Client for the notification endpoints served by leadline-server.
///
/// The server derives the user from the bearer token, so `user_id` only
/// has to match the signed-in session.
pub struct NotificationApiClient {
    client: reqwest::Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl NotificationApiClient {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    async fn post<T: serde::Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let token = self
            .auth
            .access_token()
            .ok_or_else(|| SyncError::Unauthorized("no active session".into()))?;
        let response = self
            .client
            .post(format!("{}/api/notifications/{path}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let reply: Option<ApiResponse> = response.json().await.ok();
        match reply {
            Some(reply) if status.is_success() && reply.success => Ok(()),
            Some(reply) => Err(SyncError::from_status(
                status.as_u16(),
                reply.error.as_deref().unwrap_or_default(),
            )),
            None => Err(SyncError::from_status(status.as_u16(), "")),
        }
    }
}

#[async_trait]
impl SubscriptionStore for NotificationApiClient {
    async fn upsert_subscription(
        &self,
        _user_id: &str,
        subscription: &PushSubscription,
    ) -> Result<()> {
        self.post(
            "subscribe",
            &SubscribeRequest {
                subscription: subscription.clone(),
            },
        )
        .await
    }

    async fn delete_subscription(&self, _user_id: &str, endpoint: &str) -> Result<()> {
        self.post(
            "unsubscribe",
            &UnsubscribeRequest {
                endpoint: endpoint.to_string(),
            },
        )
        .await
    }
}
