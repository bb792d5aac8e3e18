//! Listener for the realtime assignment feed.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use leadline_core::AuthProvider;
use leadline_proto::RealtimeMessage;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct AssignmentFeed {
    rx: UnboundedReceiver<RealtimeMessage>,
}

impl AssignmentFeed {
    /// Connect in the background, reconnecting until `cancel` fires. Every
    /// connection attempt uses the session token current at that moment.
    pub fn spawn(
        realtime_url: String,
        auth: Arc<dyn AuthProvider>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        tokio::spawn(run_listener(realtime_url, auth, tx, cancel));
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<RealtimeMessage> {
        self.rx.recv().await
    }
}

/// Title, body and tag of the notification shown for `message`, if any.
pub fn describe(message: &RealtimeMessage) -> Option<(String, String, String)> {
    match message {
        RealtimeMessage::LeadAssigned {
            lead_id,
            lead_name,
            assigned_by,
            ..
        } => {
            let body = match assigned_by {
                Some(by) => format!("{lead_name} was assigned to you by {by}"),
                None => format!("{lead_name} was assigned to you"),
            };
            Some(("New lead assigned".to_string(), body, format!("lead-{lead_id}")))
        }
        RealtimeMessage::ReminderChanged { .. } => None,
    }
}

fn normalize_ws_url(url: &str) -> String {
    let mut ws_url = url
        .replace("http://", "ws://")
        .replace("https://", "wss://");

    if !ws_url.ends_with("/api/realtime") {
        if !ws_url.ends_with('/') {
            ws_url.push('/');
        }
        ws_url.push_str("api/realtime");
    }

    ws_url
}

async fn run_listener(
    url: String,
    auth: Arc<dyn AuthProvider>,
    tx: UnboundedSender<RealtimeMessage>,
    cancel: CancellationToken,
) {
    loop {
        match auth.access_token() {
            Some(token) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = listen_once(&url, &token, &tx) => {
                        if let Err(e) = result {
                            warn!("Realtime listener error: {e:#}");
                        }
                    }
                }
            }
            None => debug!("No active session, realtime feed waiting for login"),
        }
        if tx.is_closed() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn listen_once(url: &str, token: &str, tx: &UnboundedSender<RealtimeMessage>) -> Result<()> {
    let ws_url = normalize_ws_url(url);
    let mut request = ws_url
        .as_str()
        .into_client_request()
        .context("Failed to create WebSocket request")?;
    request
        .headers_mut()
        .insert(AUTHORIZATION, format!("Bearer {token}").parse()?);

    let (ws, _) = connect_async(request)
        .await
        .context("Failed to connect to realtime feed")?;
    info!("Connected to realtime feed at {ws_url}");
    let (mut write, mut read) = ws.split();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeMessage>(&text) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Ignoring unrecognised realtime message: {e}"),
            },
            Ok(Message::Ping(payload)) => {
                write
                    .send(Message::Pong(payload))
                    .await
                    .context("Failed to answer ping")?;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Realtime WebSocket error: {e}");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn ws_url_is_derived_from_http_base() {
        assert_eq!(
            normalize_ws_url("https://notify.example.com"),
            "wss://notify.example.com/api/realtime"
        );
        assert_eq!(
            normalize_ws_url("ws://127.0.0.1:3000/api/realtime"),
            "ws://127.0.0.1:3000/api/realtime"
        );
    }

    #[test]
    fn only_assignments_become_notifications() {
        let assigned = RealtimeMessage::LeadAssigned {
            lead_id: "L-9".into(),
            lead_name: "Asha Rao".into(),
            assigned_by: Some("admin".into()),
            assigned_at: Utc::now(),
        };
        let (title, body, tag) = describe(&assigned).unwrap();
        assert_eq!(title, "New lead assigned");
        assert!(body.contains("Asha Rao"));
        assert_eq!(tag, "lead-L-9");
        let changed = RealtimeMessage::ReminderChanged {
            reminder_id: "r1".into(),
        };
        assert!(describe(&changed).is_none());
    }
}
