//! Per-user fan-out of realtime messages to connected websockets.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use leadline_proto::RealtimeMessage;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 32;

#[derive(Default)]
pub struct RealtimeHub {
    channels: Mutex<HashMap<String, broadcast::Sender<RealtimeMessage>>>,
}

impl RealtimeHub {
    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<RealtimeMessage>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<RealtimeMessage> {
        self.channels()
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver `message` to every open connection of `user_id`; returns how many.
    pub fn publish(&self, user_id: &str, message: RealtimeMessage) -> usize {
        let mut channels = self.channels();
        let Some(sender) = channels.get(user_id) else {
            return 0;
        };
        match sender.send(message) {
            Ok(receivers) => receivers,
            Err(_) => {
                channels.remove(user_id);
                0
            }
        }
    }
}

/// Forward hub messages to the socket until either side goes away.
pub async fn serve_socket(socket: WebSocket, mut rx: broadcast::Receiver<RealtimeMessage>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Realtime socket error: {e}");
                    break;
                }
            },
            message = rx.recv() => match message {
                Ok(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode realtime message: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Realtime client lagged, {skipped} message(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
