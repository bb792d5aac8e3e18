use futures_util::StreamExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use leadline_proto::{ApiResponse, RealtimeMessage};
use leadline_server::subscription_db::SubscriptionDb;
use leadline_server::{app, AppState, Claims};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;

const JWT_TEST_SECRET: &[u8] = b"leadline-test-secret";

struct TestServer {
    base_url: String,
    db: SubscriptionDb,
    _dir: TempDir,
}

async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = SubscriptionDb::open(dir.path()).await.expect("open db");
    let state = AppState::new(db.clone(), JWT_TEST_SECRET);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        db,
        _dir: dir,
    }
}

fn token_for(user_id: &str) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_TEST_SECRET),
    )
    .unwrap()
}

fn subscription(endpoint: &str, auth: &str) -> serde_json::Value {
    json!({
        "subscription": {
            "endpoint": endpoint,
            "keys": { "p256dh": "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7DkM", "auth": auth }
        }
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = spawn_server().await;
    let resp = reqwest::get(format!("{}/api/health", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_subscribe_requires_token() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/notifications/subscribe", server.base_url))
        .json(&subscription("https://push.example.com/a", "k1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: ApiResponse = resp.json().await.unwrap();
    assert!(!body.success);

    let resp = client
        .post(format!("{}/api/notifications/subscribe", server.base_url))
        .bearer_auth("not-a-jwt")
        .json(&subscription("https://push.example.com/a", "k1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_subscribe_upserts_per_user_and_endpoint() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/notifications/subscribe", server.base_url);

    for auth in ["k1", "k2"] {
        let resp = client
            .post(&url)
            .bearer_auth(token_for("u1"))
            .json(&subscription("https://push.example.com/a", auth))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: ApiResponse = resp.json().await.unwrap();
        assert_eq!(body, ApiResponse::ok());
    }
    // A second device of the same user is a separate row
    client
        .post(&url)
        .bearer_auth(token_for("u1"))
        .json(&subscription("https://push.example.com/b", "k3"))
        .send()
        .await
        .unwrap();

    let rows = server.db.list("u1").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].endpoint, "https://push.example.com/a");
    assert_eq!(rows[0].keys.auth, "k2");
    assert!(server.db.list("u2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_removes_only_the_callers_row() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    for user in ["u1", "u2"] {
        client
            .post(format!("{}/api/notifications/subscribe", server.base_url))
            .bearer_auth(token_for(user))
            .json(&subscription("https://push.example.com/shared", "k"))
            .send()
            .await
            .unwrap();
    }

    let resp = client
        .post(format!("{}/api/notifications/unsubscribe", server.base_url))
        .bearer_auth(token_for("u1"))
        .json(&json!({ "endpoint": "https://push.example.com/shared" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    assert!(server.db.list("u1").await.unwrap().is_empty());
    assert_eq!(server.db.list("u2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_malformed_bodies_are_bad_requests() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/notifications/subscribe", server.base_url))
        .bearer_auth(token_for("u1"))
        .json(&json!({ "endpoint": "https://push.example.com/a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: ApiResponse = resp.json().await.unwrap();
    assert!(!body.success);
    assert!(body.error.is_some());

    let resp = client
        .post(format!("{}/api/notifications/subscribe", server.base_url))
        .bearer_auth(token_for("u1"))
        .json(&subscription("ftp://push.example.com/a", "k"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/api/notifications/unsubscribe", server.base_url))
        .bearer_auth(token_for("u1"))
        .json(&json!({ "endpoint": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_assignment_reaches_assignee_socket() {
    let server = spawn_server().await;

    let ws_url = format!("{}/api/realtime", server.base_url.replace("http://", "ws://"));
    let mut request = ws_url.into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {}", token_for("caller-7")).parse().unwrap(),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let resp = reqwest::Client::new()
        .post(format!("{}/api/notifications/assign", server.base_url))
        .bearer_auth(token_for("admin-1"))
        .json(&json!({ "lead_id": "L-42", "lead_name": "Asha Rao", "assignee_id": "caller-7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("assignment delivered")
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    match serde_json::from_str::<RealtimeMessage>(&text).unwrap() {
        RealtimeMessage::LeadAssigned {
            lead_id,
            assigned_by,
            ..
        } => {
            assert_eq!(lead_id, "L-42");
            assert_eq!(assigned_by.as_deref(), Some("admin-1"));
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn test_reminder_change_reaches_owner_socket() {
    let server = spawn_server().await;

    let ws_url = format!("{}/api/realtime", server.base_url.replace("http://", "ws://"));
    let mut request = ws_url.into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {}", token_for("caller-7")).parse().unwrap(),
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/notifications/reminder", server.base_url))
        .bearer_auth(token_for("admin-1"))
        .json(&json!({ "reminder_id": "", "user_id": "caller-7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/api/notifications/reminder", server.base_url))
        .bearer_auth(token_for("admin-1"))
        .json(&json!({ "reminder_id": "r-9", "user_id": "caller-7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("reminder change delivered")
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    assert_eq!(
        serde_json::from_str::<RealtimeMessage>(&text).unwrap(),
        RealtimeMessage::ReminderChanged {
            reminder_id: "r-9".into()
        }
    );
}
