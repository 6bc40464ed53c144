use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use parley_api::auth::AppStateInner;
use parley_db::Database;
use parley_gateway::auth::issue_token;
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::relay::Relay;
use parley_gateway::store::ChatStore;

const SECRET: &str = "api-test-secret";

struct Harness {
    app: Router,
    db: Arc<Database>,
}

impl Harness {
    fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store: Arc<dyn ChatStore> = db.clone();
        let relay = Relay::new(store, Dispatcher::new(), SECRET);
        let state = Arc::new(AppStateInner {
            db: db.clone(),
            relay,
            jwt_secret: SECRET.into(),
            token_ttl: chrono::Duration::hours(1),
        });
        Self {
            app: parley_api::router(state),
            db,
        }
    }

    /// Inserts a user directly and mints a token for it, skipping Argon2.
    fn user(&self, name: &str) -> (Uuid, String) {
        let id = Uuid::new_v4();
        self.db
            .create_user(
                &id.to_string(),
                name,
                &format!("{}@example.com", name.to_lowercase()),
                "not-a-real-hash",
            )
            .unwrap();
        let token = issue_token(SECRET, id, name, chrono::Duration::hours(1)).unwrap();
        (id, token)
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let resp = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    async fn direct_chat(&self, token: &str, other: Uuid) -> Uuid {
        let (status, chat) = self
            .call(
                Method::POST,
                "/chats",
                Some(token),
                Some(json!({ "participantIds": [other] })),
            )
            .await;
        assert!(status == StatusCode::CREATED || status == StatusCode::OK);
        chat["id"].as_str().unwrap().parse().unwrap()
    }
}

#[tokio::test]
async fn register_then_login() {
    let h = Harness::new();
    let body = json!({ "name": "Alice", "email": "Alice@Example.com", "password": "correct horse" });

    let (status, created) = h.call(Method::POST, "/auth/register", None, Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "Alice");
    assert!(created["token"].as_str().is_some_and(|t| !t.is_empty()));

    let (status, _) = h.call(Method::POST, "/auth/register", None, Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = h
        .call(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": "alice@example.com", "password": "wrong password" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, session) = h
        .call(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": "alice@example.com", "password": "correct horse" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["userId"], created["userId"]);

    // The issued token opens protected routes
    let token = session["token"].as_str().unwrap();
    let (status, chats) = h.call(Method::GET, "/chats", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chats, json!([]));
}

#[tokio::test]
async fn racing_registrations_for_one_email_conflict() {
    let h = Harness::new();
    let body = json!({ "name": "Dana", "email": "dana@example.com", "password": "long enough" });

    let (first, second) = tokio::join!(
        h.call(Method::POST, "/auth/register", None, Some(body.clone())),
        h.call(Method::POST, "/auth/register", None, Some(body)),
    );
    let mut statuses = vec![first.0, second.0];
    statuses.sort_by_key(|s| s.as_u16());
    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::CONFLICT]);
}

#[tokio::test]
async fn register_rejects_short_password() {
    let h = Harness::new();
    let (status, _) = h
        .call(
            Method::POST,
            "/auth/register",
            None,
            Some(json!({ "name": "Bob", "email": "bob@example.com", "password": "short" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn protected_routes_need_a_known_bearer() {
    let h = Harness::new();

    let (status, body) = h.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let (status, _) = h.call(Method::GET, "/chats", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = h.call(Method::GET, "/chats", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Validly signed, but nobody by that id exists
    let ghost = issue_token(SECRET, Uuid::new_v4(), "Ghost", chrono::Duration::hours(1)).unwrap();
    let (status, _) = h.call(Method::GET, "/chats", Some(ghost.as_str()), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn direct_chats_are_unique_per_pair() {
    let h = Harness::new();
    let (alice, alice_token) = h.user("Alice");
    let (bob, bob_token) = h.user("Bob");

    let (status, first) = h
        .call(Method::POST, "/chats", Some(alice_token.as_str()), Some(json!({ "participantIds": [bob] })))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    // Bob asking for the same pair gets the existing chat
    let (status, second) = h
        .call(Method::POST, "/chats", Some(bob_token.as_str()), Some(json!({ "participantIds": [alice] })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["id"], second["id"]);

    let (_, chats) = h.call(Method::GET, "/chats", Some(bob_token.as_str()), None).await;
    let chats = chats.as_array().unwrap();
    assert_eq!(chats.len(), 1);
    let mut members: Vec<&str> = chats[0]["participantIds"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    members.sort();
    let mut expected = vec![alice.to_string(), bob.to_string()];
    expected.sort();
    assert_eq!(members, expected);
}

#[tokio::test]
async fn chat_creation_validates_members() {
    let h = Harness::new();
    let (_, alice_token) = h.user("Alice");
    let (bob, _) = h.user("Bob");
    let (carol, _) = h.user("Carol");

    // Alone
    let (status, _) = h
        .call(Method::POST, "/chats", Some(alice_token.as_str()), Some(json!({ "participantIds": [] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Three people is not a direct chat
    let (status, _) = h
        .call(
            Method::POST,
            "/chats",
            Some(alice_token.as_str()),
            Some(json!({ "participantIds": [bob, carol] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .call(
            Method::POST,
            "/chats",
            Some(alice_token.as_str()),
            Some(json!({ "participantIds": [Uuid::new_v4()] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, group) = h
        .call(
            Method::POST,
            "/chats",
            Some(alice_token.as_str()),
            Some(json!({ "participantIds": [bob, carol], "isGroup": true, "name": " Weekend " })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(group["name"], "Weekend");
    assert_eq!(group["participantIds"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn history_is_for_participants_only() {
    let h = Harness::new();
    let (_, alice_token) = h.user("Alice");
    let (bob, _) = h.user("Bob");
    let (_, carol_token) = h.user("Carol");
    let chat = h.direct_chat(&alice_token, bob).await;
    let uri = format!("/chats/{}/messages", chat);

    for text in ["one", "two", "three"] {
        let (status, record) = h
            .call(Method::POST, &uri, Some(alice_token.as_str()), Some(json!({ "content": text })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["content"], text);
        assert_eq!(record["status"], "sent");
        assert_eq!(record["sender"]["name"], "Alice");
    }

    let (status, page) = h.call(Method::GET, &uri, Some(alice_token.as_str()), None).await;
    assert_eq!(status, StatusCode::OK);
    let contents: Vec<&str> = page
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["content"].as_str())
        .collect();
    assert_eq!(contents, ["one", "two", "three"]);

    let (status, _) = h.call(Method::GET, &uri, Some(carol_token.as_str()), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = h
        .call(Method::POST, &uri, Some(carol_token.as_str()), Some(json!({ "content": "let me in" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = h
        .call(Method::POST, &uri, Some(alice_token.as_str()), Some(json!({ "content": "   " })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Media-only is allowed
    let (status, record) = h
        .call(
            Method::POST,
            &uri,
            Some(alice_token.as_str()),
            Some(json!({ "mediaUrl": "https://cdn.example.com/cat.png" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(record["mediaUrl"], "https://cdn.example.com/cat.png");
}

#[tokio::test]
async fn history_pages_backwards() {
    let h = Harness::new();
    let (_, alice_token) = h.user("Alice");
    let (bob, _) = h.user("Bob");
    let chat = h.direct_chat(&alice_token, bob).await;
    let uri = format!("/chats/{}/messages", chat);

    for n in 0..5 {
        h.call(Method::POST, &uri, Some(alice_token.as_str()), Some(json!({ "content": format!("m{}", n) })))
            .await;
        // Distinct millisecond timestamps for the cursor
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let (_, latest) = h
        .call(Method::GET, &format!("{}?limit=2", uri), Some(alice_token.as_str()), None)
        .await;
    let latest = latest.as_array().unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0]["content"], "m3");
    assert_eq!(latest[1]["content"], "m4");

    let cursor = latest[0]["createdAt"].as_str().unwrap();
    let (_, older) = h
        .call(
            Method::GET,
            &format!("{}?limit=2&before={}", uri, cursor),
            Some(alice_token.as_str()),
            None,
        )
        .await;
    let older: Vec<&str> = older
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["content"].as_str())
        .collect();
    assert_eq!(older, ["m1", "m2"]);
}

#[tokio::test]
async fn posting_notifies_the_other_side() {
    let h = Harness::new();
    let (_, alice_token) = h.user("Alice");
    let (bob, bob_token) = h.user("Bob");
    let chat = h.direct_chat(&alice_token, bob).await;

    h.call(
        Method::POST,
        &format!("/chats/{}/messages", chat),
        Some(alice_token.as_str()),
        Some(json!({ "content": "ping" })),
    )
    .await;

    // Notifications are written by a detached task
    let mut count = 0;
    for _ in 0..50 {
        let (_, unread) = h
            .call(Method::GET, "/notifications/unread-count", Some(bob_token.as_str()), None)
            .await;
        count = unread["count"].as_u64().unwrap();
        if count > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(count, 1);

    let (_, inbox) = h.call(Method::GET, "/notifications", Some(bob_token.as_str()), None).await;
    assert_eq!(inbox[0]["content"], "New message from Alice");
    assert_eq!(inbox[0]["kind"], "MESSAGE");

    // Sender gets nothing
    let (_, unread) = h
        .call(Method::GET, "/notifications/unread-count", Some(alice_token.as_str()), None)
        .await;
    assert_eq!(unread["count"], 0);

    let (_, marked) = h
        .call(Method::POST, "/notifications/mark-all-read", Some(bob_token.as_str()), None)
        .await;
    assert_eq!(marked["updated"], 1);
    let (_, unread) = h
        .call(Method::GET, "/notifications/unread-count", Some(bob_token.as_str()), None)
        .await;
    assert_eq!(unread["count"], 0);
}

#[tokio::test]
async fn heartbeat_touches_last_seen() {
    let h = Harness::new();
    let (alice, alice_token) = h.user("Alice");

    let (status, body) = h.call(Method::POST, "/user/status", Some(alice_token.as_str()), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let row = h.db.get_user_by_id(&alice.to_string()).unwrap().unwrap();
    assert!(row.last_seen.is_some());
}
