use super::*;

use std::sync::{Arc, Mutex as StdMutex};

use axum::{
    extract::{OriginalUri, Path, State},
    http::Method,
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use serde_json::json;
use shared::protocol::Envelope;
use tokio::net::TcpListener;

use crate::{config::ClientSettings, credentials::InMemoryCredentialStore};

type Seen = Arc<StdMutex<Vec<(String, String)>>>;

async fn record(
    State(seen): State<Seen>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    body: Option<Json<Value>>,
) -> Response {
    seen.lock()
        .expect("seen lock")
        .push((method.to_string(), uri.to_string()));
    let data = match (method.as_str(), body) {
        ("GET", _) if uri.path().ends_with("/vehicles") => json!({
            "items": [{ "id": 3, "name": "Touring bike" }],
            "total": 41,
            "page": 2,
            "limit": 20,
        }),
        (_, Some(Json(body))) => json!({ "id": 9, "echo": body }),
        _ => json!({ "id": 9 }),
    };
    Json(Envelope::ok(data)).into_response()
}

async fn complaint_status(Path(id): Path<i64>, Json(update): Json<Value>) -> Response {
    Json(Envelope::ok(json!({
        "id": id,
        "subject": "Flat tyre",
        "status": update["status"],
    })))
    .into_response()
}

async fn spawn_resource_server() -> anyhow::Result<(String, Seen)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let seen: Seen = Arc::new(StdMutex::new(Vec::new()));
    let api = Router::new()
        .route("/vehicles", get(record).post(record))
        .route("/vehicles/:id", get(record).patch(record).delete(record))
        .route("/complaints/:id/status", patch(complaint_status))
        .with_state(seen.clone());
    let app = Router::new().nest("/api", api);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/api"), seen))
}

fn admin_api(base: &str) -> AdminApi {
    let client = RequestClient::new(
        ClientSettings::for_server(base),
        InMemoryCredentialStore::with_token("valid-token"),
    )
    .expect("client");
    AdminApi::new(Arc::new(client))
}

#[test]
fn list_query_skips_unset_fields() {
    let query = ListQuery {
        search: Some("scooter".into()),
        ..ListQuery::page(0, 500)
    };
    assert_eq!(
        serde_json::to_value(&query).expect("encode"),
        json!({ "page": 1, "limit": 100, "search": "scooter" })
    );
    assert_eq!(
        serde_json::to_value(ListQuery::default()).expect("encode"),
        json!({})
    );
}

#[tokio::test]
async fn list_sends_paging_query_and_decodes_page() {
    let (base, seen) = spawn_resource_server().await.expect("spawn server");
    let api = admin_api(&base);

    let page = api
        .list(AdminResource::Vehicles, &ListQuery::page(2, 20))
        .await
        .expect("list");

    assert_eq!(page.total, 41);
    assert_eq!(page.items[0]["name"], "Touring bike");
    assert_eq!(
        seen.lock().expect("seen").clone(),
        vec![("GET".to_string(), "/api/vehicles?page=2&limit=20".to_string())]
    );
}

#[tokio::test]
async fn crud_calls_use_item_paths_and_notify() {
    let (base, seen) = spawn_resource_server().await.expect("spawn server");
    let api = admin_api(&base);
    let mut events = api.client().subscribe_events();

    api.get(AdminResource::Vehicles, 9).await.expect("get");
    let created = api
        .create(AdminResource::Vehicles, &json!({ "name": "Cargo bike" }))
        .await
        .expect("create");
    api.update(AdminResource::Vehicles, 9, &json!({ "name": "Cargo bike XL" }))
        .await
        .expect("update");
    api.delete(AdminResource::Vehicles, 9).await.expect("delete");

    assert_eq!(created["echo"]["name"], "Cargo bike");
    let calls: Vec<(String, String)> = seen.lock().expect("seen").clone();
    assert_eq!(
        calls,
        vec![
            ("GET".to_string(), "/api/vehicles/9".to_string()),
            ("POST".to_string(), "/api/vehicles".to_string()),
            ("PATCH".to_string(), "/api/vehicles/9".to_string()),
            ("DELETE".to_string(), "/api/vehicles/9".to_string()),
        ]
    );

    let mut successes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let crate::ClientEvent::Notification(notice) = event {
            assert_eq!(notice.level, NoticeLevel::Success);
            successes.push(notice.text);
        }
    }
    assert_eq!(
        successes,
        vec![
            "Created in vehicles".to_string(),
            "Updated vehicles #9".to_string(),
            "Deleted vehicles #9".to_string(),
        ]
    );
}

#[tokio::test]
async fn complaint_status_is_patched() {
    let (base, _seen) = spawn_resource_server().await.expect("spawn server");
    let api = admin_api(&base);

    let summary = api
        .update_complaint_status(ComplaintId(12), ComplaintStatus::Resolved)
        .await
        .expect("status update");

    assert_eq!(summary.id, ComplaintId(12));
    assert_eq!(summary.status, ComplaintStatus::Resolved);
}
