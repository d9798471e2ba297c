//! HTTP-level tests of the Scaleway client against a local stub server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::extract::State;
use axum::http::{Method as StubMethod, StatusCode as StubStatus, Uri};
use rstest::rstest;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use super::*;
use crate::remote::{DiskStatus, SnapshotStatus};

/// Answers `"<METHOD> <path>"` routes with canned JSON; anything else is 404.
#[derive(Default)]
struct Stub {
    routes: HashMap<String, Value>,
    seen: Mutex<Vec<String>>,
}

impl Stub {
    fn route(mut self, method: &str, path: &str, body: Value) -> Self {
        self.routes.insert(format!("{method} {path}"), body);
        self
    }

    fn seen(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn answer(
    State(stub): State<Arc<Stub>>,
    method: StubMethod,
    uri: Uri,
    body: String,
) -> (StubStatus, String) {
    let target = uri.path_and_query().map_or_else(|| uri.path().to_owned(), ToString::to_string);
    stub.seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(format!("{method} {target} {body}").trim_end().to_owned());
    match stub.routes.get(&format!("{method} {}", uri.path())) {
        Some(reply) => (StubStatus::OK, reply.to_string()),
        None => (StubStatus::NOT_FOUND, String::from(r#"{"message":"not found"}"#)),
    }
}

async fn serve(stub: Stub) -> (ScalewayClient, Arc<Stub>) {
    let stub = Arc::new(stub);
    let router = Router::new()
        .fallback(answer)
        .with_state(Arc::clone(&stub));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub address");
    tokio::spawn(async move { axum::serve(listener, router).await });
    let client = ScalewayClient::new(format!("http://{addr}"), "secret", "proj", "fr-par-1")
        .expect("client should build");
    (client, stub)
}

fn volume_json(id: &str, zone: &str, status: &str) -> Value {
    json!({
        "id": id,
        "name": "pvc-1",
        "size": 12_000_000_000_u64,
        "status": status,
        "zone": zone,
        "references": [],
    })
}

fn disk_request(zone: &str) -> DiskRequest {
    DiskRequest {
        name: String::from("pvc-1"),
        client_token: String::from("pvc-1"),
        size_gib: 11,
        zone: zone.to_owned(),
        disk_type: String::from("sbs_5k"),
        charge: ChargeModel::PostPaid,
        snapshot_id: None,
    }
}

#[test]
fn new_trims_trailing_slash_from_api_url() {
    let client = ScalewayClient::new("https://api.example.test/", "secret", "proj", "fr-par-1")
        .expect("client should build");
    assert_eq!(
        client.block_url("fr-par-1", "volumes"),
        "https://api.example.test/block/v1alpha1/zones/fr-par-1/volumes"
    );
}

#[rstest]
#[case("nl-ams-1/v1", ("nl-ams-1", "v1"))]
#[case("v1", ("fr-par-1", "v1"))]
fn identifiers_without_zone_use_client_zone(#[case] id: &str, #[case] expected: (&str, &str)) {
    let client = ScalewayClient::new("https://api.example.test", "secret", "proj", "fr-par-1")
        .expect("client should build");
    assert_eq!(client.split_id(id), expected);
}

#[tokio::test]
async fn volume_created_in_another_zone_is_reachable_afterwards() {
    let (client, stub) = serve(
        Stub::default()
            .route("GET", "/block/v1alpha1/zones/nl-ams-1/volumes", json!({ "volumes": [] }))
            .route(
                "POST",
                "/block/v1alpha1/zones/nl-ams-1/volumes",
                volume_json("v1", "nl-ams-1", "creating"),
            )
            .route(
                "GET",
                "/block/v1alpha1/zones/nl-ams-1/volumes/v1",
                volume_json("v1", "nl-ams-1", "available"),
            ),
    )
    .await;

    let id = client
        .create_disk(&disk_request("nl-ams-1"))
        .await
        .expect("create");
    let described = client
        .describe_disks(&[id.clone()])
        .await
        .expect("describe");
    client.delete_disk(&id).await.expect("delete");

    assert_eq!(id, "nl-ams-1/v1");
    assert_eq!(described.len(), 1);
    assert!(described.iter().all(|disk| disk.id == id));
    assert!(
        described
            .iter()
            .all(|disk| disk.status == DiskStatus::Unattached)
    );
    let seen = stub.seen();
    assert!(
        seen.iter()
            .all(|request| request.contains("/zones/nl-ams-1/")),
        "requests: {seen:?}"
    );
    assert!(
        seen.iter()
            .any(|request| request.starts_with("DELETE /block/v1alpha1/zones/nl-ams-1/volumes/v1")),
        "requests: {seen:?}"
    );
}

#[tokio::test]
async fn create_reuses_volume_with_matching_name() {
    let (client, stub) = serve(Stub::default().route(
        "GET",
        "/block/v1alpha1/zones/fr-par-2/volumes",
        json!({ "volumes": [volume_json("v7", "fr-par-2", "available")] }),
    ))
    .await;

    let id = client
        .create_disk(&disk_request("fr-par-2"))
        .await
        .expect("reuse");

    assert_eq!(id, "fr-par-2/v7");
    assert!(
        stub.seen()
            .iter()
            .all(|request| !request.starts_with("POST")),
        "requests: {:?}",
        stub.seen()
    );
}

#[tokio::test]
async fn absent_volume_is_missing_from_description() {
    let (client, stub) = serve(Stub::default()).await;

    let described = client
        .describe_disks(&[String::from("v2")])
        .await
        .expect("describe");

    assert!(described.is_empty());
    assert_eq!(
        stub.seen(),
        vec![String::from("GET /block/v1alpha1/zones/fr-par-1/volumes/v2")]
    );
}

#[tokio::test]
async fn concurrent_attaches_to_one_server_are_sent_per_volume() {
    let (client, stub) = serve(Stub::default().route(
        "POST",
        "/instance/v1/zones/fr-par-1/servers/srv-1/attach-volume",
        json!({ "server": { "id": "srv-1" } }),
    ))
    .await;

    let (first, second) = tokio::join!(
        client.attach_disk("fr-par-1/v1", "srv-1"),
        client.attach_disk("fr-par-1/v2", "srv-1"),
    );
    first.expect("first attach");
    second.expect("second attach");

    let mut seen = stub.seen();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            String::from(
                r#"POST /instance/v1/zones/fr-par-1/servers/srv-1/attach-volume {"volume_id":"v1","volume_type":"sbs_volume"}"#
            ),
            String::from(
                r#"POST /instance/v1/zones/fr-par-1/servers/srv-1/attach-volume {"volume_id":"v2","volume_type":"sbs_volume"}"#
            ),
        ]
    );
}

#[tokio::test]
async fn attach_to_unknown_server_is_rejected() {
    let (client, _stub) = serve(Stub::default()).await;

    let err = client
        .attach_disk("fr-par-1/v1", "srv-missing")
        .await
        .expect_err("unknown server");

    assert!(matches!(err, RemoteError::Rejected { .. }));
}

#[tokio::test]
async fn detach_uses_the_volume_zone() {
    let (client, stub) = serve(Stub::default().route(
        "POST",
        "/instance/v1/zones/nl-ams-1/servers/srv-1/detach-volume",
        json!({ "server": { "id": "srv-1" } }),
    ))
    .await;

    client
        .detach_disk("nl-ams-1/v1", "srv-1")
        .await
        .expect("detach");

    assert_eq!(
        stub.seen(),
        vec![String::from(
            r#"POST /instance/v1/zones/nl-ams-1/servers/srv-1/detach-volume {"volume_id":"v1"}"#
        )]
    );
}

#[tokio::test]
async fn snapshot_is_taken_in_the_source_volume_zone() {
    let snapshot = json!({
        "id": "s1",
        "name": "nightly",
        "parent_volume": { "id": "v1" },
        "size": 12_000_000_000_u64,
        "status": "creating",
    });
    let (client, _stub) = serve(
        Stub::default()
            .route("POST", "/block/v1alpha1/zones/nl-ams-1/snapshots", snapshot.clone())
            .route("GET", "/block/v1alpha1/zones/nl-ams-1/snapshots/s1", snapshot),
    )
    .await;

    let id = client
        .create_snapshot("nl-ams-1/v1", "nightly")
        .await
        .expect("create snapshot");
    let described = client
        .describe_snapshots(&[id.clone()])
        .await
        .expect("describe snapshot");

    assert_eq!(id, "nl-ams-1/s1");
    let found = described.first().expect("snapshot described");
    assert_eq!(found.source_disk_id, "nl-ams-1/v1");
    assert_eq!(found.status, SnapshotStatus::Creating);
}
