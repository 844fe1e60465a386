//! End-to-end sync rounds against a loopback storage server.
//!
//! A minimal HTTP server serves node discovery, `meta/global`, the
//! encrypted keyring and the collection endpoints, capturing everything
//! the client posts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use data_encoding::HEXLOWER;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use weftsync::crypto::{
    aes256_cbc_decrypt, aes256_cbc_encrypt, decode_key_base32, derive_key_bundle, hmac_sha256,
    random_iv, KeyBundle,
};
use weftsync::engine::SyncEngine;
use weftsync::host::{BookmarkHost, HostTab, MemoryBookmarks, MemoryTabs, NewNode};
use weftsync::keys::{KeyManager, KeyStrategy};
use weftsync::record::{CryptoEnvelope, TabsRecord, Wbo};
use weftsync::{
    BookmarkRecord, ConnectOptions, MemoryStore, SessionManager, StorageClient, SyncError,
};

const USER: &str = "test";
const PASSPHRASE: &str = "a-aaqea-yeaud-a9caj-bifqy-di9b4";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weftsync=debug".into()),
        )
        .try_init();
}

fn bulk_bundle() -> KeyBundle {
    KeyBundle::new([0x5a; 32], vec![0x6b; 32])
}

fn encrypt_payload(bundle: &KeyBundle, cleartext: &str) -> String {
    let iv = random_iv();
    let ciphertext = aes256_cbc_encrypt(&bundle.encryption, &iv, cleartext.as_bytes()).unwrap();
    let ciphertext_b64 = B64.encode(&ciphertext);
    let tag = hmac_sha256(&bundle.hmac, ciphertext_b64.as_bytes()).unwrap();
    serde_json::json!({
        "ciphertext": ciphertext_b64,
        "IV": B64.encode(iv),
        "hmac": HEXLOWER.encode(&tag),
    })
    .to_string()
}

fn decrypt_payload(bundle: &KeyBundle, payload: &str) -> String {
    let envelope: CryptoEnvelope = serde_json::from_str(payload).unwrap();
    let tag = hmac_sha256(&bundle.hmac, envelope.ciphertext.as_bytes()).unwrap();
    assert_eq!(HEXLOWER.encode(&tag), envelope.hmac, "posted record fails HMAC");
    let ciphertext = B64.decode(&envelope.ciphertext).unwrap();
    let iv = B64.decode(&envelope.iv).unwrap();
    String::from_utf8(aes256_cbc_decrypt(&bundle.encryption, &iv, &ciphertext).unwrap()).unwrap()
}

fn keyring_payload() -> String {
    let sync_key = decode_key_base32(PASSPHRASE).unwrap();
    let derived = derive_key_bundle(&sync_key, USER).unwrap();
    let bulk = bulk_bundle();
    let cleartext = serde_json::json!({
        "id": "keys",
        "default": [B64.encode(bulk.encryption), B64.encode(&bulk.hmac)],
        "collections": {},
    })
    .to_string();
    encrypt_payload(&derived, &cleartext)
}

#[derive(Default)]
struct ServerState {
    hits: HashMap<String, usize>,
    node_response: Option<(&'static str, String)>,
    storage_version: Option<u32>,
    bookmarks: Vec<Wbo>,
    tabs: Vec<Wbo>,
    client_ids: Vec<String>,
    posted_bookmarks: Vec<Wbo>,
    posted_tabs: Vec<Wbo>,
    posted_clients: Vec<Wbo>,
}

struct TestServer {
    url: String,
    state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    async fn start(state: ServerState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(Mutex::new(state));

        let loop_state = Arc::clone(&state);
        let loop_url = url.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&loop_state);
                let url = loop_url.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state, url).await;
                });
            }
        });

        Self { url, state }
    }

    fn hits(&self, path: &str) -> usize {
        *self.state.lock().unwrap().hits.get(path).unwrap_or(&0)
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<Mutex<ServerState>>,
    base_url: String,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    let path = target.split('?').next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    for line in lines {
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    let (status, response_body) = route(&method, &path, &body, &state, &base_url);
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{response_body}",
        response_body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn route(
    method: &str,
    path: &str,
    body: &str,
    state: &Arc<Mutex<ServerState>>,
    base_url: &str,
) -> (&'static str, String) {
    let mut state = state.lock().unwrap();
    *state.hits.entry(path.to_string()).or_insert(0) += 1;

    let storage = format!("/1.0/{USER}/storage");
    match (method, path) {
        ("GET", p) if p == format!("/user/1.0/{USER}/node/weave") => {
            match &state.node_response {
                Some((status, body)) => (*status, body.clone()),
                None => ("200 OK", format!("{base_url}/")),
            }
        }
        ("GET", p) if p == format!("{storage}/meta/global") => {
            let version = state.storage_version.unwrap_or(5);
            (
                "200 OK",
                serde_json::json!({
                    "id": "global",
                    "modified": 1000.0,
                    "payload": format!("{{\"storageVersion\":{version},\"syncID\":\"abcdef\"}}"),
                })
                .to_string(),
            )
        }
        ("GET", p) if p == format!("{storage}/crypto/keys") => (
            "200 OK",
            serde_json::json!({
                "id": "keys",
                "modified": 1000.0,
                "payload": keyring_payload(),
            })
            .to_string(),
        ),
        ("GET", p) if p == format!("{storage}/clients") => (
            "200 OK",
            serde_json::to_string(&state.client_ids).unwrap(),
        ),
        ("POST", p) if p == format!("{storage}/clients") => {
            let records: Vec<Wbo> = serde_json::from_str(body).unwrap();
            state.posted_clients.extend(records);
            ("200 OK", post_status(&state.posted_clients))
        }
        ("GET", p) if p == format!("{storage}/tabs") => {
            ("200 OK", serde_json::to_string(&state.tabs).unwrap())
        }
        ("POST", p) if p == format!("{storage}/tabs") => {
            let records: Vec<Wbo> = serde_json::from_str(body).unwrap();
            state.posted_tabs.extend(records);
            ("200 OK", post_status(&state.posted_tabs))
        }
        ("GET", p) if p == format!("{storage}/bookmarks") => {
            ("200 OK", serde_json::to_string(&state.bookmarks).unwrap())
        }
        ("POST", p) if p == format!("{storage}/bookmarks") => {
            let records: Vec<Wbo> = serde_json::from_str(body).unwrap();
            state.posted_bookmarks.extend(records);
            ("200 OK", post_status(&state.posted_bookmarks))
        }
        _ => ("404 Not Found", String::from("\"unknown\"")),
    }
}

fn post_status(records: &[Wbo]) -> String {
    let ids: Vec<&str> = records.iter().map(|w| w.id.as_str()).collect();
    serde_json::json!({"success": ids, "failed": {}}).to_string()
}

fn options(server: &str, passphrase: &str) -> ConnectOptions {
    ConnectOptions {
        server: Some(server.to_string()),
        user: Some(USER.to_string()),
        password: Some("password".to_string()),
        passphrase: Some(passphrase.to_string()),
        client: None,
    }
}

fn bookmark_wbo(id: &str, modified: f64, title: &str, url: &str, parent: &str) -> Wbo {
    let cleartext = serde_json::json!({
        "id": id,
        "type": "bookmark",
        "title": title,
        "bmkUri": url,
        "parentName": parent,
    })
    .to_string();
    Wbo {
        id: id.to_string(),
        modified: Some(modified),
        sortindex: None,
        payload: encrypt_payload(&bulk_bundle(), &cleartext),
    }
}

fn tabs_wbo(id: &str, name: &str, url: &str) -> Wbo {
    let cleartext = serde_json::json!({
        "id": id,
        "clientName": name,
        "tabs": [{"title": "remote tab", "urlHistory": [url]}],
    })
    .to_string();
    Wbo {
        id: id.to_string(),
        modified: Some(900.0),
        sortindex: None,
        payload: encrypt_payload(&bulk_bundle(), &cleartext),
    }
}

#[tokio::test]
async fn test_two_sync_rounds_end_to_end() {
    init_tracing();
    let server = TestServer::start(ServerState {
        bookmarks: vec![bookmark_wbo(
            "rec-toolbar",
            1000.0,
            "Example",
            "http://example.com/",
            "toolbar",
        )],
        tabs: vec![tabs_wbo("otherdev", "Other Device", "http://remote/")],
        ..ServerState::default()
    })
    .await;

    let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
    let store = Arc::new(MemoryStore::new());
    let bookmarks = Arc::new(MemoryBookmarks::new());
    let tabs = Arc::new(MemoryTabs::new());
    tabs.set_windows(vec![vec![
        HostTab {
            title: "Open tab".into(),
            url: "http://open.example/".into(),
            icon: None,
        },
        HostTab {
            title: "Settings".into(),
            url: "chrome://settings".into(),
            icon: None,
        },
    ]])
    .unwrap();

    // A pre-existing local bookmark that the server has never seen.
    let roots = bookmarks.roots().await.unwrap();
    bookmarks
        .create(NewNode {
            parent: roots.menu.clone(),
            title: "Local Only".into(),
            url: Some("http://local.example/".into()),
        })
        .await
        .unwrap();

    let engine = SyncEngine::connect(
        &sessions,
        options(&server.url, PASSPHRASE),
        bookmarks.clone(),
        tabs.clone(),
        store,
    )
    .await
    .unwrap();
    engine.sync().await.unwrap();

    // The incoming bookmark was materialized under the toolbar root.
    let tree = bookmarks.tree().await.unwrap();
    let incoming = tree
        .iter()
        .find(|n| n.url.as_deref() == Some("http://example.com/"))
        .expect("incoming bookmark not created");
    assert_eq!(incoming.parent.as_deref(), Some("2"));

    let (client_id, posted_tabs, posted_bookmarks, posted_clients) = {
        let state = server.state.lock().unwrap();
        (
            sessions.session().unwrap().unwrap().client.id.clone(),
            state.posted_tabs.clone(),
            state.posted_bookmarks.clone(),
            state.posted_clients.clone(),
        )
    };

    // Our device registered itself in the clients collection.
    assert_eq!(posted_clients.len(), 1);
    assert_eq!(posted_clients[0].id, client_id);

    // Our tabs record was rebuilt and pushed, with non-http URLs dropped.
    assert_eq!(posted_tabs.len(), 1);
    let own: TabsRecord =
        serde_json::from_str(&decrypt_payload(&bulk_bundle(), &posted_tabs[0].payload)).unwrap();
    assert_eq!(own.id, client_id);
    assert_eq!(own.tabs.len(), 1);
    assert_eq!(own.tabs[0].url_history, vec!["http://open.example/"]);

    // The local-only bookmark went out with a generated UUID record id.
    assert_eq!(posted_bookmarks.len(), 1);
    let out: BookmarkRecord = serde_json::from_str(&decrypt_payload(
        &bulk_bundle(),
        &posted_bookmarks[0].payload,
    ))
    .unwrap();
    assert!(out.id.starts_with('{') && out.id.ends_with('}'));
    assert_eq!(out.title.as_deref(), Some("Local Only"));
    assert_eq!(out.bmk_uri.as_deref(), Some("http://local.example/"));
    assert_eq!(out.parent_name.as_deref(), Some("Bookmarks Menu"));

    // Round two: the server record moved to the menu with a newer
    // timestamp; reconciliation updates the node and relocates it.
    server.state.lock().unwrap().bookmarks = vec![bookmark_wbo(
        "rec-toolbar",
        2000.0,
        "Renamed",
        "http://example.com/",
        "menu",
    )];
    engine.sync().await.unwrap();

    let tree = bookmarks.tree().await.unwrap();
    let moved = tree
        .iter()
        .find(|n| n.url.as_deref() == Some("http://example.com/"))
        .unwrap();
    assert_eq!(moved.title, "Renamed");
    assert_eq!(moved.parent.as_deref(), Some("1"));

    // The keyring was fetched exactly once across both rounds.
    assert_eq!(server.hits(&format!("/1.0/{USER}/storage/crypto/keys")), 1);
}

#[tokio::test]
async fn test_concurrent_key_requests_fetch_once() {
    init_tracing();
    let server = TestServer::start(ServerState::default()).await;

    let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
    let session = sessions.connect(options(&server.url, PASSPHRASE)).unwrap();
    let client = Arc::new(StorageClient::new(session).unwrap());
    client.ensure_user_storage_node().await.unwrap();
    let keys = Arc::new(KeyManager::new(client, KeyStrategy::DerivedHmac));

    let (a, b, c) = tokio::join!(
        keys.bulk_key("bookmarks"),
        keys.bulk_key("tabs"),
        keys.bulk_key("default"),
    );
    let expected = bulk_bundle();
    for bundle in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert_eq!(bundle.encryption, expected.encryption);
        assert_eq!(bundle.hmac, expected.hmac);
    }
    assert_eq!(server.hits(&format!("/1.0/{USER}/storage/crypto/keys")), 1);
}

#[tokio::test]
async fn test_node_discovery_falls_back_to_configured_server() {
    init_tracing();
    for node_response in [
        ("404 Not Found", String::new()),
        ("200 OK", String::new()),
    ] {
        let server = TestServer::start(ServerState {
            node_response: Some(node_response),
            ..ServerState::default()
        })
        .await;

        let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
        let session = sessions.connect(options(&server.url, PASSPHRASE)).unwrap();
        let client = StorageClient::new(session).unwrap();
        client.ensure_user_storage_node().await.unwrap();
        assert_eq!(
            client.session().storage_url().unwrap().as_deref(),
            Some(server.url.as_str())
        );
        assert_eq!(server.hits(&format!("/user/1.0/{USER}/node/weave")), 1);
    }
}

#[tokio::test]
async fn test_unsupported_storage_version_fails_connect() {
    init_tracing();
    let server = TestServer::start(ServerState {
        storage_version: Some(4),
        ..ServerState::default()
    })
    .await;
    let sessions = SessionManager::new(Arc::new(MemoryStore::new()));

    let err = SyncEngine::connect(
        &sessions,
        options(&server.url, PASSPHRASE),
        Arc::new(MemoryBookmarks::new()),
        Arc::new(MemoryTabs::new()),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap_err();
    assert_eq!(err, SyncError::StorageVersionMismatch { server: 4 });
    assert!(sessions.session().unwrap().is_none());
}

#[tokio::test]
async fn test_wrong_passphrase_fails_keyring_hmac() {
    init_tracing();
    let server = TestServer::start(ServerState::default()).await;
    let sessions = SessionManager::new(Arc::new(MemoryStore::new()));

    let err = SyncEngine::connect(
        &sessions,
        options(&server.url, "a-aaqea-yeaud-a9caj-bifqy-di9ba"),
        Arc::new(MemoryBookmarks::new()),
        Arc::new(MemoryTabs::new()),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap_err();
    assert_eq!(err, SyncError::KeyHmacFailed);

    // Setup failure tears the session down again.
    assert!(sessions.session().unwrap().is_none());
    SyncEngine::connect(
        &sessions,
        options(&server.url, PASSPHRASE),
        Arc::new(MemoryBookmarks::new()),
        Arc::new(MemoryTabs::new()),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();
}
