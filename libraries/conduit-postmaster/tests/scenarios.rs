//! End-to-end scenarios: a real broker on an ephemeral port, driven through
//! the signed client library.

use std::net::SocketAddr;
use std::time::Duration;

use conduit_client::{Client, ClientConfig};
use conduit_postmaster::access::{self, AccessKey};
use conduit_postmaster::assets::AssetStore;
use conduit_postmaster::server::{BrokerConfig, BrokerState, serve};
use conduit_postmaster::{db, mailboxes};
use sqlx::SqlitePool;

struct TestBroker {
    addr: SocketAddr,
    pool: SqlitePool,
    admin: AccessKey,
    dir: tempfile::TempDir,
}

impl TestBroker {
    async fn spawn(enable_long_polling: bool) -> Self {
        let pool = db::open_memory().await.expect("open db");
        let dir = tempfile::tempdir().expect("tempdir");
        let assets = AssetStore::new(dir.path().join("files"));
        let config = BrokerConfig {
            enable_long_polling,
            throttle_delay: Duration::from_millis(10),
        };
        let state = BrokerState::new(pool.clone(), assets, config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(serve(state, listener));
        let admin = access::create_full_access(&pool, Some("ops"))
            .await
            .expect("admin key");
        Self {
            addr,
            pool,
            admin,
            dir,
        }
    }

    fn admin_client(&self) -> Client {
        Client::new(ClientConfig {
            host: self.addr.to_string(),
            key_name: self.admin.name.clone(),
            secret: self.admin.secret.clone(),
            ..Default::default()
        })
        .expect("client")
    }

    fn mailbox_client(&self, mailbox: &str, key_name: &str, secret: &str) -> Client {
        Client::new(ClientConfig {
            host: self.addr.to_string(),
            key_name: key_name.to_string(),
            secret: secret.to_string(),
            mailbox: mailbox.to_string(),
            ..Default::default()
        })
        .expect("client")
    }

    fn files_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("files")
    }
}

// S1: register, deploy to one mailbox, worker drains it.
#[tokio::test]
async fn one_shot_delivery() {
    let broker = TestBroker::spawn(false).await;
    let admin = broker.admin_client();

    let reg = admin.register("alpha").await.expect("register");
    assert_eq!(reg.mailbox, "alpha");
    assert_eq!(reg.access_key_name, "alpha");

    let put = admin
        .put_message(&["alpha".to_string()], "", "echo 1", "", "")
        .await
        .expect("put");
    assert_eq!(put.mailboxes, ["alpha"]);
    assert!(!put.deployment_id.is_empty());

    let worker = broker.mailbox_client("alpha", &reg.access_key_name, &reg.access_key_secret);
    let msg = worker.get_message().await.expect("get");
    assert_eq!(msg.body, "echo 1");
    assert_eq!(msg.receive_count, 1);
    assert_eq!(msg.deployment, put.deployment_id);
    assert!(!msg.created_at.is_empty());

    worker.delete(&msg.message).await.expect("delete");
    let empty = worker.get_message().await.expect("second get");
    assert!(empty.is_empty());
}

// S2: pattern fan-out hits exactly the matching mailboxes.
#[tokio::test]
async fn pattern_fan_out() {
    let broker = TestBroker::spawn(false).await;
    let admin = broker.admin_client();
    for id in ["svc.a.x", "svc.b.x", "other"] {
        admin.register(id).await.expect("register");
    }

    let put = admin
        .put_message(&[], "svc.*.x", "S", "", "")
        .await
        .expect("put");
    let mut delivered = put.mailboxes.clone();
    delivered.sort();
    assert_eq!(delivered, ["svc.a.x", "svc.b.x"]);
    assert_eq!(
        mailboxes::pending_count(&broker.pool, "other")
            .await
            .expect("count"),
        0
    );
}

// S3: a request whose timestamp is outside the window is rejected even
// though its HMAC is genuine.
#[tokio::test]
async fn replay_outside_window_is_rejected() {
    let broker = TestBroker::spawn(false).await;
    let admin = broker.admin_client();
    admin.register("alpha").await.expect("register");

    let token = conduit_crypt::signature::new_identifier();
    let stale_time = (chrono::Utc::now() - chrono::Duration::minutes(31))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let signature =
        conduit_crypt::signature::request_signature(&broker.admin.secret, &token, &stale_time);
    let body = serde_json::json!({
        "version": conduit_structs::WIRE_VERSION,
        "keyName": broker.admin.name,
        "token": token,
        "requestTime": stale_time,
        "signature": signature,
        "mailbox": "alpha",
    });

    let resp = reqwest::Client::new()
        .post(format!("http://{}/get", broker.addr))
        .json(&body)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);
    let err: conduit_structs::ApiError = resp.json().await.expect("error body");
    assert_eq!(err.error, "signature is invalid");
}

// S4: an upload whose bytes hash differently from the claimed digest leaves
// nothing on disk.
#[tokio::test]
async fn asset_integrity_enforced() {
    let broker = TestBroker::spawn(false).await;

    let claimed = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let mut req = conduit_structs::UploadFileRequest {
        filename: "payload.bin".to_string(),
        md5: claimed.to_string(),
        ..Default::default()
    };
    conduit_structs::Signed::sign(&mut req, &broker.admin.name, &broker.admin.secret);

    let form = reqwest::multipart::Form::new()
        .text("data", serde_json::to_string(&req).expect("json"))
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"not the claimed bytes".to_vec()),
        );
    let resp = reqwest::Client::new()
        .post(format!("http://{}/upload", broker.addr))
        .multipart(form)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 400);

    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(broker.files_dir()) {
        for entry in entries.flatten() {
            names.push(entry.file_name());
        }
    }
    assert!(names.is_empty(), "files dir should hold nothing: {names:?}");
}

// S5: a mailbox-scoped key cannot publish anywhere.
#[tokio::test]
async fn capability_enforcement() {
    let broker = TestBroker::spawn(false).await;
    let admin = broker.admin_client();
    let alpha = admin.register("alpha").await.expect("register");
    admin.register("beta").await.expect("register");

    let scoped = broker.mailbox_client("alpha", &alpha.access_key_name, &alpha.access_key_secret);
    let err = scoped
        .put_message(&["beta".to_string()], "", "x", "", "")
        .await
        .expect_err("scoped put must fail");
    assert!(err.to_string().contains("not allowed"), "got: {err}");
    assert_eq!(
        mailboxes::pending_count(&broker.pool, "beta")
            .await
            .expect("count"),
        0
    );
}

// S6: responses aggregate per deployment, sorted by mailbox, errors intact.
#[tokio::test]
async fn response_aggregation() {
    let broker = TestBroker::spawn(false).await;
    let admin = broker.admin_client();
    let mut keys = Vec::new();
    for id in ["m1", "m2", "m3"] {
        keys.push(admin.register(id).await.expect("register"));
    }

    let put = admin
        .put_message(
            &["m1".to_string(), "m2".to_string(), "m3".to_string()],
            "",
            "collect()",
            "rollout",
            "",
        )
        .await
        .expect("put");

    for (reg, text, is_error) in [(&keys[0], "ok", false), (&keys[1], "err", true)] {
        let worker =
            broker.mailbox_client(&reg.mailbox, &reg.access_key_name, &reg.access_key_secret);
        let msg = worker.get_message().await.expect("get");
        worker
            .respond(&msg.message, text, is_error)
            .await
            .expect("respond");
        worker.delete(&msg.message).await.expect("delete");
    }

    let stats = admin
        .deployment_stats(&put.deployment_id)
        .await
        .expect("stats");
    assert_eq!(stats.name, "rollout");
    assert_eq!(stats.message_count, 3);
    assert_eq!(stats.pending_count, 1);
    assert_eq!(stats.response_count, 2);
    assert_eq!(stats.responses.len(), 2);
    assert_eq!(stats.responses[0].mailbox, "m1");
    assert!(!stats.responses[0].is_error);
    assert_eq!(stats.responses[1].mailbox, "m2");
    assert!(stats.responses[1].is_error);
}

// A parked get is woken live by a publish instead of waiting out its timer.
#[tokio::test]
async fn long_poll_live_delivery() {
    let broker = TestBroker::spawn(true).await;
    let admin = broker.admin_client();
    let reg = admin.register("alpha").await.expect("register");
    let worker = broker.mailbox_client("alpha", &reg.access_key_name, &reg.access_key_secret);

    let parked = tokio::spawn(async move { worker.get_message().await });
    // give the get time to park before publishing
    tokio::time::sleep(Duration::from_millis(200)).await;

    admin
        .put_message(&["alpha".to_string()], "", "wake()", "", "")
        .await
        .expect("put");

    let msg = tokio::time::timeout(Duration::from_secs(5), parked)
        .await
        .expect("live delivery within seconds")
        .expect("join")
        .expect("get");
    assert_eq!(msg.body, "wake()");
}

// register then deregister restores the pre-state completely.
#[tokio::test]
async fn deregister_restores_pre_state() {
    let broker = TestBroker::spawn(false).await;
    let admin = broker.admin_client();
    let reg = admin.register("alpha").await.expect("register");
    admin
        .put_message(&["alpha".to_string()], "", "x", "", "")
        .await
        .expect("put");

    admin.deregister("alpha").await.expect("deregister");
    assert!(
        mailboxes::find(&broker.pool, "alpha")
            .await
            .expect("find")
            .is_none()
    );
    assert!(
        access::find_by_name(&broker.pool, &reg.access_key_name)
            .await
            .expect("find")
            .is_none()
    );
    let stats = admin.system_stats().await.expect("stats");
    assert_eq!(stats.total_mailboxes, 0);
    assert_eq!(stats.pending_messages, 0);
}

// unknown keys and wrong admin scope are both 400s on admin surfaces
#[tokio::test]
async fn admin_surface_requires_full_access() {
    let broker = TestBroker::spawn(false).await;
    let admin = broker.admin_client();
    let reg = admin.register("alpha").await.expect("register");
    let scoped = broker.mailbox_client("alpha", &reg.access_key_name, &reg.access_key_secret);

    assert!(scoped.register("beta").await.is_err());
    assert!(scoped.system_stats().await.is_err());
    assert!(scoped.list_deployments("", "", 10, false).await.is_err());

    let ghost = broker.mailbox_client("alpha", "ghost", "nope");
    let err = ghost.get_message().await.expect_err("unknown key");
    assert!(err.to_string().contains("not found"), "got: {err}");
}
