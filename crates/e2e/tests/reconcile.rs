//! Reconciliation driven through the poller against the fake control server

use meshagent_common::{DesiredState, WgKeyPair};
use meshagent_daemon::{MeshOutcome, PollOutcome};
use meshagent_e2e::fixtures::{body, local_host, mesh, peer};
use meshagent_e2e::{Harness, TunnelCall};

fn office_body(private_key: &str) -> Vec<u8> {
    body(vec![mesh(
        "office",
        vec![
            local_host("10.40.0.1/24", "PUB-ME", private_key),
            peer(
                "alpha",
                "10.40.0.2/24",
                "PUB-ALPHA",
                &["10.40.0.2/32", "192.168.77.0/24", "172.20.0.0/16"],
            ),
        ],
    )])
}

fn applied(outcome: &PollOutcome) -> &meshagent_daemon::ReconcileReport {
    match outcome {
        PollOutcome::Applied(report) => report,
        other => panic!("expected an applied state, got {:?}", other),
    }
}

#[tokio::test]
async fn first_poll_applies_and_repeat_is_not_modified() {
    let h = Harness::start().await.expect("harness");
    let outcome = h.push(&office_body("PRIV-ME")).await;

    let report = applied(&outcome);
    assert_eq!(report.outcome("office"), Some(&MeshOutcome::Applied { started: true }));
    assert_eq!(
        h.tunnels.calls(),
        vec![
            TunnelCall::Stop { mesh: "office".to_string() },
            TunnelCall::Start {
                mesh: "office".to_string(),
                config_path: h.tunnel_path("office"),
            },
        ]
    );

    let text = h.tunnel_file("office").expect("tunnel file written");
    assert!(text.contains("PrivateKey = PRIV-ME"));
    assert!(text.contains("AllowedIPs = 10.40.0.2/32, 172.20.0.0/16\n"));
    assert!(!text.contains("192.168.77.0/24"), "LAN route must be filtered");

    assert_eq!(h.poller.poll_once().await, PollOutcome::NotModified);
    assert_eq!(h.tunnels.calls().len(), 2);

    let requests = h.server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].if_none_match, None);
    assert_eq!(requests[1].if_none_match, Some(h.server.etag()));
    assert_eq!(requests[1].status, 304);
    assert!(requests[0]
        .user_agent
        .as_deref()
        .is_some_and(|ua| ua.starts_with("meshagent/")));
    assert_eq!(requests[0].api_key.as_deref(), Some("key-one"));
}

#[tokio::test]
async fn resync_is_idempotent_and_heals_dead_tunnel() {
    let h = Harness::start().await.expect("harness");
    h.push(&office_body("PRIV-ME")).await;
    assert_eq!(h.tunnels.starts("office"), 1);

    for _ in 0..3 {
        let report = h.reconciler.resync().await.expect("resync");
        assert_eq!(report.outcome("office"), Some(&MeshOutcome::Unchanged));
    }
    assert_eq!(h.tunnels.calls().len(), 2, "unchanged input must not restart");

    h.tunnels.kill("office");
    h.tunnels.clear_calls();
    let report = h.reconciler.resync().await.expect("resync");
    assert_eq!(report.outcome("office"), Some(&MeshOutcome::Healed));
    assert_eq!(
        h.tunnels.calls(),
        vec![TunnelCall::Start {
            mesh: "office".to_string(),
            config_path: h.tunnel_path("office"),
        }]
    );
}

#[tokio::test]
async fn byte_identical_payload_is_skipped() {
    let h = Harness::start().await.expect("harness");
    let payload = office_body("PRIV-ME");
    h.push(&payload).await;

    let report = h.reconciler.apply_update(&payload).await.expect("apply");
    assert!(report.payload_unchanged);
    assert!(report.meshes.is_empty());
    assert_eq!(h.tunnels.starts("office"), 1);
}

#[tokio::test]
async fn only_changed_mesh_is_restarted() {
    let h = Harness::start().await.expect("harness");
    let lab = mesh(
        "lab",
        vec![
            local_host("10.50.0.1/24", "PUB-LAB", "PRIV-LAB"),
            peer("beta", "10.50.0.2/24", "PUB-BETA", &["10.50.0.2/32"]),
        ],
    );
    let mut office = mesh(
        "office",
        vec![
            local_host("10.40.0.1/24", "PUB-ME", "PRIV-ME"),
            peer("alpha", "10.40.0.2/24", "PUB-ALPHA", &["10.40.0.2/32"]),
        ],
    );

    h.push(&body(vec![office.clone(), lab.clone()])).await;
    h.tunnels.clear_calls();

    office.hosts[1].current.allowed_ips.push("10.99.0.0/16".to_string());
    let outcome = h.push(&body(vec![office, lab])).await;

    let report = applied(&outcome);
    assert_eq!(report.outcome("office"), Some(&MeshOutcome::Applied { started: true }));
    assert_eq!(report.outcome("lab"), Some(&MeshOutcome::Unchanged));
    assert!(h.tunnels.calls().iter().all(|c| c.mesh() == "office"));
    assert!(h.tunnel_file("office").unwrap().contains("10.99.0.0/16"));
}

#[tokio::test]
async fn malformed_payload_is_discarded() {
    let h = Harness::start().await.expect("harness");

    assert_eq!(h.push(b"{\"config\": [{\"meshName\": ").await, PollOutcome::Discarded);
    assert!(!h.state_path().exists());
    assert!(h.tunnels.calls().is_empty());

    let outcome = h.push(&office_body("PRIV-ME")).await;
    assert_eq!(applied(&outcome).applied(), 1);
    assert!(h.state_path().exists());
}

#[tokio::test]
async fn removed_mesh_is_torn_down() {
    let h = Harness::start().await.expect("harness");
    let office = mesh(
        "office",
        vec![local_host("10.40.0.1/24", "PUB-ME", "PRIV-ME")],
    );
    let lab = mesh(
        "lab",
        vec![local_host("10.50.0.1/24", "PUB-LAB", "PRIV-LAB")],
    );

    h.push(&body(vec![office.clone(), lab])).await;
    assert!(h.tunnel_file("lab").is_some());
    assert_eq!(h.reconciler.keys().lookup("PUB-LAB").as_deref(), Some("PRIV-LAB"));
    h.tunnels.clear_calls();

    let outcome = h.push(&body(vec![office])).await;
    let report = applied(&outcome);

    assert_eq!(report.meshes[0], ("lab".to_string(), MeshOutcome::Removed));
    assert_eq!(report.outcome("office"), Some(&MeshOutcome::Unchanged));
    assert_eq!(h.tunnels.calls(), vec![TunnelCall::Stop { mesh: "lab".to_string() }]);
    assert!(h.tunnel_file("lab").is_none());
    assert!(h.reconciler.keys().lookup("PUB-LAB").is_none());
    assert!(h.reconciler.keys().lookup("PUB-ME").is_some());

    let persisted: DesiredState =
        serde_json::from_slice(&std::fs::read(h.state_path()).unwrap()).unwrap();
    assert_eq!(persisted.config.len(), 1);
}

#[tokio::test]
async fn blank_private_key_rotates_and_reports_public_key() {
    let h = Harness::start().await.expect("harness");
    h.push(&office_body("")).await;

    let patches = h.server.patches();
    assert_eq!(patches.len(), 1);
    let sent = &patches[0];
    assert!(sent.current.private_key.is_empty(), "private key must never be sent");
    assert_ne!(sent.current.public_key, "PUB-ME");

    let keys = h.reconciler.keys();
    assert!(keys.lookup("PUB-ME").is_none());
    let private = keys.lookup(&sent.current.public_key).expect("new pair stored");
    assert_eq!(
        WgKeyPair::from_private_key(&private).unwrap().public_key,
        sent.current.public_key
    );

    // Persisted to disk too
    let on_disk = meshagent_common::KeyStore::open(keys.path()).unwrap();
    assert_eq!(on_disk.lookup(&sent.current.public_key), Some(private.clone()));

    let text = h.tunnel_file("office").unwrap();
    assert!(text.contains(&format!("PrivateKey = {}", private)));
}

#[tokio::test]
async fn disabled_self_host_is_written_but_not_started() {
    let h = Harness::start().await.expect("harness");
    let mut me = local_host("10.40.0.1/24", "PUB-ME", "PRIV-ME");
    me.enable = false;

    let outcome = h.push(&body(vec![mesh("office", vec![me])])).await;
    assert_eq!(
        applied(&outcome).outcome("office"),
        Some(&MeshOutcome::Applied { started: false })
    );
    assert_eq!(h.tunnels.starts("office"), 0);
    assert!(h.tunnel_file("office").is_some());

    // Resync never heals a disabled tunnel
    let report = h.reconciler.resync().await.unwrap();
    assert_eq!(report.outcome("office"), Some(&MeshOutcome::Unchanged));
    assert_eq!(h.tunnels.starts("office"), 0);
}

#[tokio::test]
async fn mesh_without_self_host_does_not_block_others() {
    let h = Harness::start().await.expect("harness");
    let foreign = mesh(
        "foreign",
        vec![peer("gamma", "10.60.0.2/24", "PUB-GAMMA", &["10.60.0.2/32"])],
    );
    let office = mesh(
        "office",
        vec![local_host("10.40.0.1/24", "PUB-ME", "PRIV-ME")],
    );

    let outcome = h.push(&body(vec![foreign, office])).await;
    let report = applied(&outcome);
    assert!(matches!(report.outcome("foreign"), Some(MeshOutcome::Skipped(_))));
    assert_eq!(report.outcome("office"), Some(&MeshOutcome::Applied { started: true }));
    assert!(h.tunnel_file("foreign").is_none());
}
