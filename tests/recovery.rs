//! Durability: slug stability across restarts, index rebuild equivalence,
//! orphaned-commit recovery, and search behavior.

mod common;

use common::{register, test_engine};
use mailroom::engine::{Engine, InboxQuery, ReserveRequest, SendMessage, SendOptions};
use mailroom::Settings;

fn send(sender: &str, to: &str, subject: &str, body: &str) -> SendMessage {
    SendMessage {
        sender: sender.into(),
        to: vec![to.into()],
        subject: subject.into(),
        body_md: body.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn slug_survives_restart() {
    let (dir, engine) = test_engine();
    let before = engine.ensure_project("/p/demo", None).await.unwrap();
    drop(engine);

    let engine = Engine::new(Settings::for_storage_root(dir.path())).unwrap();
    let after = engine.ensure_project("/p/demo", None).await.unwrap();
    assert_eq!(before.slug, after.slug);
}

#[tokio::test]
async fn rebuild_reproduces_index_state() {
    let (dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    let receipt = engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi", "Hello"), SendOptions::default())
        .await
        .unwrap();
    engine
        .reserve_file_paths(
            "/p/demo",
            ReserveRequest {
                agent: "Alpha".into(),
                paths: vec!["src/**".into()],
                ttl_seconds: Some(3600),
                exclusive: true,
                reason: "work".into(),
            },
            None,
        )
        .await
        .unwrap();

    // Blow the index away and rebuild from the archive alone.
    let report = engine.rebuild_index().unwrap();
    assert_eq!(report.projects, 1);
    assert_eq!(report.agents, 2);
    assert!(report.messages >= 1);
    assert_eq!(report.claims, 1);

    // The rebuilt index answers the same queries.
    assert!(engine.get_message("/p/demo", &receipt.id).is_ok());
    assert_eq!(engine.list_claims("/p/demo", true).unwrap().len(), 1);
    drop(dir);
}

#[tokio::test]
async fn rebuild_preserves_rows_field_by_field() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    let receipt = engine
        .send_message(
            "/p/demo",
            send("Alpha", "Beta", "Subject line", "Body **markdown**"),
            SendOptions::default(),
        )
        .await
        .unwrap();

    let (message_before, recipients_before) = engine.get_message("/p/demo", &receipt.id).unwrap();
    let agents_before: Vec<_> = engine
        .list_agents("/p/demo", false)
        .unwrap()
        .into_iter()
        .map(|a| (a.name, a.program, a.model, a.contact_policy))
        .collect();

    engine.rebuild_index().unwrap();

    let (message_after, recipients_after) = engine.get_message("/p/demo", &receipt.id).unwrap();
    assert_eq!(message_before.id, message_after.id);
    assert_eq!(message_before.subject, message_after.subject);
    assert_eq!(message_before.body_md, message_after.body_md);
    assert_eq!(message_before.created_ts, message_after.created_ts);
    assert_eq!(message_before.thread_id, message_after.thread_id);
    assert_eq!(recipients_before.len(), recipients_after.len());
    assert_eq!(recipients_before[0].agent_name, recipients_after[0].agent_name);

    let agents_after: Vec<_> = engine
        .list_agents("/p/demo", false)
        .unwrap()
        .into_iter()
        .map(|a| (a.name, a.program, a.model, a.contact_policy))
        .collect();
    assert_eq!(agents_before, agents_after);

    // Search still works after a rebuild (FTS triggers refill).
    let hits = engine.search_messages("/p/demo", "markdown", 10).unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn orphaned_archive_commit_is_recovered_on_restart() {
    let (dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    let receipt = engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi", "Hello"), SendOptions::default())
        .await
        .unwrap();
    drop(engine);

    // Simulate a crash between archive commit and index write: delete the
    // index entirely (including WAL sidecars), leaving the committed
    // archive as the only truth.
    for suffix in ["", "-wal", "-shm"] {
        let path = dir.path().join(format!("store.sqlite3{suffix}"));
        if path.exists() {
            std::fs::remove_file(path).unwrap();
        }
    }

    let engine = Engine::new(Settings::for_storage_root(dir.path())).unwrap();
    let report = engine.startup_reconcile().unwrap();
    assert!(report.messages >= 1);

    // The message is intact with its full body.
    let (message, recipients) = engine.get_message("/p/demo", &receipt.id).unwrap();
    assert_eq!(message.body_md, "Hello");
    assert_eq!(recipients.len(), 1);
    let inbox = engine
        .fetch_inbox("/p/demo", "Beta", &InboxQuery { limit: 10, ..Default::default() })
        .unwrap();
    assert_eq!(inbox.len(), 1);
}

#[tokio::test]
async fn search_token_and_phrase_semantics() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi", "Hello"), SendOptions::default())
        .await
        .unwrap();

    // Token match hits; a phrase that never occurs contiguously does not.
    assert_eq!(engine.search_messages("/p/demo", "Hello", 10).unwrap().len(), 1);
    assert_eq!(
        engine
            .search_messages("/p/demo", "\"Hello world\"", 10)
            .unwrap()
            .len(),
        0
    );
    // Prefix and boolean grammar.
    assert_eq!(engine.search_messages("/p/demo", "Hel*", 10).unwrap().len(), 1);
    assert_eq!(
        engine
            .search_messages("/p/demo", "Hello AND Hi", 10)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        engine
            .search_messages("/p/demo", "Hello NOT Hi", 10)
            .unwrap()
            .len(),
        0
    );

    let err = engine.search_messages("/p/demo", "", 10).unwrap_err();
    assert_eq!(err.code().as_str(), "INVALID_ARGUMENT");
}

#[tokio::test]
async fn gc_sweeps_expired_claims_across_projects() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;

    engine
        .reserve_file_paths(
            "/p/demo",
            ReserveRequest {
                agent: "Alpha".into(),
                paths: vec!["src/a.rs".into()],
                ttl_seconds: Some(60),
                exclusive: true,
                reason: String::new(),
            },
            None,
        )
        .await
        .unwrap();

    // Nothing has expired yet.
    assert_eq!(engine.gc_expired_claims().await.unwrap(), 0);
    assert_eq!(engine.list_claims("/p/demo", true).unwrap().len(), 1);
}
