//! Mailbox flows end to end: identity, delivery, threads, ordering.

mod common;

use common::{register, spec, test_engine};
use mailroom::engine::{InboxQuery, ReplyMessage, SendMessage, SendOptions};
use mailroom::Importance;

fn send_to(sender: &str, to: &[&str], subject: &str, body: &str) -> SendMessage {
    SendMessage {
        sender: sender.into(),
        to: to.iter().map(|s| s.to_string()).collect(),
        subject: subject.into(),
        body_md: body.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn ensure_project_yields_stable_slug() {
    let (_dir, engine) = test_engine();
    let a = engine.ensure_project("/p/demo", None).await.unwrap();
    let b = engine.ensure_project("/p/demo", None).await.unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(a.slug, b.slug);
    assert!(a.slug.starts_with("p-demo-"));
    // prefix + dash + 10 hex chars of the key hash
    assert_eq!(a.slug.len(), "p-demo".len() + 1 + 10);
}

#[tokio::test]
async fn register_is_idempotent_and_updates_mutable_fields() {
    let (_dir, engine) = test_engine();
    engine.ensure_project("/p/demo", None).await.unwrap();

    let first = engine
        .register_agent("/p/demo", spec("Alpha"), None)
        .await
        .unwrap();
    let mut updated = spec("Alpha");
    updated.model = "newer-model".into();
    let second = engine
        .register_agent("/p/demo", updated, None)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.model, "newer-model");
    assert_eq!(engine.list_agents("/p/demo", false).unwrap().len(), 1);
}

#[tokio::test]
async fn send_delivers_to_each_recipient_exactly_once() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    register(&engine, "/p/demo", "Gamma").await;

    let receipt = engine
        .send_message(
            "/p/demo",
            send_to("Alpha", &["Beta", "Gamma"], "Hi", "Hello"),
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(receipt.recipients, vec!["Beta", "Gamma"]);

    for name in ["Beta", "Gamma"] {
        let inbox = engine
            .fetch_inbox("/p/demo", name, &InboxQuery { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(inbox.len(), 1, "{name} should have exactly one message");
        assert_eq!(inbox[0].subject, "Hi");
        assert_eq!(inbox[0].from, "Alpha");
    }
    let outbox = engine.fetch_outbox("/p/demo", "Alpha", false, 10).unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].id, receipt.id);
}

#[tokio::test]
async fn duplicate_recipients_collapse() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    let mut message = send_to("Alpha", &["Beta", "beta"], "Hi", "Hello");
    message.cc = vec!["Beta".into()];
    engine
        .send_message("/p/demo", message, SendOptions::default())
        .await
        .unwrap();

    let inbox = engine
        .fetch_inbox("/p/demo", "Beta", &InboxQuery { limit: 10, ..Default::default() })
        .unwrap();
    assert_eq!(inbox.len(), 1);
}

#[tokio::test]
async fn unknown_recipient_fails_whole_send() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    let err = engine
        .send_message(
            "/p/demo",
            send_to("Alpha", &["Beta", "Nobody"], "Hi", "Hello"),
            SendOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "AGENT_NOT_REGISTERED");
    assert!(err.to_string().contains("Nobody"));

    // Nothing was delivered.
    let inbox = engine
        .fetch_inbox("/p/demo", "Beta", &InboxQuery { limit: 10, ..Default::default() })
        .unwrap();
    assert!(inbox.is_empty());
}

#[tokio::test]
async fn empty_recipient_list_is_invalid() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    let err = engine
        .send_message(
            "/p/demo",
            send_to("Alpha", &[], "Hi", "Hello"),
            SendOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "INVALID_ARGUMENT");
}

#[tokio::test]
async fn reply_threads_and_prefixes_subject() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    let original = engine
        .send_message(
            "/p/demo",
            send_to("Alpha", &["Beta"], "Hi", "Hello"),
            SendOptions::default(),
        )
        .await
        .unwrap();

    let reply = engine
        .reply_message(
            "/p/demo",
            &original.id,
            ReplyMessage {
                sender: "Beta".into(),
                body_md: "Ack".into(),
                importance: None,
                ack_required: None,
            },
            SendOptions::default(),
        )
        .await
        .unwrap();

    assert!(reply.subject.starts_with("Re: "));
    assert_eq!(reply.thread_id, original.id);
    assert_eq!(reply.recipients, vec!["Alpha"]);

    // Replying to the reply does not stack prefixes and stays in-thread.
    let reply2 = engine
        .reply_message(
            "/p/demo",
            &reply.id,
            ReplyMessage {
                sender: "Alpha".into(),
                body_md: "Got it".into(),
                importance: None,
                ack_required: None,
            },
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply2.subject, "Re: Hi");
    assert_eq!(reply2.thread_id, original.id);

    let summary = engine
        .summarize_thread("/p/demo", &original.id, false)
        .await
        .unwrap();
    assert_eq!(summary.total_messages, 3);
    assert_eq!(summary.participants, vec!["Alpha", "Beta"]);
    assert!(summary.first_ts.unwrap() <= summary.last_ts.unwrap());
}

#[tokio::test]
async fn reply_inherits_importance_and_ack() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    let mut message = send_to("Alpha", &["Beta"], "Deploy", "now");
    message.importance = Importance::Urgent;
    message.ack_required = true;
    let original = engine
        .send_message("/p/demo", message, SendOptions::default())
        .await
        .unwrap();

    engine
        .reply_message(
            "/p/demo",
            &original.id,
            ReplyMessage {
                sender: "Beta".into(),
                body_md: "on it".into(),
                importance: None,
                ack_required: None,
            },
            SendOptions::default(),
        )
        .await
        .unwrap();

    let inbox = engine
        .fetch_inbox(
            "/p/demo",
            "Alpha",
            &InboxQuery { urgent_only: true, limit: 10, ..Default::default() },
        )
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].importance, Importance::Urgent);
    assert!(inbox[0].ack_required);
}

#[tokio::test]
async fn acknowledge_records_timestamp_without_archive_change() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    let receipt = engine
        .send_message(
            "/p/demo",
            send_to("Alpha", &["Beta"], "Hi", "Hello"),
            SendOptions::default(),
        )
        .await
        .unwrap();

    let ack = engine
        .acknowledge_message("/p/demo", "Beta", &receipt.id)
        .unwrap();
    assert!(ack.updated);
    let again = engine
        .acknowledge_message("/p/demo", "Beta", &receipt.id)
        .unwrap();
    // Second ack is a no-op on the stored timestamp.
    assert!(again.updated);
    let (_, recipients) = engine.get_message("/p/demo", &receipt.id).unwrap();
    assert!(recipients[0].ack_ts.is_some());
    assert!(recipients[0].read_ts.is_some());
}

#[tokio::test]
async fn inbox_since_filter_and_bodies() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    let first = engine
        .send_message(
            "/p/demo",
            send_to("Alpha", &["Beta"], "first", "body one"),
            SendOptions::default(),
        )
        .await
        .unwrap();
    engine
        .send_message(
            "/p/demo",
            send_to("Alpha", &["Beta"], "second", "body two"),
            SendOptions::default(),
        )
        .await
        .unwrap();

    let newer = engine
        .fetch_inbox(
            "/p/demo",
            "Beta",
            &InboxQuery {
                since_ts: Some(first.created),
                include_bodies: true,
                limit: 10,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].subject, "second");
    assert_eq!(newer[0].body_md.as_deref(), Some("body two"));
}

#[tokio::test]
async fn concurrent_sends_order_strictly() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .send_message(
                    "/p/demo",
                    SendMessage {
                        sender: "Alpha".into(),
                        to: vec!["Beta".into()],
                        subject: format!("msg {i}"),
                        body_md: "x".into(),
                        ..Default::default()
                    },
                    SendOptions::default(),
                )
                .await
                .unwrap()
        }));
    }
    let mut receipts = Vec::new();
    for handle in handles {
        receipts.push(handle.await.unwrap());
    }

    // No lost deliveries, and created timestamps are strictly ordered.
    let inbox = engine
        .fetch_inbox("/p/demo", "Beta", &InboxQuery { limit: 50, ..Default::default() })
        .unwrap();
    assert_eq!(inbox.len(), 8);
    let mut stamps: Vec<_> = receipts.iter().map(|r| r.created).collect();
    stamps.sort();
    stamps.dedup();
    assert_eq!(stamps.len(), 8, "created_ts must be strictly monotonic");
}

#[tokio::test]
async fn whois_and_unknown_project_errors() {
    let (_dir, engine) = test_engine();
    register(&engine, "/p/demo", "Alpha").await;

    let agent = engine.whois("/p/demo", "alpha").unwrap();
    assert_eq!(agent.name, "Alpha");

    let err = engine.whois("/p/demo", "Ghost").unwrap_err();
    assert_eq!(err.code().as_str(), "AGENT_NOT_REGISTERED");

    let err = engine.whois("/p/other", "Alpha").unwrap_err();
    assert_eq!(err.code().as_str(), "PROJECT_NOT_FOUND");
}

#[tokio::test]
async fn macro_start_session_composes() {
    let (_dir, engine) = test_engine();
    let session = engine
        .macro_start_session(
            "/p/demo",
            spec("Alpha"),
            Some(vec!["src/**".into()]),
            Some(600),
            true,
            None,
        )
        .await
        .unwrap();
    assert_eq!(session.agent.name, "Alpha");
    let reservation = session.reservation.unwrap();
    assert_eq!(reservation.granted, vec!["src/**"]);
    assert!(session.inbox.is_empty());
}
