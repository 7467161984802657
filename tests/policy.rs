//! Contact policy, contact requests, cross-project links, overseer bypass.

mod common;

use common::{policy_engine, register};
use mailroom::engine::{InboxQuery, ReserveRequest, SendMessage, SendOptions};
use mailroom::ContactPolicy;

fn send(sender: &str, to: &str, subject: &str) -> SendMessage {
    SendMessage {
        sender: sender.into(),
        to: vec![to.into()],
        subject: subject.into(),
        body_md: "body".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn open_policy_always_allows() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    engine
        .set_contact_policy("/p/demo", "Beta", ContactPolicy::Open, None)
        .await
        .unwrap();

    engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn block_all_denies() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    engine
        .set_contact_policy("/p/demo", "Beta", ContactPolicy::BlockAll, None)
        .await
        .unwrap();

    let err = engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "POLICY_BLOCKED");
}

#[tokio::test]
async fn contacts_only_requires_accepted_contact() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    engine
        .set_contact_policy("/p/demo", "Beta", ContactPolicy::ContactsOnly, None)
        .await
        .unwrap();

    let err = engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "POLICY_BLOCKED");

    engine
        .request_contact("/p/demo", "Alpha", "Beta", "let's pair", None)
        .await
        .unwrap();
    engine
        .respond_contact("/p/demo", "Beta", "Alpha", true, None)
        .await
        .unwrap();

    engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn auto_policy_defers_then_allows_after_approval() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    // No shared signal: the send is deferred with a pending request.
    let err = engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "CONTACT_PENDING");

    // The request rides the target's inbox as a marked message.
    let inbox = engine
        .fetch_inbox("/p/demo", "Beta", &InboxQuery { limit: 10, ..Default::default() })
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(
        inbox[0].kind,
        mailroom::model::MessageKind::ContactRequest
    );

    // Retrying before approval still defers.
    let err = engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "CONTACT_PENDING");

    engine
        .respond_contact("/p/demo", "Beta", "Alpha", true, None)
        .await
        .unwrap();
    engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn auto_policy_allows_with_overlapping_claims() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;

    engine
        .reserve_file_paths(
            "/p/demo",
            ReserveRequest {
                agent: "Alpha".into(),
                paths: vec!["src/**".into()],
                ttl_seconds: Some(600),
                exclusive: false,
                reason: String::new(),
            },
            None,
        )
        .await
        .unwrap();
    engine
        .reserve_file_paths(
            "/p/demo",
            ReserveRequest {
                agent: "Beta".into(),
                paths: vec!["src/api/mod.rs".into()],
                ttl_seconds: Some(600),
                exclusive: false,
                reason: String::new(),
            },
            None,
        )
        .await
        .unwrap();

    // Overlapping active claims are a qualifying signal for auto.
    engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn auto_policy_allows_after_shared_thread() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    engine
        .set_contact_policy("/p/demo", "Beta", ContactPolicy::Open, None)
        .await
        .unwrap();

    // Alpha reaches Beta while Beta is open; afterwards Beta tightens to
    // auto, and the shared thread keeps the channel open.
    engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap();
    engine
        .set_contact_policy("/p/demo", "Beta", ContactPolicy::Auto, None)
        .await
        .unwrap();
    engine
        .send_message("/p/demo", send("Alpha", "Beta", "again"), SendOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn overseer_bypasses_policy_and_is_tagged() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/demo", "Human").await;
    register(&engine, "/p/demo", "Beta").await;
    engine
        .set_contact_policy("/p/demo", "Beta", ContactPolicy::BlockAll, None)
        .await
        .unwrap();

    let receipt = engine
        .send_message(
            "/p/demo",
            send("Human", "Beta", "Stop"),
            SendOptions {
                overseer: true,
                deadline: None,
            },
        )
        .await
        .unwrap();

    let (message, _) = engine.get_message("/p/demo", &receipt.id).unwrap();
    assert!(message.overseer);
    let inbox = engine
        .fetch_inbox("/p/demo", "Beta", &InboxQuery { limit: 10, ..Default::default() })
        .unwrap();
    assert!(inbox[0].overseer);
}

#[tokio::test]
async fn cross_project_send_requires_accepted_link() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/one", "Alpha").await;
    register(&engine, "/p/two", "Beta").await;

    let err = engine
        .send_message(
            "/p/one",
            send("Alpha", "Beta@/p/two", "Hello over there"),
            SendOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "LINK_REQUIRED");

    // The refused send left a pending link; the target accepts it, which
    // authorizes both directions.
    engine
        .respond_link("/p/one", "Alpha", "/p/two", "Beta", true, None)
        .await
        .unwrap();

    engine
        .send_message(
            "/p/one",
            send("Alpha", "Beta@/p/two", "Hello over there"),
            SendOptions::default(),
        )
        .await
        .unwrap();

    let inbox = engine
        .fetch_inbox("/p/two", "Beta", &InboxQuery { limit: 10, ..Default::default() })
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].from, "Alpha");
    assert_eq!(inbox[0].subject, "Hello over there");
}

#[tokio::test]
async fn request_link_flow() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/one", "Alpha").await;
    register(&engine, "/p/two", "Beta").await;

    let link = engine
        .request_link("/p/one", "Alpha", "/p/two", "Beta", None)
        .await
        .unwrap();
    assert_eq!(link.state, mailroom::model::LinkState::Pending);

    let decided = engine
        .respond_link("/p/one", "Alpha", "/p/two", "Beta", false, None)
        .await
        .unwrap();
    assert_eq!(decided.state, mailroom::model::LinkState::Blocked);

    let err = engine
        .send_message(
            "/p/one",
            send("Alpha", "Beta@/p/two", "Hi"),
            SendOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "LINK_REQUIRED");
}

#[tokio::test]
async fn contact_rejection_keeps_blocking() {
    let (_dir, engine) = policy_engine();
    register(&engine, "/p/demo", "Alpha").await;
    register(&engine, "/p/demo", "Beta").await;
    engine
        .set_contact_policy("/p/demo", "Beta", ContactPolicy::ContactsOnly, None)
        .await
        .unwrap();

    engine
        .request_contact("/p/demo", "Alpha", "Beta", "hello", None)
        .await
        .unwrap();
    engine
        .respond_contact("/p/demo", "Beta", "Alpha", false, None)
        .await
        .unwrap();

    let err = engine
        .send_message("/p/demo", send("Alpha", "Beta", "Hi"), SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "POLICY_BLOCKED");

    let contacts = engine.list_contacts("/p/demo", "Beta").unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].state, mailroom::model::ContactState::Rejected);
}
