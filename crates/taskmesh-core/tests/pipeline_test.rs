// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the command pipeline: start, update/merge, locking, rate
//! limiting and error routing.

mod common;

use chrono::Duration;
use common::*;
use serde_json::json;
use taskmesh_core::HubError;
use taskmesh_core::hash::{scoped_hash, task_hash};
use taskmesh_protocol::{Command, CommandArgs, ProcessorEnvelope, Task, TaskMessage};

#[tokio::test]
async fn test_start_instantiates_template() {
    let ctx = TestContext::new().await;

    let started = ctx
        .start("root.chat", "react-1", t0())
        .await
        .expect("start should succeed");

    let instance_id = started
        .instance_id
        .as_deref()
        .expect("instance id assigned");
    // First instance of a family founds it
    assert_eq!(started.family_id.as_deref(), Some(instance_id));
    let meta = started.meta.as_ref().expect("meta initialized");
    assert_eq!(meta.founder, Some(true));
    assert_eq!(meta.created_at, Some(t0()));
    assert_eq!(meta.request_count, Some(0));
    assert!(meta.hash.is_some(), "fingerprint computed at start");
    assert_eq!(
        started.state.as_ref().and_then(|s| s.current.as_deref()),
        Some("start")
    );
    assert_eq!(started.hub_command(), Some(Command::Start));

    // The stored replica matches and the family map knows the member
    let stored = ctx.stored(instance_id).await;
    assert_eq!(stored.instance_id.as_deref(), Some(instance_id));
    let family = ctx
        .hub
        .stores()
        .family(instance_id)
        .await
        .expect("family read");
    assert_eq!(
        family.get("root.chat").and_then(|v| v.as_str()),
        Some(instance_id)
    );
}

#[tokio::test]
async fn test_start_unknown_task_id() {
    let ctx = TestContext::new().await;
    let err = ctx
        .start("root.nope", "react-1", t0())
        .await
        .expect_err("unknown template must be rejected");
    assert!(matches!(err, HubError::UnknownTaskId { .. }));
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn test_update_merges_partial_and_strips_tombstones() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.chat", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();

    // 1. Partial update only touches the output namespace
    let update = update_from(
        &started,
        "react-1",
        json!({"output": {"text": "hi", "tmp": 1}}),
        CommandArgs::default(),
    );
    ctx.submit_at(update, t0() + Duration::seconds(10))
        .await
        .expect("update should succeed");

    let stored = ctx.stored(&instance_id).await;
    assert_eq!(stored.output, Some(json!({"text": "hi", "tmp": 1})));
    // Untouched namespaces survive the merge
    assert_eq!(
        stored.state.as_ref().and_then(|s| s.current.as_deref()),
        Some("start")
    );
    assert_eq!(
        stored.meta.as_ref().and_then(|m| m.updated_at),
        Some(t0() + Duration::seconds(10))
    );

    // 2. A null tombstone deletes the key after the merge
    let delete = update_from(
        &stored,
        "react-1",
        json!({"output": {"tmp": null}}),
        CommandArgs::default(),
    );
    ctx.submit_at(delete, t0() + Duration::seconds(20))
        .await
        .expect("tombstone update should succeed");

    let stored = ctx.stored(&instance_id).await;
    assert_eq!(stored.output, Some(json!({"text": "hi"})));
}

#[tokio::test]
async fn test_update_accumulates_family_outputs() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.chat", "react-1", t0()).await.unwrap();
    let family_id = started.family_id.clone().unwrap();

    let update = update_from(
        &started,
        "react-1",
        json!({"output": {"text": "done"}}),
        CommandArgs::default(),
    );
    ctx.submit_at(update, t0() + Duration::seconds(5))
        .await
        .unwrap();

    let outputs = ctx
        .hub
        .stores()
        .outputs(&family_id)
        .await
        .expect("outputs read");
    assert_eq!(outputs.get("root.chat.output"), Some(&json!({"text": "done"})));
}

#[tokio::test]
async fn test_update_unknown_instance() {
    let ctx = TestContext::new().await;
    let ghost = Task {
        id: "root.chat".to_string(),
        instance_id: Some("no-such-instance".to_string()),
        ..Default::default()
    };
    let update = update_from(&ghost, "react-1", json!({"output": {}}), CommandArgs::default());
    let err = ctx
        .submit_at(update, t0())
        .await
        .expect_err("update of a missing instance must fail");
    assert!(matches!(err, HubError::InstanceNotFound { .. }));
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn test_lock_conflict_and_release() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.chat", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();

    // 1. react-1 takes the lock
    let lock = update_from(
        &started,
        "react-1",
        json!({"output": {"step": 1}}),
        CommandArgs {
            lock: true,
            ..Default::default()
        },
    );
    ctx.submit_at(lock, t0() + Duration::minutes(1))
        .await
        .expect("locking update should succeed");
    let stored = ctx.stored(&instance_id).await;
    assert_eq!(
        stored.meta.as_ref().and_then(|m| m.locked.as_deref()),
        Some("react-1")
    );

    // 2. Another processor is rejected while the lock is fresh
    let foreign = update_from(
        &stored,
        "react-2",
        json!({"output": {"step": 2}}),
        CommandArgs::default(),
    );
    let err = ctx
        .submit_at(foreign, t0() + Duration::minutes(2))
        .await
        .expect_err("fresh foreign lock must conflict");
    assert!(matches!(err, HubError::LockConflict { .. }));
    assert_eq!(err.http_status(), 423);

    // 3. Bypass writes through without stealing the lock
    let bypass = update_from(
        &stored,
        "react-2",
        json!({"output": {"step": 2}}),
        CommandArgs {
            lock_bypass: true,
            ..Default::default()
        },
    );
    ctx.submit_at(bypass, t0() + Duration::minutes(2))
        .await
        .expect("bypass should succeed");
    let stored = ctx.stored(&instance_id).await;
    assert_eq!(
        stored.meta.as_ref().and_then(|m| m.locked.as_deref()),
        Some("react-1")
    );

    // 4. The holder's next write releases the lock
    let release = update_from(
        &stored,
        "react-1",
        json!({"output": {"step": 3}}),
        CommandArgs::default(),
    );
    ctx.submit_at(release, t0() + Duration::minutes(3))
        .await
        .expect("holder update should succeed");
    let stored = ctx.stored(&instance_id).await;
    assert_eq!(stored.meta.as_ref().and_then(|m| m.locked.as_deref()), None);
}

#[tokio::test]
async fn test_stale_lock_overridden_but_not_transferred() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.chat", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();

    let lock = update_from(
        &started,
        "react-1",
        json!({"output": {"step": 1}}),
        CommandArgs {
            lock: true,
            ..Default::default()
        },
    );
    ctx.submit_at(lock, t0()).await.unwrap();

    // Past expiry the write is accepted, the absent holder keeps the lock
    let stored = ctx.stored(&instance_id).await;
    let late = update_from(
        &stored,
        "react-2",
        json!({"output": {"step": 2}}),
        CommandArgs::default(),
    );
    ctx.submit_at(late, t0() + Duration::minutes(6))
        .await
        .expect("stale lock must not block");
    let stored = ctx.stored(&instance_id).await;
    assert_eq!(stored.output, Some(json!({"step": 2})));
    assert_eq!(
        stored.meta.as_ref().and_then(|m| m.locked.as_deref()),
        Some("react-1")
    );
}

#[tokio::test]
async fn test_unlock_clears_foreign_lock() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.chat", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();

    let lock = update_from(
        &started,
        "react-1",
        json!({"output": {"step": 1}}),
        CommandArgs {
            lock: true,
            ..Default::default()
        },
    );
    ctx.submit_at(lock, t0()).await.unwrap();

    let stored = ctx.stored(&instance_id).await;
    let unlock = update_from(
        &stored,
        "react-2",
        json!({"output": {"step": 2}}),
        CommandArgs {
            unlock: true,
            ..Default::default()
        },
    );
    ctx.submit_at(unlock, t0() + Duration::minutes(1))
        .await
        .expect("unlock should succeed");
    let stored = ctx.stored(&instance_id).await;
    assert_eq!(stored.meta.as_ref().and_then(|m| m.locked.as_deref()), None);
}

#[tokio::test]
async fn test_rate_limit_per_minute_bucket() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.limited", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();

    // maxRequestRate is 2: two updates in the minute pass, the third is
    // rejected outright
    for (step, secs) in [(1, 10), (2, 20)] {
        let stored = ctx.stored(&instance_id).await;
        let update = update_from(
            &stored,
            "react-1",
            json!({"output": {"step": step}}),
            CommandArgs::default(),
        );
        ctx.submit_at(update, t0() + Duration::seconds(secs))
            .await
            .expect("update within rate should succeed");
    }

    let stored = ctx.stored(&instance_id).await;
    let over = update_from(
        &stored,
        "react-1",
        json!({"output": {"step": 3}}),
        CommandArgs::default(),
    );
    let err = ctx
        .submit_at(over, t0() + Duration::seconds(30))
        .await
        .expect_err("third update in the minute must be rejected");
    assert!(matches!(
        err,
        HubError::RateLimitExceeded {
            max_request_rate: 2
        }
    ));
    assert_eq!(err.http_status(), 409);

    // The next UTC minute opens a fresh bucket
    let retry = update_from(
        &stored,
        "react-1",
        json!({"output": {"step": 3}}),
        CommandArgs::default(),
    );
    ctx.submit_at(retry, t0() + Duration::seconds(70))
        .await
        .expect("new bucket should accept the retry");
}

#[tokio::test]
async fn test_request_count_soft_error_routes_to_error_task() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.capped", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();
    let family_id = started.family_id.clone().unwrap();

    // maxRequestCount is 2: updates pass until the stored count exceeds
    // the ceiling, so the counter reaches 3 before anything fires
    for (step, secs) in [(1, 10), (2, 20), (3, 30)] {
        let stored = ctx.stored(&instance_id).await;
        let update = update_from(
            &stored,
            "react-1",
            json!({"output": {"step": step}}),
            CommandArgs::default(),
        );
        ctx.submit_at(update, t0() + Duration::seconds(secs))
            .await
            .expect("update within count should succeed");
    }

    // The next one is not rejected at the transport; it comes back errored
    // and the family's error task is started
    let stored = ctx.stored(&instance_id).await;
    let over = update_from(
        &stored,
        "react-1",
        json!({"output": {"step": 4}}),
        CommandArgs::default(),
    );
    let errored = ctx
        .submit_at(over, t0() + Duration::seconds(40))
        .await
        .expect("count overflow is a soft error, not a rejection");
    let error = errored.error.as_ref().expect("error attached");
    assert!(error.message.contains("request count"));
    assert_eq!(errored.hub_command(), Some(Command::Error));

    let family = ctx.hub.stores().family(&family_id).await.unwrap();
    let handler_instance = family
        .get("root.error")
        .and_then(|v| v.as_str())
        .expect("error task started in the family");
    let handler = ctx.stored(handler_instance).await;
    assert_eq!(
        handler
            .meta
            .as_ref()
            .and_then(|m| m.parent_instance_id.as_deref()),
        Some(instance_id.as_str())
    );
    let text = handler
        .response
        .as_ref()
        .and_then(|r| r.get("text"))
        .and_then(|v| v.as_str())
        .expect("error text handed to the handler");
    assert!(text.contains("root.capped"));
}

#[tokio::test]
async fn test_hash_mismatch_rejects_diverged_update() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.chat", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();
    let seed = update_from(
        &started,
        "react-1",
        json!({"output": {"text": "a"}}),
        CommandArgs::default(),
    );
    ctx.submit_at(seed, t0() + Duration::seconds(5))
        .await
        .unwrap();

    // Fingerprints a correct sender would compute against our replica
    let stored = ctx.stored(&instance_id).await;
    let probe = update_from(
        &stored,
        "react-1",
        json!({"output": {"text": "b"}}),
        CommandArgs::default(),
    );
    let local_scoped = scoped_hash(
        &stored.to_value().unwrap(),
        &probe.to_value().unwrap(),
    )
    .expect("diff overlaps stored state");
    let local_full = task_hash(&stored).unwrap();

    // Both fingerprints wrong: the replicas have truly diverged
    let diverged = update_from(
        &stored,
        "react-1",
        json!({
            "output": {"text": "b"},
            "meta": {
                "hashDiff": local_scoped.wrapping_add(1),
                "hash": local_full.wrapping_add(1),
            }
        }),
        CommandArgs::default(),
    );
    let err = ctx
        .submit_at(diverged, t0() + Duration::seconds(10))
        .await
        .expect_err("diverged replica must be rejected");
    assert!(matches!(err, HubError::HashMismatch { .. }));
}

#[tokio::test]
async fn test_scoped_hash_mismatch_alone_is_tolerated() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.chat", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();
    let seed = update_from(
        &started,
        "react-1",
        json!({"output": {"text": "a"}}),
        CommandArgs::default(),
    );
    ctx.submit_at(seed, t0() + Duration::seconds(5))
        .await
        .unwrap();

    let stored = ctx.stored(&instance_id).await;
    let probe = update_from(
        &stored,
        "react-1",
        json!({"output": {"text": "b"}}),
        CommandArgs::default(),
    );
    let local_scoped = scoped_hash(
        &stored.to_value().unwrap(),
        &probe.to_value().unwrap(),
    )
    .unwrap();
    let local_full = task_hash(&stored).unwrap();

    // Wrong scoped hash but matching full hash: the divergence is in
    // unsynchronized state, the update is accepted
    let tolerated = update_from(
        &stored,
        "react-1",
        json!({
            "output": {"text": "b"},
            "meta": {
                "hashDiff": local_scoped.wrapping_add(1),
                "hash": local_full,
            }
        }),
        CommandArgs::default(),
    );
    ctx.submit_at(tolerated, t0() + Duration::seconds(10))
        .await
        .expect("scoped mismatch alone must not reject");
    let stored = ctx.stored(&instance_id).await;
    assert_eq!(stored.output, Some(json!({"text": "b"})));
}

#[tokio::test]
async fn test_done_starts_successor_in_family() {
    let ctx = TestContext::new().await;
    let started = ctx.start("root.chat", "react-1", t0()).await.unwrap();
    let instance_id = started.instance_id.clone().unwrap();
    let family_id = started.family_id.clone().unwrap();

    let done = update_from(
        &started,
        "react-1",
        json!({"output": {"text": "bye"}}),
        CommandArgs {
            done: true,
            next_task_id: Some("root.summary".to_string()),
            ..Default::default()
        },
    );
    let finished = ctx
        .submit_at(done, t0() + Duration::seconds(10))
        .await
        .expect("done update should succeed");
    assert_eq!(
        finished.state.as_ref().and_then(|s| s.done),
        Some(true)
    );
    assert_eq!(finished.meta.as_ref().and_then(|m| m.locked.as_deref()), None);

    // The successor joined the family with full lineage
    let family = ctx.hub.stores().family(&family_id).await.unwrap();
    let successor_instance = family
        .get("root.summary")
        .and_then(|v| v.as_str())
        .expect("successor started");
    let successor = ctx.stored(successor_instance).await;
    assert_eq!(successor.family_id.as_deref(), Some(family_id.as_str()));
    let meta = successor.meta.as_ref().unwrap();
    assert_eq!(meta.parent_instance_id.as_deref(), Some(instance_id.as_str()));
    assert_eq!(meta.parent_id.as_deref(), Some("root.chat"));
    assert_eq!(meta.founder, Some(false));

    let stored = ctx.stored(&instance_id).await;
    assert_eq!(
        stored.state.as_ref().and_then(|s| s.done),
        Some(true)
    );
    let children = stored
        .meta
        .as_ref()
        .and_then(|m| m.children_instances.as_ref())
        .expect("child recorded on the predecessor");
    assert!(children.contains(&successor_instance.to_string()));
}

#[tokio::test]
async fn test_message_records_session() {
    let ctx = TestContext::new().await;
    let task = Task {
        id: "root.chat".to_string(),
        processor: Some(ProcessorEnvelope {
            id: "react-1".to_string(),
            command: Some(Command::Start),
            command_args: Some(CommandArgs {
                init: Some(json!({"id": "root.chat"})),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let message = TaskMessage {
        session_id: Some("sess-1".to_string()),
        address: Some("wss://processor".to_string()),
        task,
    };
    let started = ctx
        .hub
        .process_message_at(message, None, t0())
        .await
        .expect("message should be processed");
    assert!(started.instance_id.is_some());

    let record = ctx
        .hub
        .stores()
        .session("sess-1")
        .await
        .expect("session read")
        .expect("session recorded");
    assert_eq!(record["taskId"], json!("root.chat"));
    assert_eq!(record["address"], json!("wss://processor"));
}

#[tokio::test]
async fn test_ping_answers_pong() {
    let ctx = TestContext::new().await;
    let ping = Task {
        processor: Some(ProcessorEnvelope {
            id: "react-1".to_string(),
            command: Some(Command::Ping),
            ..Default::default()
        }),
        ..Default::default()
    };
    let answer = ctx.submit_at(ping, t0()).await.expect("ping should succeed");
    assert_eq!(answer.hub_command(), Some(Command::Pong));
}
