//! Architectural Contract Test: Engine Lifecycle
//!
//! This test verifies how the engine starts, runs and stops.
//!
//! Constraints verified:
//! - Construction rejects an invalid configuration
//! - A ready session is reported, with a warning on a guild count mismatch
//! - Moderation events from the source are replicated
//! - Engine terminates on shutdown signal or when the source closes
//! - Running fan-outs finish before the engine returns
//!
//! If this test fails, someone has added:
//! - Detached background tasks
//! - Fan-outs that are cancelled half way through their targets
//! - A session that never reports its state

mod common;

use common::*;
use modsync_core::traits::SourceEvent;
use modsync_core::{EngineEvent, Error, ModSyncEngine, ModerationPlatform};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_test::{assert_err, assert_ok};

fn engine_for(
    platform: &Arc<RecordingPlatform>,
    guilds: &[modsync_core::GuildId],
) -> (
    ModSyncEngine,
    tokio::sync::mpsc::Receiver<EngineEvent>,
    tokio::sync::mpsc::UnboundedSender<SourceEvent>,
) {
    let (source, source_tx) = ControlledEventSource::new();
    let (engine, event_rx) = ModSyncEngine::new(
        Box::new(source),
        Arc::clone(platform) as Arc<dyn ModerationPlatform>,
        test_config(guilds),
    )
    .expect("engine construction succeeds");
    (engine, event_rx, source_tx)
}

#[tokio::test]
async fn empty_guild_list_is_rejected() {
    let platform = RecordingPlatform::new();
    let (source, _tx) = ControlledEventSource::new();

    let result = ModSyncEngine::new(
        Box::new(source),
        platform as Arc<dyn ModerationPlatform>,
        test_config(&[]),
    );

    let err = assert_err!(result.map(|_| ()));
    assert!(matches!(err, Error::Config(_)), "got {:?}", err);
}

#[tokio::test]
async fn shutdown_signal_terminates_engine() {
    let platform = RecordingPlatform::new();
    let (engine, mut event_rx, _source_tx) = engine_for(&platform, &[A, B]);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let engine_handle =
        tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();

    let result = timeout(Duration::from_secs(5), engine_handle).await;
    assert!(result.is_ok(), "Engine should terminate within 5 seconds");
    assert_ok!(result.unwrap().unwrap());

    let events = drain(&mut event_rx);
    assert_eq!(
        events.first(),
        Some(&EngineEvent::Started {
            monitored_guilds: 2
        })
    );
    assert_eq!(
        events.last(),
        Some(&EngineEvent::Stopped {
            reason: "Shutdown signal".to_string()
        })
    );
}

#[tokio::test]
async fn ready_session_reports_guild_count_mismatch() {
    let platform = RecordingPlatform::new();
    let (engine, mut event_rx, source_tx) = engine_for(&platform, &[A, B, C]);

    source_tx
        .send(SourceEvent::Ready {
            account: "modsync#0001".to_string(),
            guild_count: 5,
        })
        .unwrap();
    drop(source_tx);

    assert_ok!(
        timeout(Duration::from_secs(5), engine.run_with_shutdown(None))
            .await
            .expect("engine stops when the source closes")
    );

    let events = drain(&mut event_rx);
    assert!(events.contains(&EngineEvent::Connected {
        account: "modsync#0001".to_string(),
        connected_guilds: 5,
    }));
    assert!(events.contains(&EngineEvent::GuildCountMismatch {
        connected: 5,
        monitored: 3,
    }));
}

#[tokio::test]
async fn matching_guild_count_is_not_a_mismatch() {
    let platform = RecordingPlatform::new();
    let (engine, mut event_rx, source_tx) = engine_for(&platform, &[A, B]);

    source_tx
        .send(SourceEvent::Ready {
            account: "modsync#0001".to_string(),
            guild_count: 2,
        })
        .unwrap();
    drop(source_tx);

    assert_ok!(engine.run_with_shutdown(None).await);

    assert!(!drain(&mut event_rx)
        .iter()
        .any(|event| matches!(event, EngineEvent::GuildCountMismatch { .. })));
}

#[tokio::test]
async fn source_events_are_replicated() {
    let platform = RecordingPlatform::new();
    let (engine, mut event_rx, source_tx) = engine_for(&platform, &[A, B, C]);

    source_tx
        .send(SourceEvent::Moderation(ban_added(A, U, Some("spam"))))
        .unwrap();
    source_tx
        .send(SourceEvent::Moderation(ban_added(OUTSIDER, V, None)))
        .unwrap();
    drop(source_tx);

    assert_ok!(engine.run_with_shutdown(None).await);

    assert_eq!(platform.call_count(), 2);
    assert!(platform.calls().iter().all(|call| call.subject == U));

    let events = drain(&mut event_rx);
    assert!(events.iter().any(|event| matches!(
        event,
        EngineEvent::FanOutFinished { applied: 2, .. }
    )));
    assert_eq!(
        events.last(),
        Some(&EngineEvent::Stopped {
            reason: "Event source closed".to_string()
        })
    );
}

#[tokio::test]
async fn shutdown_waits_for_running_fan_out() {
    let platform = RecordingPlatform::new();
    platform.close_gate();
    let (engine, _event_rx, source_tx) = engine_for(&platform, &[A, B, C]);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let engine_handle =
        tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await });

    source_tx
        .send(SourceEvent::Moderation(ban_added(A, U, None)))
        .unwrap();
    platform.wait_for_attempts(1).await;

    // Shutdown while the first target is still pending
    shutdown_tx.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !engine_handle.is_finished(),
        "engine must not return with a fan-out half done"
    );

    platform.open_gate();
    let result = timeout(Duration::from_secs(5), engine_handle).await;
    assert!(result.is_ok(), "Engine should terminate once the fan-out finishes");
    assert_ok!(result.unwrap().unwrap());

    assert_eq!(platform.call_count(), 2, "both targets were completed");
}

#[tokio::test]
async fn dropped_shutdown_sender_stops_engine() {
    let platform = RecordingPlatform::new();
    let (engine, _event_rx, _source_tx) = engine_for(&platform, &[A, B]);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    drop(shutdown_tx);

    let result = timeout(
        Duration::from_secs(5),
        engine.run_with_shutdown(Some(shutdown_rx)),
    )
    .await;
    assert!(result.is_ok(), "a dropped sender counts as shutdown");
}
