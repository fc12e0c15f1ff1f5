//! Sandbox registry behaviour against a fake engine.

mod common;

use common::FakeEngine;
use corral_core::{
    CoreError, ResolvedSandbox, SandboxId, SandboxNaming, SandboxPolicy, SandboxRegistry,
};
use std::sync::Arc;
use std::time::Duration;

fn registry(engine: &Arc<FakeEngine>, persistent: bool) -> SandboxRegistry {
    let policy = SandboxPolicy::builder()
        .image("ubuntu")
        .persistent(persistent)
        .hostname("sandbox")
        .build()
        .unwrap();
    SandboxRegistry::with_naming(engine.clone(), policy, SandboxNaming::with_pid(7))
}

#[tokio::test]
async fn test_persistent_sessions_share_sandbox() {
    let engine = FakeEngine::new();
    let registry = registry(&engine, true);

    let first = registry.resolve("alice").await.unwrap();
    let second = registry.resolve("alice").await.unwrap();

    assert_eq!(first, second);
    assert!(matches!(first, ResolvedSandbox::Persistent(_)));
    assert_eq!(engine.creates(), 1);
    assert_eq!(registry.tracked(), vec![first.id()]);
}

#[tokio::test]
async fn test_concurrent_first_sessions_create_once() {
    let engine = FakeEngine::new();
    engine.set_delay(Duration::from_millis(50));
    let registry = Arc::new(registry(&engine, true));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("alice").await.unwrap() })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().id());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(engine.creates(), 1);
}

#[tokio::test]
async fn test_identities_get_their_own_sandbox() {
    let engine = FakeEngine::new();
    let registry = registry(&engine, true);

    let alice = registry.resolve("alice").await.unwrap();
    let bob = registry.resolve("bob").await.unwrap();

    assert_ne!(alice.id(), bob.id());
    assert_eq!(engine.creates(), 2);
}

#[tokio::test]
async fn test_ephemeral_sessions_are_distinct() {
    let engine = FakeEngine::new();
    let registry = registry(&engine, false);

    let first = registry.resolve("alice").await.unwrap();
    let second = registry.resolve("alice").await.unwrap();

    assert!(first.is_ephemeral());
    assert_ne!(first.id(), second.id());
    assert!(first.id().as_str().starts_with("corral-7-alice-"));
    assert_eq!(engine.creates(), 0);
    assert!(registry.tracked().is_empty());
}

#[tokio::test]
async fn test_failed_create_is_retried() {
    let engine = FakeEngine::new();
    engine.fail_next_creates(1);
    let registry = registry(&engine, true);

    let err = registry.resolve("alice").await.unwrap_err();
    assert!(matches!(err, CoreError::SandboxCreateFailed { .. }));
    assert!(registry.tracked().is_empty());

    // The failed create's leftover was removed, so the name is free again.
    assert_eq!(engine.removes(), vec![vec![SandboxId::new("corral-7-alice")]]);
    assert!(engine.containers().is_empty());

    let resolved = registry.resolve("alice").await.unwrap();
    assert!(matches!(resolved, ResolvedSandbox::Persistent(_)));
    assert_eq!(engine.creates(), 2);
    assert_eq!(engine.containers(), vec!["corral-7-alice".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_create_timeout() {
    let engine = FakeEngine::new();
    engine.set_delay(Duration::from_secs(120));
    let policy = SandboxPolicy::builder()
        .persistent(true)
        .create_timeout(Duration::from_secs(60))
        .hostname("sandbox")
        .build()
        .unwrap();
    let registry =
        SandboxRegistry::with_naming(engine.clone(), policy, SandboxNaming::with_pid(9));

    match registry.resolve("alice").await {
        Err(CoreError::SandboxCreateFailed { output }) => assert!(output.contains("timed out")),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(registry.tracked().is_empty());
    assert!(engine.containers().is_empty());

    // A retry is not blocked by the abandoned create.
    engine.set_delay(Duration::ZERO);
    let resolved = registry.resolve("alice").await.unwrap();
    assert_eq!(registry.tracked(), vec![resolved.id()]);
    assert_eq!(engine.containers(), vec!["corral-9-alice".to_string()]);
}

#[tokio::test]
async fn test_shell_command_targets() {
    let engine = FakeEngine::new();
    let persistent = registry(&engine, true);
    let sandbox = persistent.resolve("alice").await.unwrap();
    let cmd = persistent.shell_command(&sandbox, "alice").unwrap();
    assert_eq!(cmd.args[0], format!("exec:{}", sandbox.id()));
    assert!(cmd.args[1].starts_with("user='alice'"));

    let ephemeral = registry(&engine, false);
    let sandbox = ephemeral.resolve("bob").await.unwrap();
    let cmd = ephemeral.shell_command(&sandbox, "bob").unwrap();
    assert_eq!(cmd.args[0], format!("run:{}", sandbox.id()));

    let err = ephemeral.shell_command(&sandbox, "--command=id").unwrap_err();
    assert!(matches!(err, CoreError::InvalidIdentity(_)));
}

#[tokio::test]
async fn test_destroy_all_issues_single_remove() {
    let engine = FakeEngine::new();
    let registry = registry(&engine, true);
    let alice = registry.resolve("alice").await.unwrap().id();
    let bob = registry.resolve("bob").await.unwrap().id();

    registry.destroy_all().await.unwrap();

    let removes = engine.removes();
    assert_eq!(removes.len(), 1);
    let mut removed = removes[0].clone();
    removed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    let mut expected = vec![alice, bob];
    expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(removed, expected);
    assert!(registry.tracked().is_empty());

    // Nothing left to remove.
    registry.destroy_all().await.unwrap();
    assert_eq!(engine.removes().len(), 1);
}

#[tokio::test]
async fn test_shutdown_reports_engine_failure() {
    let engine = FakeEngine::new();
    engine.fail_removes();
    let registry = registry(&engine, true);
    registry.resolve("alice").await.unwrap();

    let err = registry.shutdown().await.unwrap_err();
    assert!(matches!(err, CoreError::SandboxRemoveFailed { .. }));
    assert_eq!(engine.removes().len(), 1);
    assert!(registry.tracked().is_empty());
}
