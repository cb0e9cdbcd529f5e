#![allow(clippy::unwrap_used, clippy::expect_used)]

use flotilla_core::*;
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// 1. Identifiers are usable as ordered map keys and survive JSON
// ---------------------------------------------------------------------------

#[test]
fn identifiers_order_and_roundtrip() {
    let ids: BTreeSet<TaskId> = (0..16).map(|_| TaskId::new()).collect();
    assert_eq!(ids.len(), 16);

    let json = serde_json::to_string(&ids).unwrap();
    let back: BTreeSet<TaskId> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, ids);
}

// ---------------------------------------------------------------------------
// 2. Error conversions from serde_json and std::io
// ---------------------------------------------------------------------------

#[test]
fn error_from_conversions() {
    let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
    let err: FlotillaError = json_err.into();
    assert!(matches!(err, FlotillaError::Json(_)));
    assert!(err.to_string().starts_with("JSON error"));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: FlotillaError = io_err.into();
    assert!(matches!(err, FlotillaError::Io(_)));
}

// ---------------------------------------------------------------------------
// 3. Caller-visible taxonomy keeps the identifiers in the message
// ---------------------------------------------------------------------------

#[test]
fn taxonomy_messages_name_the_subject() {
    let task = TaskId::new();
    let dependency = TaskId::new();

    let err = FlotillaError::InvalidDependency {
        task,
        dependency,
        reason: "unknown task".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains(&task.to_string()));
    assert!(msg.contains(&dependency.to_string()));

    let err = FlotillaError::DependencyCycle { task };
    assert!(err.to_string().contains(&task.to_string()));

    let agent = AgentId::new();
    let err = FlotillaError::AgentUnhealthy(agent);
    assert!(err.to_string().contains(&agent.to_string()));
}
