//! Serialization tests for the wire shapes shared with outer layers.

use gantry_core::agent::{AgentStatus, HeartbeatInfo, HeartbeatResponse};
use gantry_core::build::{JobControlOptions, JobRunCondition};
use gantry_core::record::{RecordTimestamp, TimestampType, Timestamps};
use gantry_core::task::{NameAndValue, TaskKind, TaskOptions, TaskRunCondition};
use gantry_core::BuildStatus;
use pretty_assertions::assert_eq;
use std::collections::HashMap;

#[test]
fn test_status_serialization() {
    let json = serde_json::to_string(&BuildStatus::Unexec).unwrap();
    assert_eq!(json, "\"UNEXEC\"");
    let parsed: BuildStatus = serde_json::from_str("\"REVIEWING\"").unwrap();
    assert_eq!(parsed, BuildStatus::Reviewing);
}

#[test]
fn test_task_options_deserialization() {
    let json = r#"{
        "run_condition": "CUSTOM_VARIABLE_MATCH_NOT_RUN",
        "custom_variables": [{"key": "branch", "value": "${target}"}],
        "retry_when_failed": true,
        "retry_count": 9
    }"#;
    let opts: TaskOptions = serde_json::from_str(json).unwrap();
    assert!(opts.enable);
    assert_eq!(opts.run_condition, TaskRunCondition::CustomVariableMatchNotRun);
    assert_eq!(opts.custom_variables, vec![NameAndValue::new("branch", "${target}")]);
    assert_eq!(opts.retry_count, 9);
}

#[test]
fn test_task_kind_tagging() {
    let kind = TaskKind::ManualReview {
        review_users: vec!["${owners}".to_string()],
    };
    let json = serde_json::to_value(&kind).unwrap();
    assert_eq!(json["kind"], "manual_review");
    let back: TaskKind = serde_json::from_value(json).unwrap();
    assert_eq!(back, kind);
}

#[test]
fn test_job_options_default() {
    let opts: JobControlOptions = serde_json::from_str("{}").unwrap();
    assert!(opts.enable);
    assert_eq!(opts.run_condition, JobRunCondition::StageRunning);
    assert!(opts.custom_variables.is_empty());
}

#[test]
fn test_timestamps_keyed_by_name() {
    let mut ts: Timestamps = HashMap::new();
    ts.insert(TimestampType::TaskReviewPauseWaiting, RecordTimestamp::default());
    let json = serde_json::to_value(&ts).unwrap();
    assert!(json.get("TASK_REVIEW_PAUSE_WAITING").is_some());
}

#[test]
fn test_heartbeat_shapes() {
    let info: HeartbeatInfo = serde_json::from_str(r#"{"agent_ip": "10.0.0.1"}"#).unwrap();
    assert_eq!(info.agent_ip.as_deref(), Some("10.0.0.1"));
    assert_eq!(info.version, None);

    let response = HeartbeatResponse {
        master_version: "v2".into(),
        worker_version: "w2".into(),
        agent_status: AgentStatus::Delete,
        parallel_task_count: -1,
        envs: HashMap::new(),
        gateway: None,
        file_gateway: None,
    };
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["agent_status"], "DELETE");
    assert_eq!(json["parallel_task_count"], -1);
}
