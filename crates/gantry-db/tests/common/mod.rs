//! Build graph fixtures shared by the storage tests.

#![allow(dead_code)]

use gantry_core::agent::{Agent, AgentStatus, Node, NodeStatus, Os};
use gantry_core::build::{Build, BuildContainer, BuildGraph, BuildStage, JobControlOptions, StageControlOptions};
use gantry_core::ids::*;
use gantry_core::task::{infra, BuildTask, TaskKind, TaskOptions};
use gantry_core::BuildStatus;
use chrono::Utc;
use std::collections::HashMap;

pub const CONTAINER: &str = "c-1";

pub fn task(build_id: BuildId, id: &str, name: &str, seq: u32) -> BuildTask {
    BuildTask {
        project_id: ProjectId::new("proj"),
        pipeline_id: PipelineId::new("p-1"),
        build_id,
        stage_id: StageId::new("s-1"),
        container_id: ContainerId::new(CONTAINER),
        task_id: TaskId::new(id),
        step_id: None,
        task_name: name.to_string(),
        task_seq: seq,
        kind: TaskKind::Normal,
        status: BuildStatus::Queue,
        execute_count: 1,
        options: TaskOptions::default(),
        post_info: None,
        start_time: None,
        end_time: None,
    }
}

/// One stage, one job: prepare VM, three user tasks, clean VM, wait.
pub fn simple_graph() -> BuildGraph {
    let build_id = BuildId::new();
    let tasks = vec![
        task(build_id, &format!("{}1", infra::START_VM_ID_PREFIX), &format!("{}1", infra::PREPARE_VM_NAME_PREFIX), 1),
        task(build_id, "t-1", "compile", 2),
        task(build_id, "t-2", "test", 3),
        task(build_id, "t-3", "package", 4),
        task(build_id, &format!("{}1", infra::STOP_VM_ID_PREFIX), &format!("{}1", infra::CLEAN_VM_NAME_PREFIX), 5),
        task(build_id, &format!("{}1", infra::END_ID_PREFIX), &format!("{}1", infra::WAIT_NAME_PREFIX), 6),
    ];
    BuildGraph {
        build: Build {
            project_id: ProjectId::new("proj"),
            pipeline_id: PipelineId::new("p-1"),
            build_id,
            execute_count: 1,
            status: BuildStatus::Running,
            variables: HashMap::from([("branch".to_string(), "main".to_string())]),
            start_time: Some(Utc::now()),
            end_time: None,
        },
        stages: vec![BuildStage {
            build_id,
            stage_id: StageId::new("s-1"),
            seq: 1,
            status: BuildStatus::Running,
            execute_count: 1,
            options: StageControlOptions::default(),
            start_time: None,
            end_time: None,
        }],
        containers: vec![BuildContainer {
            build_id,
            stage_id: StageId::new("s-1"),
            container_id: ContainerId::new(CONTAINER),
            seq: 1,
            status: BuildStatus::Running,
            execute_count: 1,
            contains_post_tasks: false,
            options: JobControlOptions::default(),
            start_time: None,
            end_time: None,
        }],
        tasks,
    }
}

pub fn agent(project: &str, user: &str) -> Agent {
    let now = Utc::now();
    Agent {
        id: AgentId::new(),
        project_id: ProjectId::new(project),
        node_id: None,
        status: AgentStatus::UnImport,
        os: Os::Linux,
        secret_key: "c2VjcmV0".to_string(),
        ip: String::new(),
        start_remote_ip: None,
        hostname: String::new(),
        master_version: None,
        version: None,
        parallel_task_count: None,
        install_path: None,
        started_user: None,
        gateway: None,
        file_gateway: None,
        envs: Vec::new(),
        created_user: user.to_string(),
        created_at: now,
        updated_at: now,
    }
}

pub fn node(project: &str, agent: &Agent) -> Node {
    Node {
        id: NodeId::new(),
        project_id: ProjectId::new(project),
        node_string_id: format!("BUILD_{}", agent.id.short()),
        display_name: "builder".to_string(),
        ip: "10.0.0.5".to_string(),
        os: agent.os,
        status: NodeStatus::Normal,
        created_user: agent.created_user.clone(),
        created_at: Utc::now(),
    }
}
