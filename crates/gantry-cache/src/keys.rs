//! Cache key builders.
//!
//! Keys are dot separated so they are valid NATS KV keys as well.

use gantry_core::dispatch::DispatchType;
use gantry_core::ids::{AgentId, BuildId, ContainerId, PipelineId};

/// Counter of ephemeral jobs created for one build and pod selector.
pub fn job_quota(dispatch_type: DispatchType, build_id: BuildId, pod_selector: &str) -> String {
    format!(
        "dispatch.{}.jobs.{}.{}",
        dispatch_type.as_str(),
        sanitize_key(&build_id.to_string()),
        sanitize_key(pod_selector)
    )
}

/// Builder name of the last debug session a user opened on a job slot.
pub fn debug_builder(
    dispatch_type: DispatchType,
    user: &str,
    pipeline_id: &PipelineId,
    vm_seq_id: &str,
) -> String {
    format!(
        "dispatch.{}.debug.{}.{}.{}",
        dispatch_type.as_str(),
        sanitize_key(user),
        sanitize_key(pipeline_id.as_str()),
        sanitize_key(vm_seq_id)
    )
}

/// Liveness marker refreshed on every agent heartbeat.
pub fn agent_heartbeat(agent_id: AgentId) -> String {
    format!("agent.heartbeat.{}", sanitize_key(&agent_id.to_string()))
}

/// Mutual exclusion for operations on one container of a build.
pub fn container_lock(build_id: BuildId, container_id: &ContainerId) -> String {
    format!(
        "lock.container.{}.{}",
        sanitize_key(&build_id.to_string()),
        sanitize_key(container_id.as_str())
    )
}

/// Replace characters NATS KV rejects in a key segment.
pub fn sanitize_key(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '=' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("app=web,tier=1"), "app=web_tier_1");
        assert_eq!(sanitize_key("my/cache.key"), "my_cache_key");
        assert_eq!(sanitize_key("user@corp"), "user_corp");
    }

    #[test]
    fn test_job_quota_key() {
        let build_id = BuildId::new();
        let key = job_quota(DispatchType::Kubernetes, build_id, "app.web");
        assert!(key.starts_with("dispatch.kubernetes.jobs.b_"));
        assert!(key.ends_with(".app_web"));
    }

    #[test]
    fn test_keys_are_scoped() {
        let pipeline = PipelineId::new("p-1");
        let a = debug_builder(DispatchType::Kubernetes, "alice", &pipeline, "1");
        let b = debug_builder(DispatchType::Bcs, "alice", &pipeline, "1");
        assert_ne!(a, b);
        assert_eq!(a, "dispatch.kubernetes.debug.alice.p-1.1");
    }
}
