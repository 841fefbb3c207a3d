//! Permission service backed by the configured operator list.

use async_trait::async_trait;
use gantry_core::agent::Node;
use gantry_core::ids::{NodeId, ProjectId};
use gantry_core::ports::{AuthAction, AuthResource, PermissionService};
use gantry_core::Result;
use std::collections::HashSet;
use tracing::{debug, info};

/// Operators hold API-operate permission everywhere; every other action is
/// open to any user of the CLI.
pub struct StaticPermissions {
    operators: HashSet<String>,
}

impl StaticPermissions {
    pub fn new(operators: impl IntoIterator<Item = String>) -> Self {
        Self {
            operators: operators.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PermissionService for StaticPermissions {
    async fn check_permission(
        &self,
        user: &str,
        project_id: &ProjectId,
        resource: &AuthResource,
        action: AuthAction,
    ) -> Result<bool> {
        let allowed = match action {
            AuthAction::ApiOperate => self.operators.contains(user),
            AuthAction::Create | AuthAction::Edit | AuthAction::Delete => true,
        };
        debug!(user, project_id = %project_id, ?resource, ?action, allowed, "Permission checked");
        Ok(allowed)
    }

    async fn grant_node(&self, user: &str, project_id: &ProjectId, node: &Node) -> Result<()> {
        info!(user, project_id = %project_id, node = %node.node_string_id, ip = %node.ip, "Node registered");
        Ok(())
    }

    async fn revoke_node(&self, project_id: &ProjectId, node_id: NodeId) -> Result<()> {
        info!(project_id = %project_id, node_id = %node_id, "Node unregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_operators_may_operate() {
        let permissions = StaticPermissions::new(vec!["alice".to_string()]);
        let project = ProjectId::new("proj");
        assert!(permissions
            .check_permission("alice", &project, &AuthResource::Project, AuthAction::ApiOperate)
            .await
            .unwrap());
        assert!(!permissions
            .check_permission("bob", &project, &AuthResource::Project, AuthAction::ApiOperate)
            .await
            .unwrap());
        assert!(permissions
            .check_permission("bob", &project, &AuthResource::Project, AuthAction::Create)
            .await
            .unwrap());
    }
}
