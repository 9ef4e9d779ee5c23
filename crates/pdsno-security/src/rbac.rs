// crates/pdsno-security/src/rbac.rs
// ============================================================================
// Module: Role-Based Access Control
// Description: Role catalogue, permissions with conditions, and checks.
// Purpose: Decide which entity may perform which action on which resource.
// Dependencies: serde, tracing
// ============================================================================

//! ## Overview
//! RBAC maps an entity id to a role; a role holds `(resource, action,
//! conditions)` permissions. `check_permission` grants when any permission
//! matches the request and every condition (e.g. `sensitivity=HIGH`,
//! `region=zone-A`) is satisfied by the supplied context. The default
//! catalogue encodes the approval authority table (local auto-approves LOW,
//! regional approves up to MEDIUM, global approves everything), the core
//! controller rights, and read-only profiles for viewers and API clients.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

// ============================================================================
// SECTION: Vocabulary
// ============================================================================

/// System roles assignable to controllers, operators, and API clients.
///
/// # Invariants
/// - Wire labels are stable for serialization and audit details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Root-of-trust controller.
    GlobalController,
    /// Zone-level controller.
    RegionalController,
    /// Subnet-level controller.
    LocalController,
    /// Human administrator with full rights.
    GlobalAdmin,
    /// Human administrator scoped to a region.
    RegionalAdmin,
    /// Human operator scoped to a subnet.
    LocalOperator,
    /// Read-only human profile.
    Viewer,
    /// External API client with limited write access.
    ApiClient,
    /// External API client with read-only access.
    ApiClientReadOnly,
}

/// Resources guarded by RBAC.
///
/// # Invariants
/// - Wire labels are stable for serialization and audit details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// Configuration records.
    Config,
    /// Device records.
    Device,
    /// Controller identities.
    Controller,
    /// The audit log.
    AuditLog,
    /// Approval requests.
    Approval,
    /// Execution tokens.
    ExecutionToken,
    /// Configuration backups.
    Backup,
    /// Discovery reports.
    DiscoveryReport,
    /// Shared-secret key material.
    KeyMaterial,
    /// Operator accounts.
    UserAccount,
}

/// Actions on resources.
///
/// # Invariants
/// - Wire labels are stable for serialization and audit details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a new record.
    Create,
    /// Read an existing record.
    Read,
    /// Mutate an existing record.
    Update,
    /// Remove a record.
    Delete,
    /// Approve a pending request.
    Approve,
    /// Reject a pending request.
    Reject,
    /// Execute an approved configuration.
    Execute,
    /// Roll a configuration back.
    Rollback,
    /// Validate a candidate controller.
    Validate,
}

// ============================================================================
// SECTION: Permissions
// ============================================================================

/// One grant: an action on a resource, optionally gated by conditions.
///
/// # Invariants
/// - All conditions must be satisfied by the request context for a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Guarded resource.
    pub resource: Resource,
    /// Permitted action.
    pub action: Action,
    /// Context requirements that must all hold.
    #[serde(default)]
    pub conditions: Option<BTreeMap<String, String>>,
}

impl Permission {
    /// Creates an unconditional permission.
    #[must_use]
    pub const fn unconditional(resource: Resource, action: Action) -> Self {
        Self {
            resource,
            action,
            conditions: None,
        }
    }

    /// Creates a permission with a single condition.
    #[must_use]
    pub fn with_condition(
        resource: Resource,
        action: Action,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let mut conditions = BTreeMap::new();
        conditions.insert(key.into(), value.into());
        Self {
            resource,
            action,
            conditions: Some(conditions),
        }
    }

    /// Returns true when this permission covers the requested access.
    #[must_use]
    pub fn matches(
        &self,
        resource: Resource,
        action: Action,
        context: Option<&BTreeMap<String, String>>,
    ) -> bool {
        if self.resource != resource || self.action != action {
            return false;
        }
        match &self.conditions {
            None => true,
            Some(conditions) => conditions.iter().all(|(key, value)| {
                context.is_some_and(|ctx| ctx.get(key).is_some_and(|have| have == value))
            }),
        }
    }
}

/// A role with its description and permission list.
#[derive(Debug, Clone)]
pub struct RoleDefinition {
    /// Role being defined.
    pub role: Role,
    /// Human-readable description.
    pub description: String,
    /// Granted permissions.
    pub permissions: Vec<Permission>,
}

impl RoleDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(role: Role, description: impl Into<String>) -> Self {
        Self {
            role,
            description: description.into(),
            permissions: Vec::new(),
        }
    }

    /// Appends a permission.
    pub fn grant(&mut self, permission: Permission) {
        self.permissions.push(permission);
    }

    /// Returns true when any permission covers the requested access.
    #[must_use]
    pub fn has_permission(
        &self,
        resource: Resource,
        action: Action,
        context: Option<&BTreeMap<String, String>>,
    ) -> bool {
        self.permissions.iter().any(|permission| permission.matches(resource, action, context))
    }
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// RBAC catalogue plus entity-to-role assignments.
///
/// # Invariants
/// - An entity without an assignment is denied everything.
pub struct RbacManager {
    /// Role catalogue.
    roles: HashMap<Role, RoleDefinition>,
    /// Entity assignments.
    assignments: Mutex<HashMap<String, Role>>,
}

impl Default for RbacManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RbacManager {
    /// Creates a manager with the default role catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            roles: default_catalogue(),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Assigns a role to an entity, replacing any previous assignment.
    pub fn assign_role(&self, entity_id: &str, role: Role) {
        if let Some(mut assignments) = self.guard() {
            assignments.insert(entity_id.to_string(), role);
            debug!(entity_id, ?role, "assigned role");
        }
    }

    /// Returns the entity's role, if assigned.
    #[must_use]
    pub fn get_role(&self, entity_id: &str) -> Option<Role> {
        self.guard().and_then(|assignments| assignments.get(entity_id).copied())
    }

    /// Checks whether an entity may perform an action on a resource under a
    /// context.
    #[must_use]
    pub fn check_permission(
        &self,
        entity_id: &str,
        resource: Resource,
        action: Action,
        context: Option<&BTreeMap<String, String>>,
    ) -> bool {
        let Some(role) = self.get_role(entity_id) else {
            warn!(entity_id, "permission check for unassigned entity");
            return false;
        };
        let Some(definition) = self.roles.get(&role) else {
            return false;
        };
        let granted = definition.has_permission(resource, action, context);
        if granted {
            debug!(entity_id, ?resource, ?action, "permission granted");
        } else {
            warn!(entity_id, ?resource, ?action, "permission denied");
        }
        granted
    }

    /// Returns the permissions of an entity's role (empty when unassigned).
    #[must_use]
    pub fn permissions_for(&self, entity_id: &str) -> Vec<Permission> {
        self.get_role(entity_id)
            .and_then(|role| self.roles.get(&role))
            .map(|definition| definition.permissions.clone())
            .unwrap_or_default()
    }

    /// Acquires the assignment mutex; `None` only on poisoning.
    fn guard(&self) -> Option<MutexGuard<'_, HashMap<String, Role>>> {
        self.assignments.lock().ok()
    }
}

/// Builds the default role catalogue.
fn default_catalogue() -> HashMap<Role, RoleDefinition> {
    let mut roles = HashMap::new();

    let mut gc = RoleDefinition::new(Role::GlobalController, "Global Controller");
    gc.grant(Permission::unconditional(Resource::Controller, Action::Validate));
    for tier in ["LOW", "MEDIUM", "HIGH"] {
        gc.grant(Permission::with_condition(Resource::Config, Action::Approve, "sensitivity", tier));
        gc.grant(Permission::with_condition(Resource::Config, Action::Reject, "sensitivity", tier));
    }
    gc.grant(Permission::unconditional(Resource::ExecutionToken, Action::Create));
    gc.grant(Permission::unconditional(Resource::AuditLog, Action::Read));
    gc.grant(Permission::unconditional(Resource::Device, Action::Read));
    gc.grant(Permission::unconditional(Resource::KeyMaterial, Action::Create));
    gc.grant(Permission::unconditional(Resource::KeyMaterial, Action::Read));
    roles.insert(Role::GlobalController, gc);

    let mut rc = RoleDefinition::new(Role::RegionalController, "Regional Controller");
    rc.grant(Permission::unconditional(Resource::Controller, Action::Validate));
    for tier in ["LOW", "MEDIUM"] {
        rc.grant(Permission::with_condition(Resource::Config, Action::Approve, "sensitivity", tier));
        rc.grant(Permission::with_condition(Resource::Config, Action::Reject, "sensitivity", tier));
    }
    rc.grant(Permission::unconditional(Resource::ExecutionToken, Action::Create));
    rc.grant(Permission::unconditional(Resource::AuditLog, Action::Read));
    rc.grant(Permission::unconditional(Resource::Device, Action::Read));
    rc.grant(Permission::unconditional(Resource::DiscoveryReport, Action::Read));
    roles.insert(Role::RegionalController, rc);

    let mut lc = RoleDefinition::new(Role::LocalController, "Local Controller");
    lc.grant(Permission::unconditional(Resource::Config, Action::Create));
    lc.grant(Permission::with_condition(Resource::Config, Action::Approve, "sensitivity", "LOW"));
    lc.grant(Permission::unconditional(Resource::Config, Action::Execute));
    lc.grant(Permission::unconditional(Resource::Config, Action::Rollback));
    lc.grant(Permission::unconditional(Resource::Backup, Action::Create));
    lc.grant(Permission::unconditional(Resource::Backup, Action::Read));
    lc.grant(Permission::unconditional(Resource::DiscoveryReport, Action::Create));
    lc.grant(Permission::unconditional(Resource::Device, Action::Read));
    lc.grant(Permission::unconditional(Resource::Device, Action::Update));
    roles.insert(Role::LocalController, lc);

    let mut ga = RoleDefinition::new(Role::GlobalAdmin, "Global Administrator");
    for resource in [
        Resource::Config,
        Resource::Device,
        Resource::Controller,
        Resource::AuditLog,
        Resource::Approval,
        Resource::ExecutionToken,
        Resource::Backup,
        Resource::DiscoveryReport,
        Resource::KeyMaterial,
        Resource::UserAccount,
    ] {
        for action in [
            Action::Create,
            Action::Read,
            Action::Update,
            Action::Delete,
            Action::Approve,
            Action::Reject,
            Action::Execute,
            Action::Rollback,
            Action::Validate,
        ] {
            ga.grant(Permission::unconditional(resource, action));
        }
    }
    roles.insert(Role::GlobalAdmin, ga);

    let mut ra = RoleDefinition::new(Role::RegionalAdmin, "Regional Administrator");
    ra.grant(Permission::unconditional(Resource::Config, Action::Create));
    ra.grant(Permission::unconditional(Resource::Config, Action::Read));
    for tier in ["LOW", "MEDIUM"] {
        ra.grant(Permission::with_condition(Resource::Config, Action::Approve, "sensitivity", tier));
    }
    ra.grant(Permission::unconditional(Resource::AuditLog, Action::Read));
    ra.grant(Permission::unconditional(Resource::Device, Action::Read));
    ra.grant(Permission::unconditional(Resource::Device, Action::Update));
    ra.grant(Permission::unconditional(Resource::Controller, Action::Read));
    ra.grant(Permission::unconditional(Resource::Backup, Action::Create));
    ra.grant(Permission::unconditional(Resource::Backup, Action::Read));
    roles.insert(Role::RegionalAdmin, ra);

    let mut lo = RoleDefinition::new(Role::LocalOperator, "Local Operator");
    lo.grant(Permission::with_condition(Resource::Config, Action::Create, "sensitivity", "LOW"));
    lo.grant(Permission::unconditional(Resource::Config, Action::Read));
    lo.grant(Permission::unconditional(Resource::Device, Action::Read));
    lo.grant(Permission::unconditional(Resource::AuditLog, Action::Read));
    roles.insert(Role::LocalOperator, lo);

    let mut viewer = RoleDefinition::new(Role::Viewer, "Read-Only Viewer");
    for resource in [Resource::Config, Resource::Device, Resource::AuditLog, Resource::Controller] {
        viewer.grant(Permission::unconditional(resource, Action::Read));
    }
    roles.insert(Role::Viewer, viewer);

    let mut api = RoleDefinition::new(Role::ApiClient, "External API Client");
    api.grant(Permission::unconditional(Resource::Config, Action::Create));
    api.grant(Permission::unconditional(Resource::Config, Action::Read));
    api.grant(Permission::unconditional(Resource::Device, Action::Read));
    api.grant(Permission::unconditional(Resource::AuditLog, Action::Read));
    roles.insert(Role::ApiClient, api);

    let mut api_ro = RoleDefinition::new(Role::ApiClientReadOnly, "Read-Only API Client");
    for resource in [Resource::Config, Resource::Device, Resource::AuditLog] {
        api_ro.grant(Permission::unconditional(resource, Action::Read));
    }
    roles.insert(Role::ApiClientReadOnly, api_ro);

    roles
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::Action;
    use super::RbacManager;
    use super::Resource;
    use super::Role;

    fn context(key: &str, value: &str) -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        ctx.insert(key.to_string(), value.to_string());
        ctx
    }

    #[test]
    fn catalogue_encodes_the_approval_authority_table() {
        let rbac = RbacManager::new();
        rbac.assign_role("global_cntl_1", Role::GlobalController);
        rbac.assign_role("regional_cntl_zone-A_1", Role::RegionalController);
        rbac.assign_role("local_cntl_zone-A_1", Role::LocalController);

        let high = context("sensitivity", "HIGH");
        let medium = context("sensitivity", "MEDIUM");
        let low = context("sensitivity", "LOW");

        assert!(rbac.check_permission("global_cntl_1", Resource::Config, Action::Approve, Some(&high)));
        assert!(rbac.check_permission("regional_cntl_zone-A_1", Resource::Config, Action::Approve, Some(&medium)));
        assert!(!rbac.check_permission("regional_cntl_zone-A_1", Resource::Config, Action::Approve, Some(&high)));
        assert!(rbac.check_permission("local_cntl_zone-A_1", Resource::Config, Action::Approve, Some(&low)));
        assert!(!rbac.check_permission("local_cntl_zone-A_1", Resource::Config, Action::Approve, Some(&medium)));
    }

    #[test]
    fn conditional_permission_requires_a_context() {
        let rbac = RbacManager::new();
        rbac.assign_role("regional_cntl_zone-A_1", Role::RegionalController);
        assert!(!rbac.check_permission(
            "regional_cntl_zone-A_1",
            Resource::Config,
            Action::Approve,
            None
        ));
    }

    #[test]
    fn unassigned_entities_are_denied() {
        let rbac = RbacManager::new();
        assert!(!rbac.check_permission("stranger", Resource::Device, Action::Read, None));
        assert!(rbac.permissions_for("stranger").is_empty());
    }

    #[test]
    fn viewers_read_but_never_write() {
        let rbac = RbacManager::new();
        rbac.assign_role("auditor-1", Role::Viewer);
        assert!(rbac.check_permission("auditor-1", Resource::AuditLog, Action::Read, None));
        assert!(!rbac.check_permission("auditor-1", Resource::Config, Action::Create, None));
    }
}
