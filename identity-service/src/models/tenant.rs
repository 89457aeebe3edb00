use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// group id -> roles
pub type GroupRoles = BTreeMap<String, Vec<String>>;

/// A user's roles inside one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMembership {
    pub tenant_id: String,
    #[serde(default)]
    pub tenant_name: String,
    #[serde(default)]
    pub groups: GroupRoles,
}

/// tenant id -> membership
pub type TenantMemberships = BTreeMap<String, TenantMembership>;

impl TenantMembership {
    pub fn new(tenant_id: impl Into<String>, tenant_name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tenant_name: tenant_name.into(),
            groups: GroupRoles::new(),
        }
    }

    pub fn with_group<I, S>(mut self, group_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_roles(group_id, roles);
        self
    }

    /// Union `roles` into `group_id`, keeping roles sorted and unique.
    pub fn add_roles<I, S>(&mut self, group_id: impl Into<String>, roles: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.groups.entry(group_id.into()).or_default();
        entry.extend(roles.into_iter().map(Into::into));
        entry.sort();
        entry.dedup();
    }

    pub fn roles_in(&self, group_id: &str) -> &[String] {
        self.groups.get(group_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drop groups without roles. Returns true when nothing is left.
    pub fn prune(&mut self) -> bool {
        self.groups.retain(|_, roles| !roles.is_empty());
        self.groups.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }
}

/// Merge `incoming` into `target`, unioning roles per group.
pub fn merge_memberships(target: &mut TenantMemberships, incoming: &TenantMemberships) {
    for (tenant_id, membership) in incoming {
        let entry = target
            .entry(tenant_id.clone())
            .or_insert_with(|| TenantMembership::new(tenant_id.clone(), ""));
        if entry.tenant_name.is_empty() {
            entry.tenant_name = membership.tenant_name.clone();
        }
        for (group_id, roles) in &membership.groups {
            entry.add_roles(group_id.clone(), roles.iter().cloned());
        }
    }
    target.retain(|_, m| !m.prune());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_roles_dedups() {
        let m = TenantMembership::new("t1", "Tenant")
            .with_group("g1", ["guest", "admin"])
            .with_group("g1", ["admin"]);
        assert_eq!(m.roles_in("g1"), ["admin", "guest"]);
        assert!(m.roles_in("missing").is_empty());
    }

    #[test]
    fn test_merge_prunes_empty_groups() {
        let mut target = TenantMemberships::new();
        let mut incoming = TenantMemberships::new();
        incoming.insert(
            "t1".to_string(),
            TenantMembership::new("t1", "One").with_group("g1", ["admin"]),
        );
        incoming.insert(
            "t2".to_string(),
            TenantMembership::new("t2", "Two").with_group("g2", Vec::<String>::new()),
        );

        merge_memberships(&mut target, &incoming);

        assert_eq!(target.len(), 1);
        assert_eq!(target["t1"].tenant_name, "One");
        assert_eq!(target["t1"].roles_in("g1"), ["admin"]);
    }
}
