//! Conversions between structured tenant memberships and flat token claims.
//!
//! Flat maps only exist at the token boundary; everything else works with
//! [`TenantMemberships`].

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};

use crate::models::{TenantMembership, TenantMemberships};

const INVITE_CLAIM_PREFIX: &str = "role";
const CLAIM_SEPARATOR: char = ':';

/// Tenant and group ids become claim key segments, so they must be
/// non-empty and free of the separator.
pub fn is_claim_segment(id: &str) -> bool {
    !id.is_empty() && !id.contains(CLAIM_SEPARATOR)
}

/// `"<tenant>:<group>" -> [roles]` for access tokens.
pub fn tenant_data(memberships: &TenantMemberships) -> Map<String, Value> {
    flatten(memberships, None)
}

/// `"role:<tenant>:<group>" -> [roles]` for invite tokens.
pub fn invitation_claims(memberships: &TenantMemberships) -> Map<String, Value> {
    flatten(memberships, Some(INVITE_CLAIM_PREFIX))
}

fn flatten(memberships: &TenantMemberships, prefix: Option<&str>) -> Map<String, Value> {
    let mut claims = Map::new();
    for (tenant_id, membership) in memberships {
        if !is_claim_segment(tenant_id) {
            tracing::warn!(tenant = %tenant_id, "Skipping tenant id that cannot be a claim key");
            continue;
        }
        for (group_id, roles) in &membership.groups {
            if roles.is_empty() || !is_claim_segment(group_id) {
                continue;
            }
            let key = match prefix {
                Some(prefix) => format!("{}:{}:{}", prefix, tenant_id, group_id),
                None => format!("{}:{}", tenant_id, group_id),
            };
            claims.insert(
                key,
                Value::Array(roles.iter().cloned().map(Value::String).collect()),
            );
        }
    }
    claims
}

/// Rebuild memberships from invite claims. Keys that are not exactly
/// `role:<tenant>:<group>`, non-array values and non-string roles are skipped.
pub fn invitation_from_claims(claims: &Map<String, Value>) -> TenantMemberships {
    let mut memberships = TenantMemberships::new();

    for (key, value) in claims {
        let parts: Vec<&str> = key.split(CLAIM_SEPARATOR).collect();
        let [prefix, tenant_id, group_id] = parts.as_slice() else {
            continue;
        };
        if *prefix != INVITE_CLAIM_PREFIX || tenant_id.is_empty() || group_id.is_empty() {
            continue;
        }
        let Value::Array(items) = value else {
            continue;
        };
        let roles: BTreeSet<String> = items
            .iter()
            .filter_map(|item| item.as_str())
            .filter(|role| !role.is_empty())
            .map(str::to_string)
            .collect();
        if roles.is_empty() {
            continue;
        }

        memberships
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantMembership::new(*tenant_id, ""))
            .add_roles(*group_id, roles);
    }

    memberships
}

/// Restrict `requested` to what `inviter` may grant. A tenant/group survives
/// only if the inviter belongs to both and holds a management role there;
/// granted roles are the requested roles the inviter also holds.
pub fn filter_invitee_could_invite(
    inviter: &TenantMemberships,
    requested: &TenantMemberships,
    management_roles: &HashSet<String>,
) -> TenantMemberships {
    let mut granted = TenantMemberships::new();

    for (tenant_id, wanted) in requested {
        let Some(inviter_tenant) = inviter.get(tenant_id) else {
            continue;
        };

        let mut membership = TenantMembership::new(
            tenant_id.clone(),
            if wanted.tenant_name.is_empty() {
                inviter_tenant.tenant_name.clone()
            } else {
                wanted.tenant_name.clone()
            },
        );

        for (group_id, wanted_roles) in &wanted.groups {
            let Some(inviter_roles) = inviter_tenant.groups.get(group_id) else {
                continue;
            };
            if !inviter_roles.iter().any(|r| management_roles.contains(r)) {
                continue;
            }
            let roles: Vec<&String> = wanted_roles
                .iter()
                .filter(|r| inviter_roles.contains(r))
                .collect();
            if !roles.is_empty() {
                membership.add_roles(group_id.clone(), roles.into_iter().cloned());
            }
        }

        if !membership.prune() {
            granted.insert(tenant_id.clone(), membership);
        }
    }

    granted
}

/// Authority of an admin-initiated invite: every requested role in the named
/// tenant.
pub fn root_authority(
    requested: &TenantMemberships,
    management_roles: &HashSet<String>,
) -> TenantMemberships {
    let mut authority = requested.clone();
    for membership in authority.values_mut() {
        let groups: Vec<String> = membership.groups.keys().cloned().collect();
        for group in groups {
            membership.add_roles(group, management_roles.iter().cloned());
        }
    }
    authority
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Entries are `(tenant, group, "role,role")`.
    fn memberships(entries: &[(&str, &str, &str)]) -> TenantMemberships {
        let mut out = TenantMemberships::new();
        for (tenant, group, roles) in entries {
            out.entry(tenant.to_string())
                .or_insert_with(|| TenantMembership::new(*tenant, ""))
                .add_roles(*group, roles.split(','));
        }
        out
    }

    fn admin_only() -> HashSet<String> {
        HashSet::from(["admin".to_string()])
    }

    #[test]
    fn test_tenant_data_keys() {
        let m = memberships(&[("t1", "g1", "admin,guest")]);
        let claims = tenant_data(&m);
        assert_eq!(claims["t1:g1"], serde_json::json!(["admin", "guest"]));

        let invite = invitation_claims(&m);
        assert_eq!(invite["role:t1:g1"], serde_json::json!(["admin", "guest"]));
    }

    #[test]
    fn test_invitation_from_claims_skips_malformed() {
        let claims = serde_json::json!({
            "role:t1:g1": ["admin", "admin", 7],
            "role:t1:g1:extra": ["x"],
            "role::g1": ["x"],
            "t2:g2": ["x"],
            "role:t3:g3": "admin",
            "email": "someone@example.com"
        });
        let Value::Object(claims) = claims else {
            unreachable!()
        };
        let m = invitation_from_claims(&claims);
        assert_eq!(m.len(), 1);
        assert_eq!(m["t1"].roles_in("g1"), ["admin"]);
    }

    #[test]
    fn test_claim_segments_reject_separator() {
        assert!(is_claim_segment("acme"));
        assert!(!is_claim_segment(""));
        assert!(!is_claim_segment("ac:me"));

        let m = memberships(&[
            ("ac:me", "g1", "admin"),
            ("t1", "g:1", "admin"),
            ("t1", "g2", "guest"),
        ]);
        let claims = invitation_claims(&m);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims["role:t1:g2"], serde_json::json!(["guest"]));
        assert_eq!(tenant_data(&m).len(), 1);
    }

    #[test]
    fn test_filter_drops_tenants_inviter_lacks() {
        let inviter = memberships(&[("tenant1", "group1", "admin,guest")]);
        let requested = memberships(&[
            ("tenant1", "group1", "admin,guest"),
            ("tenant2", "group1", "admin"),
        ]);

        let granted = filter_invitee_could_invite(&inviter, &requested, &admin_only());
        assert_eq!(granted, memberships(&[("tenant1", "group1", "admin,guest")]));
    }

    #[test]
    fn test_filter_requires_management_role() {
        let inviter = memberships(&[("t1", "g1", "guest"), ("t1", "g2", "admin")]);
        let requested = memberships(&[("t1", "g1", "guest"), ("t1", "g2", "owner")]);

        let granted = filter_invitee_could_invite(&inviter, &requested, &admin_only());
        assert!(granted.is_empty());
    }

    #[test]
    fn test_root_authority_grants_requested_roles() {
        let requested = memberships(&[("t1", "g1", "guest")]);
        let authority = root_authority(&requested, &admin_only());
        let granted = filter_invitee_could_invite(&authority, &requested, &admin_only());
        assert_eq!(granted, requested);
    }

    fn arb_memberships() -> impl Strategy<Value = TenantMemberships> {
        let name = "[a-z0-9]{1,6}";
        prop::collection::btree_map(
            name,
            prop::collection::btree_map(name, prop::collection::vec(name, 1..4), 1..4),
            0..4,
        )
        .prop_map(|tenants| {
            tenants
                .into_iter()
                .map(|(tenant_id, groups)| {
                    let mut m = TenantMembership::new(tenant_id.clone(), "");
                    for (group, roles) in groups {
                        m.add_roles(group, roles);
                    }
                    (tenant_id, m)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_invitation_claims_round_trip(m in arb_memberships()) {
            prop_assert_eq!(invitation_from_claims(&invitation_claims(&m)), m);
        }

        #[test]
        fn prop_grant_is_subset_of_request(
            inviter in arb_memberships(),
            requested in arb_memberships(),
        ) {
            let management = HashSet::from(["admin".to_string(), "owner".to_string()]);
            let granted = filter_invitee_could_invite(&inviter, &requested, &management);

            for (tenant_id, membership) in &granted {
                let wanted = &requested[tenant_id];
                let held = &inviter[tenant_id];
                for (group_id, roles) in &membership.groups {
                    prop_assert!(!roles.is_empty());
                    let held_roles = held.roles_in(group_id);
                    prop_assert!(held_roles.iter().any(|r| management.contains(r)));
                    for role in roles {
                        prop_assert!(wanted.roles_in(group_id).contains(role));
                        prop_assert!(held_roles.contains(role));
                    }
                }
            }
        }
    }
}
