use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use displaydoc::Display;
use thiserror::Error;
use tracing::debug;

use super::{Operation, Rule, Scope};

/// The organization a principal acts for, and the collaborations it takes
/// part in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub organization_id: u64,
    /// Collaboration ids, with the ids of their member organizations.
    pub collaborations: BTreeMap<u64, BTreeSet<u64>>,
}

impl Membership {
    pub fn new(organization_id: u64) -> Self {
        Self {
            organization_id,
            collaborations: BTreeMap::new(),
        }
    }

    pub fn with_collaboration<I>(mut self, collaboration_id: u64, organizations: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        self.collaborations
            .entry(collaboration_id)
            .or_default()
            .extend(organizations);
        self
    }

    pub fn in_collaboration(&self, collaboration_id: u64) -> bool {
        self.collaborations.contains_key(&collaboration_id)
    }

    /// Whether `organization_id` is a member of any of the collaborations.
    pub fn collaborates_with(&self, organization_id: u64) -> bool {
        self.collaborations
            .values()
            .any(|members| members.contains(&organization_id))
    }
}

#[derive(Debug, Clone)]
enum Flags {
    Scoped(HashMap<(Operation, Scope), bool>),
    Unscoped(HashMap<Operation, bool>),
}

/// The rules of one resource, evaluated for a principal.
///
/// There is a flag for every registered `(operation, scope)` pair, telling
/// whether the principal holds that rule.
#[derive(Debug, Clone)]
pub struct RuleCollection {
    name: String,
    flags: Flags,
    membership: Arc<Membership>,
}

impl RuleCollection {
    pub(crate) fn new(name: &str, unscoped: bool, membership: Arc<Membership>) -> Self {
        let flags = if unscoped {
            Flags::Unscoped(HashMap::new())
        } else {
            Flags::Scoped(HashMap::new())
        };
        Self {
            name: name.to_string(),
            flags,
            membership,
        }
    }

    pub(crate) fn add(&mut self, scope: Scope, operation: Operation, granted: bool) {
        match &mut self.flags {
            Flags::Scoped(flags) => *flags.entry((operation, scope)).or_default() |= granted,
            Flags::Unscoped(flags) => *flags.entry(operation).or_default() |= granted,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unscoped(&self) -> bool {
        matches!(self.flags, Flags::Unscoped(_))
    }

    /// Whether the rule is held at exactly `scope`. Unscoped resources
    /// ignore the scope.
    pub fn can(&self, operation: Operation, scope: Scope) -> bool {
        match &self.flags {
            Flags::Scoped(flags) => flags.get(&(operation, scope)).copied().unwrap_or(false),
            Flags::Unscoped(flags) => flags.get(&operation).copied().unwrap_or(false),
        }
    }

    /// Whether the rule is held at `scope` or at any broader scope.
    pub fn has_at_least_scope(&self, scope: Scope, operation: Operation) -> bool {
        match &self.flags {
            Flags::Scoped(_) => scope.at_least().any(|scope| self.can(operation, scope)),
            Flags::Unscoped(flags) => flags.get(&operation).copied().unwrap_or(false),
        }
    }

    /// The broadest scope at which the rule is held. Unscoped rules count as
    /// global.
    pub fn get_max_scope(&self, operation: Operation) -> Option<Scope> {
        match &self.flags {
            Flags::Scoped(_) => Scope::ALL
                .into_iter()
                .rev()
                .find(|scope| self.can(operation, *scope)),
            Flags::Unscoped(_) => self
                .can(operation, Scope::Global)
                .then(|| Scope::Global),
        }
    }

    /// Whether `operation` may be performed on an entity of organization
    /// `subject_org_id`.
    pub fn can_for_org(&self, operation: Operation, subject_org_id: u64) -> bool {
        if self.has_at_least_scope(Scope::Global, operation) {
            return true;
        }
        if self.has_at_least_scope(Scope::Organization, operation)
            && subject_org_id == self.membership.organization_id
        {
            return true;
        }
        self.has_at_least_scope(Scope::Collaboration, operation)
            && self.membership.collaborates_with(subject_org_id)
    }

    /// Whether `operation` may be performed on an entity of collaboration
    /// `collaboration_id`.
    pub fn can_for_col(&self, operation: Operation, collaboration_id: u64) -> bool {
        if self.has_at_least_scope(Scope::Global, operation) {
            return true;
        }
        self.has_at_least_scope(Scope::Collaboration, operation)
            && self.membership.in_collaboration(collaboration_id)
    }
}

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
/// You don't have the rule ({name}, {scope}, {operation})
pub struct MissingRule {
    pub name: String,
    pub scope: Scope,
    pub operation: Operation,
}

impl From<&Rule> for MissingRule {
    fn from(rule: &Rule) -> Self {
        Self {
            name: rule.name.clone(),
            scope: rule.scope,
            operation: rule.operation,
        }
    }
}

/// The permissions of an authenticated principal, one [`RuleCollection`] per
/// resource.
#[derive(Debug, Clone)]
pub struct Permissions {
    collections: HashMap<String, RuleCollection>,
    membership: Arc<Membership>,
}

impl Permissions {
    pub(crate) fn new(collections: HashMap<String, RuleCollection>, membership: Arc<Membership>) -> Self {
        Self {
            collections,
            membership,
        }
    }

    pub fn collection(&self, resource: &str) -> Option<&RuleCollection> {
        self.collections.get(resource)
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// See [`RuleCollection::has_at_least_scope`]. Unknown resources grant
    /// nothing.
    pub fn has_at_least_scope(&self, resource: &str, scope: Scope, operation: Operation) -> bool {
        self.collection(resource)
            .map(|collection| collection.has_at_least_scope(scope, operation))
            .unwrap_or(false)
    }

    /// Checks that the principal holds each of the `rules`, e.g. before it
    /// assigns them to someone else. Stops at the first missing rule.
    pub fn check_user_rules<'a, I>(&self, rules: I) -> Result<(), MissingRule>
    where
        I: IntoIterator<Item = &'a Rule>,
    {
        for rule in rules {
            if !self.has_at_least_scope(&rule.name, rule.scope, rule.operation) {
                debug!("missing rule {}", rule);
                return Err(MissingRule::from(rule));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{FixedRole, Grants, PermissionManager, RuleRegistry};

    const ORG_A: u64 = 1;
    const ORG_B: u64 = 2;
    const ORG_C: u64 = 3;
    const COLLAB: u64 = 10;

    fn registry() -> RuleRegistry {
        let mut registry = RuleRegistry::new();
        for scope in Scope::ALL {
            for operation in [Operation::View, Operation::Edit] {
                registry
                    .register_rule("organization", Some(scope), operation, None, &[])
                    .unwrap();
            }
        }
        registry
            .register_rule("event", None, Operation::Receive, None, &[FixedRole::Node])
            .unwrap();
        registry
    }

    fn membership() -> Membership {
        Membership::new(ORG_A).with_collaboration(COLLAB, vec![ORG_A, ORG_B])
    }

    fn permissions_with(manager: &PermissionManager, rules: &[(Scope, Operation)]) -> Permissions {
        let ids = rules.iter().map(|(scope, operation)| {
            manager
                .rule("organization", *scope, *operation)
                .unwrap()
                .id
        });
        manager.permissions(&Grants::default().with_rules(ids), membership())
    }

    #[test]
    fn test_scope_monotonicity() {
        let manager = PermissionManager::from(registry());
        for granted in Scope::ALL {
            let permissions = permissions_with(&manager, &[(granted, Operation::View)]);
            let organization = permissions.collection("organization").unwrap();
            for required in Scope::ALL {
                assert_eq!(
                    organization.has_at_least_scope(required, Operation::View),
                    required <= granted,
                    "granted {} required {}",
                    granted,
                    required
                );
            }
            assert!(!organization.has_at_least_scope(Scope::Own, Operation::Edit));
            assert_eq!(organization.get_max_scope(Operation::View), Some(granted));
            assert_eq!(organization.get_max_scope(Operation::Edit), None);
        }
    }

    #[test]
    fn test_can_for_org_containment() {
        let manager = PermissionManager::from(registry());

        let collaboration = permissions_with(&manager, &[(Scope::Collaboration, Operation::View)]);
        let organization = collaboration.collection("organization").unwrap();
        assert!(organization.can_for_org(Operation::View, ORG_A));
        assert!(organization.can_for_org(Operation::View, ORG_B));
        assert!(!organization.can_for_org(Operation::View, ORG_C));

        let own_org = permissions_with(&manager, &[(Scope::Organization, Operation::View)]);
        let organization = own_org.collection("organization").unwrap();
        assert!(organization.can_for_org(Operation::View, ORG_A));
        assert!(!organization.can_for_org(Operation::View, ORG_B));

        let global = permissions_with(&manager, &[(Scope::Global, Operation::View)]);
        let organization = global.collection("organization").unwrap();
        assert!(organization.can_for_org(Operation::View, ORG_C));
    }

    #[test]
    fn test_can_for_col() {
        let manager = PermissionManager::from(registry());
        let permissions = permissions_with(&manager, &[(Scope::Collaboration, Operation::Edit)]);
        let organization = permissions.collection("organization").unwrap();
        assert!(organization.can_for_col(Operation::Edit, COLLAB));
        assert!(!organization.can_for_col(Operation::Edit, COLLAB + 1));
        assert!(!organization.can_for_col(Operation::View, COLLAB));

        let permissions = permissions_with(&manager, &[(Scope::Organization, Operation::Edit)]);
        let organization = permissions.collection("organization").unwrap();
        assert!(!organization.can_for_col(Operation::Edit, COLLAB));
    }

    #[test]
    fn test_duplicate_registration_keeps_results() {
        let before = PermissionManager::from(registry());
        let mut registry = registry();
        registry
            .register_rule("organization", Some(Scope::Collaboration), Operation::View, None, &[])
            .unwrap();
        let after = PermissionManager::from(registry);
        assert_eq!(before.rules().count(), after.rules().count());

        let rules = [(Scope::Collaboration, Operation::View)];
        let (before, after) = (permissions_with(&before, &rules), permissions_with(&after, &rules));
        for org in [ORG_A, ORG_B, ORG_C] {
            assert_eq!(
                before.collection("organization").unwrap().can_for_org(Operation::View, org),
                after.collection("organization").unwrap().can_for_org(Operation::View, org),
            );
        }
        assert_eq!(
            before.collection("organization").unwrap().can_for_col(Operation::View, COLLAB),
            after.collection("organization").unwrap().can_for_col(Operation::View, COLLAB),
        );
    }

    #[test]
    fn test_unscoped_resource() {
        let manager = PermissionManager::from(registry());
        let node = manager.permissions(&Grants::default().with_role(FixedRole::Node), membership());
        let event = node.collection("event").unwrap();
        assert!(event.is_unscoped());
        for scope in Scope::ALL {
            assert!(event.has_at_least_scope(scope, Operation::Receive));
        }
        assert!(!event.has_at_least_scope(Scope::Own, Operation::Send));
        assert_eq!(event.get_max_scope(Operation::Receive), Some(Scope::Global));
        assert!(event.can_for_org(Operation::Receive, ORG_C));

        let user = manager.permissions(&Grants::default(), membership());
        assert!(!user.has_at_least_scope("event", Scope::Own, Operation::Receive));
    }

    #[test]
    fn test_check_user_rules_stops_at_first_missing_rule() {
        let manager = PermissionManager::from(registry());
        let permissions = permissions_with(
            &manager,
            &[(Scope::Organization, Operation::View)],
        );
        let rule = |scope, operation| manager.rule("organization", scope, operation).unwrap();
        let rules = vec![
            rule(Scope::Own, Operation::View),
            rule(Scope::Collaboration, Operation::View),
            rule(Scope::Global, Operation::Edit),
        ];

        let missing = permissions.check_user_rules(rules).unwrap_err();
        assert_eq!(
            missing,
            MissingRule {
                name: "organization".into(),
                scope: Scope::Collaboration,
                operation: Operation::View,
            }
        );
        assert_eq!(
            missing.to_string(),
            "You don't have the rule (organization, collaboration, view)"
        );

        let held = vec![rule(Scope::Own, Operation::View), rule(Scope::Organization, Operation::View)];
        assert!(permissions.check_user_rules(held).is_ok());
    }

    #[test]
    fn test_unknown_resource_grants_nothing() {
        let manager = PermissionManager::from(registry());
        let root = manager.permissions(&Grants::default().with_role(FixedRole::Root), membership());
        assert!(root.has_at_least_scope("organization", Scope::Global, Operation::Edit));
        assert!(!root.has_at_least_scope("vpn", Scope::Own, Operation::View));
        assert!(root.collection("vpn").is_none());
    }
}
