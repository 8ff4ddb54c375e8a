use std::collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};
use vantage6_core::{Principal, PrincipalKind};

use super::{
    FixedRole,
    Membership,
    Operation,
    PermissionError,
    Permissions,
    Rule,
    RuleCollection,
    RuleKey,
    Scope,
};

/// A resource of the server API that guards its operations with rules.
pub trait ResourcePermissions {
    /// The name of the resource, which is also the name of its rules.
    fn name(&self) -> &str;

    /// Registers the rules of the resource.
    fn permissions(&self, registry: &mut RuleRegistry) -> Result<(), PermissionError>;
}

/// The rules collected while the resources are loaded.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<u64, Rule>,
    index: HashMap<RuleKey, u64>,
    /// Resource names, and whether they are unscoped.
    resources: BTreeMap<String, bool>,
    roles: HashMap<FixedRole, BTreeSet<u64>>,
    next_id: u64,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the rule `(resource, scope, operation)`, unless it exists
    /// already, and assigns it to the root role and to `assign_to`.
    ///
    /// A `scope` of `None` registers a rule of an unscoped resource. A
    /// resource is either scoped or unscoped, mixing both is an error.
    pub fn register_rule(
        &mut self,
        resource: &str,
        scope: Option<Scope>,
        operation: Operation,
        description: Option<&str>,
        assign_to: &[FixedRole],
    ) -> Result<&Rule, PermissionError> {
        let unscoped = scope.is_none();
        match self.resources.entry(resource.to_string()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(unscoped);
            }
            std::collections::btree_map::Entry::Occupied(entry) => match (*entry.get(), scope) {
                (true, Some(scope)) => {
                    return Err(PermissionError::ScopedRuleOnUnscopedResource(
                        resource.to_string(),
                        scope,
                    ))
                }
                (false, None) => {
                    return Err(PermissionError::UnscopedRuleOnScopedResource(
                        resource.to_string(),
                    ))
                }
                _ => {}
            },
        }

        let key = RuleKey::new(resource, scope.unwrap_or(Scope::Global), operation);
        let id = match self.index.entry(key) {
            Entry::Occupied(entry) => {
                debug!("rule {} is already registered", entry.key());
                *entry.get()
            }
            Entry::Vacant(entry) => {
                self.next_id += 1;
                let id = self.next_id;
                let key = entry.key();
                self.rules.insert(
                    id,
                    Rule {
                        id,
                        name: key.name.clone(),
                        scope: key.scope,
                        operation: key.operation,
                        description: description.map(str::to_string),
                    },
                );
                entry.insert(id);
                id
            }
        };

        self.roles.entry(FixedRole::Root).or_default().insert(id);
        for role in assign_to {
            self.roles.entry(*role).or_default().insert(id);
        }
        Ok(&self.rules[&id])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// The rules a principal holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grants {
    pub roles: Vec<FixedRole>,
    /// Ids of rules granted directly or through custom roles.
    pub rules: Vec<u64>,
}

impl Grants {
    /// The fixed roles of nodes and containers. Users get their rules from
    /// the database, so they start without any.
    pub fn for_principal(principal: &Principal) -> Self {
        let roles = match principal.kind() {
            PrincipalKind::User => Vec::new(),
            PrincipalKind::Node => vec![FixedRole::Node],
            PrincipalKind::Container => vec![FixedRole::Container],
        };
        Self {
            roles,
            rules: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: FixedRole) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_rules<I: IntoIterator<Item = u64>>(mut self, rules: I) -> Self {
        self.rules.extend(rules);
        self
    }
}

/// The frozen rule registry. It evaluates the permissions of principals.
#[derive(Debug, Clone)]
pub struct PermissionManager {
    registry: RuleRegistry,
}

impl From<RuleRegistry> for PermissionManager {
    fn from(registry: RuleRegistry) -> Self {
        Self { registry }
    }
}

impl PermissionManager {
    /// Collects the rules of all the `resources`.
    ///
    /// # Errors
    /// Fails if a resource mixes scoped and unscoped rules.
    pub fn load_rules_from_resources(
        resources: &[&dyn ResourcePermissions],
    ) -> Result<Self, PermissionError> {
        let mut registry = RuleRegistry::new();
        for resource in resources {
            debug!("loading the rules of resource {}", resource.name());
            resource.permissions(&mut registry)?;
        }
        info!(
            "loaded {} rules of {} resources",
            registry.rules.len(),
            registry.resources.len()
        );
        Ok(registry.into())
    }

    pub fn rule(&self, name: &str, scope: Scope, operation: Operation) -> Option<&Rule> {
        self.registry
            .index
            .get(&RuleKey::new(name, scope, operation))
            .and_then(|id| self.registry.rules.get(id))
    }

    pub fn rule_by_id(&self, id: u64) -> Option<&Rule> {
        self.registry.rules.get(&id)
    }

    /// All the rules, ordered by id.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.registry.rules.values()
    }

    pub fn rules_of_role(&self, role: FixedRole) -> impl Iterator<Item = &Rule> {
        self.registry
            .roles
            .get(&role)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.registry.rules.get(id))
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.registry.resources.keys().map(String::as_str)
    }

    /// Derives the permissions of a principal holding `grants`, acting for
    /// the organization described by `membership`.
    pub fn permissions(&self, grants: &Grants, membership: Membership) -> Permissions {
        let granted = grants
            .roles
            .iter()
            .filter_map(|role| self.registry.roles.get(role))
            .flatten()
            .chain(grants.rules.iter())
            .copied()
            .collect::<HashSet<u64>>();

        let membership = Arc::new(membership);
        let mut collections = self
            .registry
            .resources
            .iter()
            .map(|(name, unscoped)| {
                let collection = RuleCollection::new(name, *unscoped, membership.clone());
                (name.clone(), collection)
            })
            .collect::<HashMap<_, _>>();
        for rule in self.registry.rules.values() {
            if let Some(collection) = collections.get_mut(&rule.name) {
                collection.add(rule.scope, rule.operation, granted.contains(&rule.id));
            }
        }
        Permissions::new(collections, membership)
    }
}
