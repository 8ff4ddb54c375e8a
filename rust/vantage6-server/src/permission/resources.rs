//! The rules of the standard server resources.

use super::{
    FixedRole,
    Operation,
    PermissionError,
    PermissionManager,
    ResourcePermissions,
    RuleRegistry,
    Scope,
};

use super::{
    FixedRole::{Container as C, Node as N},
    Operation::{Create, Delete, Edit, Receive, View},
    Scope::{Collaboration as Col, Global as Glo, Organization as Org, Own},
};

/// A rule of a resource, and the fixed roles it is assigned to besides root.
#[derive(Debug, Clone, Copy)]
pub struct RuleDeclaration {
    /// `None` for unscoped resources.
    pub scope: Option<Scope>,
    pub operation: Operation,
    pub description: &'static str,
    pub assign_to: &'static [FixedRole],
}

const fn rule(
    scope: Scope,
    operation: Operation,
    description: &'static str,
    assign_to: &'static [FixedRole],
) -> RuleDeclaration {
    RuleDeclaration {
        scope: Some(scope),
        operation,
        description,
        assign_to,
    }
}

const fn unscoped(
    operation: Operation,
    description: &'static str,
    assign_to: &'static [FixedRole],
) -> RuleDeclaration {
    RuleDeclaration {
        scope: None,
        operation,
        description,
        assign_to,
    }
}

/// A resource with a fixed list of rules.
#[derive(Debug, Clone, Copy)]
pub struct StaticResource {
    pub name: &'static str,
    pub rules: &'static [RuleDeclaration],
}

impl ResourcePermissions for StaticResource {
    fn name(&self) -> &str {
        self.name
    }

    fn permissions(&self, registry: &mut RuleRegistry) -> Result<(), PermissionError> {
        for declaration in self.rules {
            registry.register_rule(
                self.name,
                declaration.scope,
                declaration.operation,
                Some(declaration.description),
                declaration.assign_to,
            )?;
        }
        Ok(())
    }
}

pub const NODE: StaticResource = StaticResource {
    name: "node",
    rules: &[
        rule(Glo, View, "view any node", &[]),
        rule(Col, View, "view any node in your collaborations", &[C]),
        rule(Org, View, "view the nodes of your organization", &[N]),
        rule(Glo, Edit, "edit any node", &[]),
        rule(Org, Edit, "edit the nodes of your organization", &[N]),
        rule(Glo, Create, "create a node for any organization", &[]),
        rule(Org, Create, "create a node for your organization", &[]),
        rule(Glo, Delete, "delete any node", &[]),
        rule(Org, Delete, "delete the nodes of your organization", &[]),
    ],
};

pub const ORGANIZATION: StaticResource = StaticResource {
    name: "organization",
    rules: &[
        rule(Glo, View, "view all organizations", &[]),
        rule(Col, View, "view the organizations in your collaborations", &[N, C]),
        rule(Org, View, "view your own organization", &[N, C]),
        rule(Glo, Edit, "edit all organizations", &[]),
        rule(Col, Edit, "edit the organizations in your collaborations", &[]),
        rule(Org, Edit, "edit your own organization", &[N]),
        rule(Glo, Create, "create a new organization", &[]),
    ],
};

pub const COLLABORATION: StaticResource = StaticResource {
    name: "collaboration",
    rules: &[
        rule(Glo, View, "view all collaborations", &[]),
        rule(Org, View, "view the collaborations of your organization", &[N, C]),
        rule(Glo, Edit, "edit any collaboration", &[]),
        rule(Glo, Create, "create a new collaboration", &[]),
        rule(Glo, Delete, "delete a collaboration", &[]),
    ],
};

pub const TASK: StaticResource = StaticResource {
    name: "task",
    rules: &[
        rule(Glo, View, "view any task", &[]),
        rule(Col, View, "view the tasks of your collaborations", &[N, C]),
        rule(Org, View, "view the tasks of your organization", &[]),
        rule(Glo, Create, "create a task for any collaboration", &[]),
        rule(Col, Create, "create a task in your collaborations", &[C]),
        rule(Org, Create, "create a task from your organization", &[]),
        rule(Glo, Delete, "delete any task", &[]),
        rule(Col, Delete, "delete the tasks of your collaborations", &[]),
        rule(Org, Delete, "delete the tasks of your organization", &[]),
    ],
};

pub const RESULT: StaticResource = StaticResource {
    name: "result",
    rules: &[
        rule(Glo, View, "view any result", &[]),
        rule(Col, View, "view the results of your collaborations", &[C]),
        rule(Org, View, "view the results of your organization", &[N]),
        rule(Org, Edit, "report the results computed by your organization", &[N]),
    ],
};

pub const USER: StaticResource = StaticResource {
    name: "user",
    rules: &[
        rule(Glo, View, "view any user", &[]),
        rule(Col, View, "view the users of your collaborations", &[]),
        rule(Org, View, "view the users of your organization", &[]),
        rule(Own, View, "view your own user", &[]),
        rule(Glo, Edit, "edit any user", &[]),
        rule(Col, Edit, "edit the users of your collaborations", &[]),
        rule(Org, Edit, "edit the users of your organization", &[]),
        rule(Own, Edit, "edit your own user", &[]),
        rule(Glo, Create, "create a user for any organization", &[]),
        rule(Col, Create, "create a user for your collaborations", &[]),
        rule(Org, Create, "create a user for your organization", &[]),
        rule(Glo, Delete, "delete any user", &[]),
        rule(Col, Delete, "delete the users of your collaborations", &[]),
        rule(Org, Delete, "delete the users of your organization", &[]),
        rule(Own, Delete, "delete your own user", &[]),
    ],
};

pub const ROLE: StaticResource = StaticResource {
    name: "role",
    rules: &[
        rule(Glo, View, "view any role", &[]),
        rule(Col, View, "view the roles of your collaborations", &[]),
        rule(Org, View, "view the roles of your organization", &[]),
        rule(Glo, Create, "create a role for any organization", &[]),
        rule(Col, Create, "create a role for your collaborations", &[]),
        rule(Org, Create, "create a role for your organization", &[]),
        rule(Glo, Edit, "edit any role", &[]),
        rule(Col, Edit, "edit the roles of your collaborations", &[]),
        rule(Org, Edit, "edit the roles of your organization", &[]),
        rule(Glo, Delete, "delete any role", &[]),
        rule(Col, Delete, "delete the roles of your collaborations", &[]),
        rule(Org, Delete, "delete the roles of your organization", &[]),
    ],
};

pub const RULE: StaticResource = StaticResource {
    name: "rule",
    rules: &[rule(Glo, View, "view the rules", &[])],
};

pub const PORT: StaticResource = StaticResource {
    name: "port",
    rules: &[
        rule(Glo, View, "view the ports of any result", &[C]),
        rule(Org, View, "view the ports of the results of your organization", &[]),
        rule(Glo, Create, "register the ports of an algorithm", &[N]),
        rule(Glo, Delete, "remove the ports of an algorithm", &[N]),
    ],
};

pub const EVENT: StaticResource = StaticResource {
    name: "event",
    rules: &[
        unscoped(Operation::Send, "send events to the rooms you are in", &[N]),
        unscoped(Receive, "receive events of the rooms you are in", &[N]),
        unscoped(Create, "broadcast events to collaborations", &[]),
    ],
};

/// All the standard resources.
pub const STANDARD_RESOURCES: [StaticResource; 10] = [
    NODE,
    ORGANIZATION,
    COLLABORATION,
    TASK,
    RESULT,
    USER,
    ROLE,
    RULE,
    PORT,
    EVENT,
];

/// A manager holding the rules of the [`STANDARD_RESOURCES`].
pub fn standard_manager() -> Result<PermissionManager, PermissionError> {
    let resources: Vec<&dyn ResourcePermissions> = STANDARD_RESOURCES
        .iter()
        .map(|resource| resource as &dyn ResourcePermissions)
        .collect();
    PermissionManager::load_rules_from_resources(&resources)
}
