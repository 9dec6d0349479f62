// Repository roles and the rules for changing them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Privilege level on one repository, most privileged first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Manager,
    Contributor,
    Observer,
    None,
}

pub const ALL_ROLES: [Role; 5] =
    [Role::Owner, Role::Manager, Role::Contributor, Role::Observer, Role::None];

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("Role does not exist.")]
    InvalidRole,

    #[error("Not enough permission.")]
    InsufficientPermission,

    #[error("User does not have any role.")]
    NoExistingRole,
}

impl Role {
    /// Position in the total order; lower is more privileged.
    pub const fn index(self) -> u8 {
        match self {
            Self::Owner => 0,
            Self::Manager => 1,
            Self::Contributor => 2,
            Self::Observer => 3,
            Self::None => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Manager => "manager",
            Self::Contributor => "contributor",
            Self::Observer => "observer",
            Self::None => "none",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        ALL_ROLES.into_iter().find(|role| role.as_str() == value)
    }

    /// True when this role satisfies an operation requiring `required`.
    pub const fn allows(self, required: Role) -> bool {
        self.index() <= required.index()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AccessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_db_value(value).ok_or(AccessError::InvalidRole)
    }
}

/// Validate that `assigner` may move a user from `current` to `new_role`.
///
/// The assigner may only grant roles at most as privileged as its own, may
/// not touch users already at or above its own level, and cannot revoke a
/// role that does not exist.
pub fn check_role_change(assigner: Role, current: Role, new_role: Role) -> Result<(), AccessError> {
    if !assigner.allows(new_role) {
        return Err(AccessError::InsufficientPermission);
    }

    if current.index() <= assigner.index() {
        return Err(AccessError::InsufficientPermission);
    }

    if current == Role::None && new_role == Role::None {
        return Err(AccessError::NoExistingRole);
    }

    Ok(())
}
