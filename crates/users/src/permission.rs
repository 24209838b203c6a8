use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Role name granted to a user within an area.
///
/// Roles are opaque strings; the well-known ones are provided as constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn administrator() -> Self {
        Self::new("Administrator")
    }

    pub fn power_user() -> Self {
        Self::new("PowerUser")
    }

    pub fn user() -> Self {
        Self::new("User")
    }

    pub fn global_administrator() -> Self {
        Self::new("GlobalAdministrator")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Roles a user holds in one area, optionally refined per sub-area.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Permission {
    pub area: String,
    pub sub_area: Option<String>,
    pub roles: Vec<Role>,
    pub sub_area_permissions: BTreeMap<String, Permission>,
}

impl Permission {
    pub fn new(area: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            area: area.into(),
            sub_area: None,
            roles: roles.into_iter().collect(),
            sub_area_permissions: BTreeMap::new(),
        }
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}
