//! Session user and the role policy. `superuser` and `viewer` are
//! read-only roles; every other role may mutate. `admin`, `superuser`
//! and `viewer` see all orders, other roles only their own.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: String,
}

pub fn can_edit(role: &str) -> bool {
    !matches!(role, "superuser" | "viewer")
}

pub fn can_view_all(role: &str) -> bool {
    matches!(role, "admin" | "superuser" | "viewer")
}

impl User {
    pub fn new(id: i64, username: impl Into<String>, role: impl Into<String>) -> Self {
        User { id, username: username.into(), role: role.into() }
    }

    pub fn can_edit(&self) -> bool {
        can_edit(&self.role)
    }

    pub fn can_view_all(&self) -> bool {
        can_view_all(&self.role)
    }

    /// Whether this user may mutate an order owned by `owner_id`: edit
    /// rights plus either ownership or all-orders visibility.
    pub fn may_touch(&self, owner_id: i64) -> bool {
        self.can_edit() && (self.id == owner_id || self.can_view_all())
    }
}
