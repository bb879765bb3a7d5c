//! Immutable copy of every membership.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Error, Result};

/// Users, roles and memberships as loaded once by a cached
/// [`RoleStore`](super::RoleStore).
///
/// Usernames are looked up ignoring case, role names are exact.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoleSnapshot {
    /// Lowercased username to stored username.
    users: HashMap<String, String>,
    /// Role name to stored usernames.
    roles: BTreeMap<String, BTreeSet<String>>,
    /// Lowercased username to role names.
    memberships: HashMap<String, BTreeSet<String>>,
}

impl RoleSnapshot {
    /// Build a snapshot. Pairs naming an unknown user or role are dropped.
    pub fn new<U, R, P>(users: U, roles: R, pairs: P) -> Self
    where
        U: IntoIterator<Item = String>,
        R: IntoIterator<Item = String>,
        P: IntoIterator<Item = (String, String)>,
    {
        let users: HashMap<String, String> = users
            .into_iter()
            .map(|name| (name.to_lowercase(), name))
            .collect();
        let mut roles: BTreeMap<String, BTreeSet<String>> = roles
            .into_iter()
            .map(|name| (name, BTreeSet::new()))
            .collect();
        let mut memberships: HashMap<String, BTreeSet<String>> = HashMap::new();

        for (username, role) in pairs {
            let key = username.to_lowercase();
            let (Some(stored), Some(members)) = (users.get(&key), roles.get_mut(&role))
            else {
                continue;
            };

            members.insert(stored.clone());
            memberships.entry(key).or_default().insert(role);
        }

        Self {
            users,
            roles,
            memberships,
        }
    }

    fn user_key(&self, username: &str) -> Result<String> {
        let key = username.to_lowercase();
        if self.users.contains_key(&key) {
            Ok(key)
        } else {
            Err(Error::user_not_found(username))
        }
    }

    fn members(&self, role: &str) -> Result<&BTreeSet<String>> {
        self.roles.get(role).ok_or_else(|| Error::role_not_found(role))
    }

    pub fn is_user_in_role(&self, username: &str, role: &str) -> Result<bool> {
        let key = self.user_key(username)?;
        let members = self.members(role)?;
        Ok(members.contains(&self.users[&key]))
    }

    pub fn roles_for_user(&self, username: &str) -> Result<Vec<String>> {
        let key = self.user_key(username)?;
        Ok(self
            .memberships
            .get(&key)
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn users_in_role(&self, role: &str) -> Result<Vec<String>> {
        Ok(self.members(role)?.iter().cloned().collect())
    }

    pub fn all_roles(&self) -> Vec<String> {
        self.roles.keys().cloned().collect()
    }

    pub fn role_exists(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> RoleSnapshot {
        RoleSnapshot::new(
            ["alice", "Bob", "carol"].map(String::from),
            ["admin", "editor", "viewer"].map(String::from),
            [
                ("alice", "admin"),
                ("alice", "editor"),
                ("bob", "editor"),
                ("ghost", "admin"),
                ("carol", "nobody"),
            ]
            .map(|(u, r)| (u.to_owned(), r.to_owned())),
        )
    }

    #[test]
    fn test_membership() {
        let snapshot = snapshot();

        assert!(snapshot.is_user_in_role("alice", "admin").unwrap());
        assert!(snapshot.is_user_in_role("ALICE", "editor").unwrap());
        assert!(!snapshot.is_user_in_role("carol", "admin").unwrap());
        assert_eq!(snapshot.roles_for_user("alice").unwrap(), ["admin", "editor"]);
        assert_eq!(snapshot.users_in_role("editor").unwrap(), ["Bob", "alice"]);
        assert!(snapshot.roles_for_user("carol").unwrap().is_empty());
        assert!(snapshot.users_in_role("viewer").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_names() {
        let snapshot = snapshot();

        assert!(matches!(
            snapshot.is_user_in_role("ghost", "admin"),
            Err(Error::NotFound { entity: "user", .. })
        ));
        assert!(matches!(
            snapshot.is_user_in_role("alice", "Admin"),
            Err(Error::NotFound { entity: "role", .. })
        ));
        assert!(snapshot.roles_for_user("ghost").is_err());
        assert!(snapshot.users_in_role("nobody").is_err());
        assert!(!snapshot.role_exists("nobody"));
        assert!(snapshot.role_exists("viewer"));
    }

    #[test]
    fn test_empty() {
        let snapshot = RoleSnapshot::default();

        assert!(snapshot.all_roles().is_empty());
        assert!(!snapshot.role_exists("admin"));
    }

    #[test]
    fn test_all_roles_sorted() {
        assert_eq!(snapshot().all_roles(), ["admin", "editor", "viewer"]);
    }
}
