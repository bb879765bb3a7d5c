//! Handle role database requests.

use std::collections::BTreeSet;

use crate::database::{Batch, Database, Statement};
use crate::error::{Error, Result};
use crate::role::RoleSnapshot;

#[derive(Clone, Debug)]
pub struct RoleRepository {
    db: Database,
}

fn names(rows: Vec<(String,)>) -> Vec<String> {
    rows.into_iter().map(|(name,)| name).collect()
}

impl RoleRepository {
    /// Create a new [`RoleRepository`].
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn is_user_in_role(&self, username: &str, role: &str) -> Result<bool> {
        let found = self
            .db
            .scalar(
                Statement::new(
                    "SELECT EXISTS (SELECT 1 FROM user_roles ur \
                     JOIN users u ON u.user_id = ur.user_id \
                     JOIN roles r ON r.role_id = ur.role_id \
                     WHERE LOWER(u.username) = LOWER($1) AND r.role_name = $2)",
                )
                .bind(username)
                .bind(role),
            )
            .await?;

        Ok(found.unwrap_or_default())
    }

    pub async fn roles_for_user(&self, username: &str) -> Result<Vec<String>> {
        let stmt = Statement::new(
            "SELECT r.role_name FROM roles r \
             JOIN user_roles ur ON ur.role_id = r.role_id \
             JOIN users u ON u.user_id = ur.user_id \
             WHERE LOWER(u.username) = LOWER($1) \
             ORDER BY r.role_name COLLATE \"C\"",
        )
        .bind(username);

        Ok(names(self.db.query_as(stmt).await?))
    }

    pub async fn users_in_role(&self, role: &str) -> Result<Vec<String>> {
        let stmt = Statement::new(
            "SELECT u.username FROM users u \
             JOIN user_roles ur ON ur.user_id = u.user_id \
             JOIN roles r ON r.role_id = ur.role_id \
             WHERE r.role_name = $1 \
             ORDER BY u.username COLLATE \"C\"",
        )
        .bind(role);

        Ok(names(self.db.query_as(stmt).await?))
    }

    /// Members of `role` whose username matches an escaped `ILIKE` pattern.
    pub async fn find_users_in_role(&self, role: &str, pattern: &str) -> Result<Vec<String>> {
        let stmt = Statement::new(
            "SELECT u.username FROM users u \
             JOIN user_roles ur ON ur.user_id = u.user_id \
             JOIN roles r ON r.role_id = ur.role_id \
             WHERE r.role_name = $1 AND u.username ILIKE $2 \
             ORDER BY u.username COLLATE \"C\"",
        )
        .bind(role)
        .bind(pattern);

        Ok(names(self.db.query_as(stmt).await?))
    }

    pub async fn all_roles(&self) -> Result<Vec<String>> {
        let stmt =
            Statement::new("SELECT role_name FROM roles ORDER BY role_name COLLATE \"C\"");
        Ok(names(self.db.query_as(stmt).await?))
    }

    pub async fn role_exists(&self, role: &str) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .scalar(Statement::new("SELECT role_id FROM roles WHERE role_name = $1").bind(role))
            .await?;
        Ok(found.is_some())
    }

    pub async fn insert(&self, role: &str) -> Result<()> {
        self.db
            .non_query(Statement::new("INSERT INTO roles (role_name) VALUES ($1)").bind(role))
            .await?;
        Ok(())
    }

    /// Delete `role`. Memberships follow the foreign key.
    pub async fn delete(&self, role: &str, reject_populated: bool) -> Result<bool> {
        let mut batch = self.db.begin().await?;

        let role_id: Option<i64> = batch
            .scalar(
                Statement::new("SELECT role_id FROM roles WHERE role_name = $1 FOR UPDATE")
                    .bind(role),
            )
            .await?;
        let Some(role_id) = role_id else {
            return Ok(false);
        };

        if reject_populated {
            let members: Option<i64> = batch
                .scalar(
                    Statement::new("SELECT COUNT(*) FROM user_roles WHERE role_id = $1")
                        .bind(role_id),
                )
                .await?;
            if members.unwrap_or_default() > 0 {
                return Err(Error::RolePopulated(role.to_owned()));
            }
        }

        batch
            .non_query(Statement::new("DELETE FROM roles WHERE role_id = $1").bind(role_id))
            .await?;
        batch.commit().await?;

        Ok(true)
    }

    /// Grant every role to every user. Existing pairs are kept as is.
    pub async fn add_memberships(&self, usernames: &[&str], roles: &[&str]) -> Result<u64> {
        let mut batch = self.db.begin().await?;
        let (user_ids, role_ids) = resolve(&mut batch, usernames, roles).await?;

        let added = batch
            .non_query(
                Statement::new(
                    "INSERT INTO user_roles (user_id, role_id) \
                     SELECT u, r FROM UNNEST($1::BIGINT[]) AS u \
                     CROSS JOIN UNNEST($2::BIGINT[]) AS r \
                     ON CONFLICT DO NOTHING",
                )
                .bind(user_ids)
                .bind(role_ids),
            )
            .await?;
        batch.commit().await?;

        Ok(added)
    }

    /// Revoke every role from every user.
    pub async fn remove_memberships(&self, usernames: &[&str], roles: &[&str]) -> Result<u64> {
        let mut batch = self.db.begin().await?;
        let (user_ids, role_ids) = resolve(&mut batch, usernames, roles).await?;

        let removed = batch
            .non_query(
                Statement::new(
                    "DELETE FROM user_roles WHERE user_id = ANY($1) AND role_id = ANY($2)",
                )
                .bind(user_ids)
                .bind(role_ids),
            )
            .await?;
        batch.commit().await?;

        Ok(removed)
    }

    /// Load every user, role and membership.
    pub async fn snapshot(&self) -> Result<RoleSnapshot> {
        let mut batch = self.db.begin().await?;

        let users: Vec<(String,)> =
            batch.query_as(Statement::new("SELECT username FROM users")).await?;
        let roles: Vec<(String,)> =
            batch.query_as(Statement::new("SELECT role_name FROM roles")).await?;
        let pairs: Vec<(String, String)> = batch
            .query_as(Statement::new(
                "SELECT u.username, r.role_name FROM user_roles ur \
                 JOIN users u ON u.user_id = ur.user_id \
                 JOIN roles r ON r.role_id = ur.role_id",
            ))
            .await?;
        batch.commit().await?;

        Ok(RoleSnapshot::new(names(users), names(roles), pairs))
    }
}

/// Resolve every name to its id, failing on the first unknown one.
async fn resolve(
    batch: &mut Batch,
    usernames: &[&str],
    roles: &[&str],
) -> Result<(Vec<i64>, Vec<i64>)> {
    let wanted_users: BTreeSet<String> = usernames.iter().map(|u| u.to_lowercase()).collect();
    let found_users: Vec<(i64, String)> = batch
        .query_as(
            Statement::new(
                "SELECT user_id, LOWER(username) FROM users WHERE LOWER(username) = ANY($1)",
            )
            .bind(wanted_users.iter().cloned().collect::<Vec<_>>()),
        )
        .await?;
    if let Some(missing) = usernames.iter().find(|u| {
        let key = u.to_lowercase();
        !found_users.iter().any(|(_, name)| *name == key)
    }) {
        return Err(Error::user_not_found(*missing));
    }

    let wanted_roles: BTreeSet<String> = roles.iter().map(|r| (*r).to_owned()).collect();
    let found_roles: Vec<(i64, String)> = batch
        .query_as(
            Statement::new("SELECT role_id, role_name FROM roles WHERE role_name = ANY($1)")
                .bind(wanted_roles.into_iter().collect::<Vec<_>>()),
        )
        .await?;
    if let Some(missing) = roles
        .iter()
        .find(|r| !found_roles.iter().any(|(_, name)| name.as_str() == **r))
    {
        return Err(Error::role_not_found(*missing));
    }

    Ok((
        found_users.into_iter().map(|(id, _)| id).collect(),
        found_roles.into_iter().map(|(id, _)| id).collect(),
    ))
}
