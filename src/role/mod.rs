//! Role membership.
//!
//! A [`RoleStore`] either queries PostgreSQL on every call or answers from a
//! [`RoleSnapshot`] loaded on first use and kept until the store is dropped.

mod repository;
mod snapshot;

pub use repository::*;
pub use snapshot::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::OnceCell;

use crate::config::RoleMode;
use crate::database::Database;
use crate::error::{Error, Result, invalid_field, is_unique_violation};
use crate::page::contains_pattern;

const SNAPSHOT_LOADS: &str = "membership_role_snapshot_loads_total";
const MAX_ROLE_LENGTH: usize = 50;

enum Mode {
    Live,
    Cached(OnceCell<RoleSnapshot>),
}

/// Role manager.
pub struct RoleStore {
    repo: RoleRepository,
    mode: Mode,
    loads: AtomicUsize,
}

impl RoleStore {
    /// Create a new [`RoleStore`] with the configured mode.
    pub fn new(db: Database, mode: RoleMode) -> Self {
        match mode {
            RoleMode::Live => Self::live(db),
            RoleMode::Cached => Self::cached(db),
        }
    }

    /// Every call hits the database.
    pub fn live(db: Database) -> Self {
        Self {
            repo: RoleRepository::new(db),
            mode: Mode::Live,
            loads: AtomicUsize::new(0),
        }
    }

    /// Reads come from a snapshot taken on first use, writes are refused.
    pub fn cached(db: Database) -> Self {
        Self {
            repo: RoleRepository::new(db),
            mode: Mode::Cached(OnceCell::new()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> RoleMode {
        match self.mode {
            Mode::Live => RoleMode::Live,
            Mode::Cached(_) => RoleMode::Cached,
        }
    }

    /// Snapshot of a cached store. `None` for a live one.
    ///
    /// Concurrent first callers share a single load. A failed load leaves
    /// the cell empty.
    async fn snapshot(&self) -> Result<Option<&RoleSnapshot>> {
        let Mode::Cached(cell) = &self.mode else {
            return Ok(None);
        };

        let snapshot = cell
            .get_or_try_init(|| async {
                self.loads.fetch_add(1, Ordering::Relaxed);
                let snapshot = self.repo.snapshot().await?;
                metrics::counter!(SNAPSHOT_LOADS).increment(1);
                tracing::info!(
                    roles = snapshot.all_roles().len(),
                    "role snapshot loaded"
                );
                Ok::<_, Error>(snapshot)
            })
            .await?;

        Ok(Some(snapshot))
    }

    /// Bulk loads attempted so far.
    pub fn snapshot_loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    fn writable(&self, operation: &'static str) -> Result<()> {
        match self.mode {
            Mode::Live => Ok(()),
            Mode::Cached(_) => Err(Error::Unsupported(operation)),
        }
    }

    pub async fn is_user_in_role(&self, username: &str, role: &str) -> Result<bool> {
        match self.snapshot().await? {
            Some(snapshot) => snapshot.is_user_in_role(username, role),
            None => self.repo.is_user_in_role(username, role).await,
        }
    }

    /// Role names granted to `username`, sorted.
    pub async fn roles_for_user(&self, username: &str) -> Result<Vec<String>> {
        match self.snapshot().await? {
            Some(snapshot) => snapshot.roles_for_user(username),
            None => self.repo.roles_for_user(username).await,
        }
    }

    /// Usernames holding `role`, sorted.
    pub async fn users_in_role(&self, role: &str) -> Result<Vec<String>> {
        match self.snapshot().await? {
            Some(snapshot) => snapshot.users_in_role(role),
            None => self.repo.users_in_role(role).await,
        }
    }

    pub async fn all_roles(&self) -> Result<Vec<String>> {
        match self.snapshot().await? {
            Some(snapshot) => Ok(snapshot.all_roles()),
            None => self.repo.all_roles().await,
        }
    }

    pub async fn role_exists(&self, role: &str) -> Result<bool> {
        match self.snapshot().await? {
            Some(snapshot) => Ok(snapshot.role_exists(role)),
            None => self.repo.role_exists(role).await,
        }
    }

    /// Members of `role` whose username contains `pattern`, ignoring case.
    pub async fn find_users_in_role(&self, role: &str, pattern: &str) -> Result<Vec<String>> {
        self.writable("find_users_in_role")?;
        self.repo
            .find_users_in_role(role, &contains_pattern(pattern))
            .await
    }

    pub async fn create_role(&self, role: &str) -> Result<()> {
        self.writable("create_role")?;
        if role.trim().is_empty() || role.chars().count() > MAX_ROLE_LENGTH {
            return Err(invalid_field(
                "role",
                "length",
                "Role name must contain 1 to 50 characters.",
            )
            .into());
        }

        match self.repo.insert(role).await {
            Ok(()) => {
                tracing::info!(%role, "role created");
                Ok(())
            },
            Err(Error::Storage(ref err)) if is_unique_violation(err) => {
                Err(Error::DuplicateRole(role.to_owned()))
            },
            Err(err) => Err(err),
        }
    }

    /// Delete `role`. With `reject_populated`, a role that still has members
    /// is kept and [`Error::RolePopulated`] is returned.
    pub async fn delete_role(&self, role: &str, reject_populated: bool) -> Result<bool> {
        self.writable("delete_role")?;
        let deleted = self.repo.delete(role, reject_populated).await?;
        if deleted {
            tracing::info!(%role, "role deleted");
        }
        Ok(deleted)
    }

    /// Grant every role to every user, or nothing when a name is unknown.
    pub async fn add_users_to_roles(&self, usernames: &[&str], roles: &[&str]) -> Result<u64> {
        self.writable("add_users_to_roles")?;
        check_batch(usernames, roles)?;

        let added = self.repo.add_memberships(usernames, roles).await?;
        tracing::info!(users = usernames.len(), roles = roles.len(), added, "memberships added");
        Ok(added)
    }

    /// Revoke every role from every user, or nothing when a name is unknown.
    pub async fn remove_users_from_roles(
        &self,
        usernames: &[&str],
        roles: &[&str],
    ) -> Result<u64> {
        self.writable("remove_users_from_roles")?;
        check_batch(usernames, roles)?;

        let removed = self.repo.remove_memberships(usernames, roles).await?;
        tracing::info!(users = usernames.len(), roles = roles.len(), removed, "memberships removed");
        Ok(removed)
    }
}

fn check_batch(usernames: &[&str], roles: &[&str]) -> Result<()> {
    if usernames.is_empty() {
        return Err(invalid_field("usernames", "empty", "At least one username is required.").into());
    }
    if roles.is_empty() {
        return Err(invalid_field("roles", "empty", "At least one role is required.").into());
    }
    Ok(())
}
