mod repository;

pub use repository::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{Result, invalid_field};
use crate::page::{Page, PageRequest, contains_pattern};

const MAX_NAME_LENGTH: usize = 255;

/// A property a caller asks for, with the value to use when none is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub name: String,
    pub default: Option<String>,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, default: Option<&str>) -> Self {
        Self {
            name: name.into(),
            default: default.map(str::to_owned),
        }
    }
}

/// Value of one requested property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub name: String,
    pub value: Option<String>,
    /// Whether `value` comes from the definition rather than storage.
    pub is_default: bool,
}

/// Summary of the properties stored for one username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProfileInfo {
    pub username: String,
    pub last_activity: DateTime<Utc>,
    pub property_count: i64,
}

/// Profile manager.
#[derive(Clone, Debug)]
pub struct ProfileStore {
    repo: ProfileRepository,
}

impl ProfileStore {
    /// Create a new [`ProfileStore`].
    pub fn new(db: Database) -> Self {
        Self {
            repo: ProfileRepository::new(db),
        }
    }

    /// Values of `definitions`, in the same order.
    ///
    /// Properties without a stored row take the definition default.
    pub async fn get_properties(
        &self,
        username: &str,
        definitions: &[PropertyDefinition],
    ) -> Result<Vec<PropertyValue>> {
        if definitions.is_empty() {
            return Ok(Vec::new());
        }

        let names = definitions.iter().map(|d| d.name.clone()).collect();
        let stored = self.repo.values(username, names).await?;

        Ok(definitions
            .iter()
            .map(|definition| {
                match stored.iter().find(|(name, _)| *name == definition.name) {
                    Some((_, value)) => PropertyValue {
                        name: definition.name.clone(),
                        value: value.clone(),
                        is_default: false,
                    },
                    None => PropertyValue {
                        name: definition.name.clone(),
                        value: definition.default.clone(),
                        is_default: true,
                    },
                }
            })
            .collect())
    }

    /// Insert or replace every entry for `username`.
    pub async fn set_properties(
        &self,
        username: &str,
        entries: &[(&str, Option<&str>)],
    ) -> Result<()> {
        if username.trim().is_empty() {
            return Err(invalid_field("username", "empty", "Username is required.").into());
        }
        if username.chars().count() > MAX_NAME_LENGTH {
            return Err(invalid_field(
                "username",
                "length",
                "Username must contain at most 255 characters.",
            )
            .into());
        }
        if entries.iter().any(|(name, _)| name.trim().is_empty()) {
            return Err(
                invalid_field("property_name", "empty", "Property name is required.").into(),
            );
        }
        if entries
            .iter()
            .any(|(name, _)| name.chars().count() > MAX_NAME_LENGTH)
        {
            return Err(invalid_field(
                "property_name",
                "length",
                "Property name must contain at most 255 characters.",
            )
            .into());
        }
        if entries.is_empty() {
            return Ok(());
        }

        self.repo.upsert(username, entries, Utc::now()).await?;
        tracing::debug!(%username, properties = entries.len(), "profile saved");
        Ok(())
    }

    pub async fn all_profiles(&self, page: PageRequest) -> Result<Page<ProfileInfo>> {
        self.enumerate(ProfileFilter::default(), page).await
    }

    /// Profiles whose last activity is at or before `cutoff`.
    pub async fn inactive_profiles(
        &self,
        cutoff: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<ProfileInfo>> {
        let filter = ProfileFilter {
            inactive_since: Some(cutoff),
            ..Default::default()
        };
        self.enumerate(filter, page).await
    }

    /// Profiles whose username contains `pattern`, ignoring case.
    pub async fn find_profiles(
        &self,
        pattern: &str,
        page: PageRequest,
    ) -> Result<Page<ProfileInfo>> {
        let filter = ProfileFilter {
            pattern: Some(contains_pattern(pattern)),
            ..Default::default()
        };
        self.enumerate(filter, page).await
    }

    pub async fn find_inactive_profiles(
        &self,
        pattern: &str,
        cutoff: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<ProfileInfo>> {
        let filter = ProfileFilter {
            pattern: Some(contains_pattern(pattern)),
            inactive_since: Some(cutoff),
        };
        self.enumerate(filter, page).await
    }

    pub async fn count_inactive_profiles(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        self.repo
            .count(&ProfileFilter {
                inactive_since: Some(cutoff),
                ..Default::default()
            })
            .await
    }

    async fn enumerate(
        &self,
        filter: ProfileFilter,
        page: PageRequest,
    ) -> Result<Page<ProfileInfo>> {
        let total = self.repo.count(&filter).await?;
        let Some((offset, limit)) = page.bounds() else {
            return Ok(Page::empty(total));
        };

        Ok(Page {
            items: self.repo.page(&filter, offset, limit).await?,
            total,
        })
    }

    /// Delete every property of `usernames`. Returns deleted rows.
    pub async fn delete_profiles(&self, usernames: &[&str]) -> Result<u64> {
        if usernames.is_empty() {
            return Ok(0);
        }

        let deleted = self
            .repo
            .delete(usernames.iter().map(|u| (*u).to_owned()).collect())
            .await?;
        tracing::info!(users = usernames.len(), deleted, "profiles deleted");
        Ok(deleted)
    }

    /// Delete profiles inactive since `cutoff`. Returns deleted rows.
    pub async fn delete_inactive_profiles(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self.repo.delete_inactive(cutoff).await?;
        tracing::info!(%cutoff, deleted, "inactive profiles deleted");
        Ok(deleted)
    }
}
