//! Handle profile database requests.

use chrono::{DateTime, Utc};

use crate::database::{Database, Statement};
use crate::error::Result;
use crate::profile::ProfileInfo;

/// Narrows profile enumerations. `None` fields do not filter.
#[derive(Debug, Default, Clone)]
pub struct ProfileFilter {
    /// Escaped `ILIKE` pattern on the username.
    pub pattern: Option<String>,
    /// Last activity at or before this instant.
    pub inactive_since: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct ProfileRepository {
    db: Database,
}

impl ProfileRepository {
    /// Create a new [`ProfileRepository`].
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stored `(property_name, property_value)` pairs among `names`.
    pub async fn values(
        &self,
        username: &str,
        names: Vec<String>,
    ) -> Result<Vec<(String, Option<String>)>> {
        self.db
            .query_as(
                Statement::new(
                    "SELECT property_name, property_value FROM profiles \
                     WHERE username = $1 AND property_name = ANY($2)",
                )
                .bind(username)
                .bind(names),
            )
            .await
    }

    /// Upsert every entry and refresh the activity of all `username` rows.
    pub async fn upsert(
        &self,
        username: &str,
        entries: &[(&str, Option<&str>)],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut batch = self.db.begin().await?;

        for (name, value) in entries {
            batch
                .non_query(
                    Statement::new(
                        "INSERT INTO profiles \
                         (username, property_name, property_value, last_activity_date) \
                         VALUES ($1, $2, $3, $4) \
                         ON CONFLICT (username, property_name) \
                         DO UPDATE SET property_value = EXCLUDED.property_value",
                    )
                    .bind(username)
                    .bind(*name)
                    .bind(*value)
                    .bind(now),
                )
                .await?;
        }

        batch
            .non_query(
                Statement::new(
                    "UPDATE profiles SET last_activity_date = $2 WHERE username = $1",
                )
                .bind(username)
                .bind(now),
            )
            .await?;

        batch.commit().await
    }

    /// Number of usernames matching `filter`.
    pub async fn count(&self, filter: &ProfileFilter) -> Result<i64> {
        let total = self
            .db
            .scalar(
                Statement::new(
                    "SELECT COUNT(*) FROM (SELECT username FROM profiles \
                     WHERE ($1::TEXT IS NULL OR username ILIKE $1) \
                     GROUP BY username \
                     HAVING ($2::TIMESTAMPTZ IS NULL OR MAX(last_activity_date) <= $2)) AS p",
                )
                .bind(filter.pattern.clone())
                .bind(filter.inactive_since),
            )
            .await?;

        Ok(total.unwrap_or_default())
    }

    /// One [`ProfileInfo`] per username matching `filter`, ordered by
    /// username.
    pub async fn page(
        &self,
        filter: &ProfileFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ProfileInfo>> {
        self.db
            .query_as(
                Statement::new(
                    "SELECT username, MAX(last_activity_date) AS last_activity, \
                     COUNT(*) AS property_count FROM profiles \
                     WHERE ($1::TEXT IS NULL OR username ILIKE $1) \
                     GROUP BY username \
                     HAVING ($2::TIMESTAMPTZ IS NULL OR MAX(last_activity_date) <= $2) \
                     ORDER BY username COLLATE \"C\" OFFSET $3 LIMIT $4",
                )
                .bind(filter.pattern.clone())
                .bind(filter.inactive_since)
                .bind(offset)
                .bind(limit),
            )
            .await
    }

    pub async fn delete(&self, usernames: Vec<String>) -> Result<u64> {
        self.db
            .non_query(
                Statement::new("DELETE FROM profiles WHERE username = ANY($1)")
                    .bind(usernames),
            )
            .await
    }

    pub async fn delete_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.db
            .non_query(
                Statement::new(
                    "DELETE FROM profiles WHERE username IN (\
                     SELECT username FROM profiles GROUP BY username \
                     HAVING MAX(last_activity_date) <= $1)",
                )
                .bind(cutoff),
            )
            .await
    }
}
