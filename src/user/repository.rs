//! Handle database requests.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::database::{Database, Statement};
use crate::error::Result;
use crate::user::User;

macro_rules! user_columns {
    () => {
        "user_id, username, password_hash, email, password_question, \
         password_answer, approved, locked, regdate, last_login, \
         last_activity, last_password_changed, last_lockout"
    };
}

/// Row written by [`UserRepository::insert`].
#[derive(Debug)]
pub struct UserRecord<'a> {
    pub username: &'a str,
    pub password_hash: &'a str,
    pub email: &'a str,
    pub approved: bool,
    pub password_question: Option<&'a str>,
    pub password_answer: Option<&'a str>,
}

/// What a credential check needs to know about a user.
#[derive(Debug, FromRow)]
pub struct Credentials {
    pub username: String,
    pub password_hash: String,
}

/// Column a substring search runs on.
#[derive(Debug, Clone, Copy)]
pub enum SearchField {
    Username,
    Email,
}

#[derive(Clone, Debug)]
pub struct UserRepository {
    db: Database,
}

impl UserRepository {
    /// Create a new [`UserRepository`].
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn exists(&self, username: &str) -> Result<bool> {
        let found: Option<i64> = self
            .db
            .scalar(
                Statement::new(
                    "SELECT user_id FROM users WHERE LOWER(username) = LOWER($1)",
                )
                .bind(username),
            )
            .await?;

        Ok(found.is_some())
    }

    /// Insert [`UserRecord`] into database and return the stored [`User`].
    pub async fn insert(&self, record: &UserRecord<'_>) -> Result<User> {
        let stmt = Statement::new(concat!(
            "INSERT INTO users (username, password_hash, email, approved, \
             password_question, password_answer) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING ",
            user_columns!()
        ))
        .bind(record.username)
        .bind(record.password_hash)
        .bind(record.email)
        .bind(record.approved)
        .bind(record.password_question)
        .bind(record.password_answer);

        let mut rows = self.db.query_as::<User>(stmt).await?;
        rows.pop().ok_or(sqlx::Error::RowNotFound.into())
    }

    /// Find user using `username` field, ignoring case.
    pub async fn find(&self, username: &str) -> Result<Option<User>> {
        let stmt = Statement::new(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE LOWER(username) = LOWER($1)"
        ))
        .bind(username);

        Ok(self.db.query_as::<User>(stmt).await?.pop())
    }

    pub async fn credentials(&self, username: &str) -> Result<Option<Credentials>> {
        let stmt = Statement::new(
            "SELECT username, password_hash FROM users \
             WHERE LOWER(username) = LOWER($1)",
        )
        .bind(username);

        Ok(self.db.query_as::<Credentials>(stmt).await?.pop())
    }

    pub async fn count(&self) -> Result<i64> {
        let total = self
            .db
            .scalar(Statement::new("SELECT COUNT(*) FROM users"))
            .await?;
        Ok(total.unwrap_or_default())
    }

    /// Users ordered by username.
    pub async fn page(&self, offset: i64, limit: i64) -> Result<Vec<User>> {
        let stmt = Statement::new(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users ORDER BY username COLLATE \"C\" OFFSET $1 LIMIT $2"
        ))
        .bind(offset)
        .bind(limit);

        self.db.query_as(stmt).await
    }

    /// Count users whose `field` matches an escaped `ILIKE` pattern.
    pub async fn count_matching(
        &self,
        field: SearchField,
        pattern: &str,
    ) -> Result<i64> {
        let sql = match field {
            SearchField::Username => {
                "SELECT COUNT(*) FROM users WHERE username ILIKE $1"
            },
            SearchField::Email => {
                "SELECT COUNT(*) FROM users WHERE email ILIKE $1"
            },
        };

        let total = self.db.scalar(Statement::new(sql).bind(pattern)).await?;
        Ok(total.unwrap_or_default())
    }

    pub async fn page_matching(
        &self,
        field: SearchField,
        pattern: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<User>> {
        let sql = match field {
            SearchField::Username => concat!(
                "SELECT ",
                user_columns!(),
                " FROM users WHERE username ILIKE $1 \
                 ORDER BY username COLLATE \"C\" OFFSET $2 LIMIT $3"
            ),
            SearchField::Email => concat!(
                "SELECT ",
                user_columns!(),
                " FROM users WHERE email ILIKE $1 \
                 ORDER BY username COLLATE \"C\" OFFSET $2 LIMIT $3"
            ),
        };

        let stmt = Statement::new(sql).bind(pattern).bind(offset).bind(limit);
        self.db.query_as(stmt).await
    }

    pub async fn username_by_email(&self, email: &str) -> Result<Option<String>> {
        self.db
            .scalar(
                Statement::new(
                    "SELECT username FROM users WHERE LOWER(email) = LOWER($1) \
                     ORDER BY user_id LIMIT 1",
                )
                .bind(email),
            )
            .await
    }

    pub async fn count_active_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let total = self
            .db
            .scalar(
                Statement::new("SELECT COUNT(*) FROM users WHERE last_activity > $1")
                    .bind(since),
            )
            .await?;
        Ok(total.unwrap_or_default())
    }

    /// Replace every mutable column of `user`.
    pub async fn update(&self, user: &User) -> Result<u64> {
        let stmt = Statement::new(
            "UPDATE users SET email = $2, password_question = $3, \
             password_answer = $4, approved = $5, locked = $6, last_login = $7, \
             last_activity = $8, last_password_changed = $9, last_lockout = $10 \
             WHERE LOWER(username) = LOWER($1)",
        )
        .bind(user.username.as_str())
        .bind(user.email.as_str())
        .bind(user.password_question.clone())
        .bind(user.password_answer.clone())
        .bind(user.approved)
        .bind(user.locked)
        .bind(user.last_login_at)
        .bind(user.last_activity_at)
        .bind(user.last_password_changed_at)
        .bind(user.last_lockout_at);

        self.db.non_query(stmt).await
    }

    /// Delete the user and its profile rows. Memberships follow the foreign
    /// key.
    pub async fn delete(&self, username: &str) -> Result<bool> {
        let mut batch = self.db.begin().await?;

        let stored: Option<String> = batch
            .scalar(
                Statement::new(
                    "DELETE FROM users WHERE LOWER(username) = LOWER($1) \
                     RETURNING username",
                )
                .bind(username),
            )
            .await?;

        let Some(stored) = stored else {
            return Ok(false);
        };

        batch
            .non_query(
                Statement::new("DELETE FROM profiles WHERE LOWER(username) = LOWER($1)")
                    .bind(stored),
            )
            .await?;
        batch.commit().await?;

        Ok(true)
    }

    pub async fn set_password(
        &self,
        username: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.db
            .non_query(
                Statement::new(
                    "UPDATE users SET password_hash = $2, last_password_changed = $3 \
                     WHERE LOWER(username) = LOWER($1)",
                )
                .bind(username)
                .bind(password_hash)
                .bind(now),
            )
            .await
    }

    pub async fn set_recovery(
        &self,
        username: &str,
        question: &str,
        answer_hash: &str,
    ) -> Result<u64> {
        self.db
            .non_query(
                Statement::new(
                    "UPDATE users SET password_question = $2, password_answer = $3 \
                     WHERE LOWER(username) = LOWER($1)",
                )
                .bind(username)
                .bind(question)
                .bind(answer_hash),
            )
            .await
    }

    /// Stamp a successful login.
    pub async fn touch_login(&self, username: &str, now: DateTime<Utc>) -> Result<u64> {
        self.db
            .non_query(
                Statement::new(
                    "UPDATE users SET last_login = $2, last_activity = $2 \
                     WHERE LOWER(username) = LOWER($1)",
                )
                .bind(username)
                .bind(now),
            )
            .await
    }

    pub async fn unlock(&self, username: &str) -> Result<u64> {
        self.db
            .non_query(
                Statement::new(
                    "UPDATE users SET locked = FALSE WHERE LOWER(username) = LOWER($1)",
                )
                .bind(username),
            )
            .await
    }
}
