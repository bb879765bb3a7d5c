use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::Mutex;
use validator::Validate;

use crate::crypto::{PasswordManager, PasswordPolicy};
use crate::database::Database;
use crate::error::{Error, Result, invalid_field, is_unique_violation};
use crate::page::{Page, PageRequest, contains_pattern};
use crate::user::{NewUser, SearchField, User, UserRecord, UserRepository};

const AUTHENTICATIONS: &str = "membership_authentications_total";

/// User manager.
pub struct UserStore {
    repo: UserRepository,
    pwd: Arc<PasswordManager>,
    policy: Arc<PasswordPolicy>,
    create_lock: Mutex<()>,
}

impl UserStore {
    /// Create a new [`UserStore`].
    pub fn new(
        db: Database,
        pwd: Arc<PasswordManager>,
        policy: Arc<PasswordPolicy>,
    ) -> Self {
        Self {
            repo: UserRepository::new(db),
            pwd,
            policy,
            create_lock: Mutex::new(()),
        }
    }

    /// Create an approved or pending user without recovery question.
    pub async fn create(
        &self,
        username: &str,
        password: &str,
        email: &str,
        approved: bool,
    ) -> Result<User> {
        let user = NewUser::builder()
            .username(username)
            .password(password)
            .email(email)
            .approved(approved)
            .build();

        self.create_user(user).await
    }

    /// Create builded user.
    ///
    /// Hashes run before the critical section; only the existence check and
    /// the insert are serialized.
    pub async fn create_user(&self, user: NewUser) -> Result<User> {
        user.validate()?;
        self.policy.check(&user.password)?;
        if user.password_question.is_some() != user.password_answer.is_some() {
            return Err(invalid_field(
                "password_answer",
                "incomplete_recovery",
                "Question and answer go together.",
            )
            .into());
        }

        let password_hash = self.pwd.hash(&user.password)?;
        let answer_hash = user
            .password_answer
            .as_deref()
            .map(|answer| self.pwd.hash_answer(answer))
            .transpose()?;

        let record = UserRecord {
            username: &user.username,
            password_hash: &password_hash,
            email: &user.email,
            approved: user.approved,
            password_question: user.password_question.as_deref(),
            password_answer: answer_hash.as_deref(),
        };

        let _guard = self.create_lock.lock().await;
        if self.repo.exists(&user.username).await? {
            return Err(Error::DuplicateUser(user.username));
        }

        let inserted = self.repo.insert(&record).await;
        match inserted {
            Ok(created) => {
                tracing::info!(username = %created.username, "user created");
                Ok(created)
            },
            Err(Error::Storage(ref err)) if is_unique_violation(err) => {
                Err(Error::DuplicateUser(user.username))
            },
            Err(err) => Err(err),
        }
    }

    /// Find user using `username`, ignoring case.
    pub async fn get(&self, username: &str) -> Result<User> {
        self.repo
            .find(username)
            .await?
            .ok_or_else(|| Error::user_not_found(username))
    }

    /// Users ordered by username.
    pub async fn list(&self, page: PageRequest) -> Result<Page<User>> {
        let total = self.repo.count().await?;
        let Some((offset, limit)) = page.bounds() else {
            return Ok(Page::empty(total));
        };

        Ok(Page {
            items: self.repo.page(offset, limit).await?,
            total,
        })
    }

    /// Users whose name contains `pattern`, ignoring case.
    pub async fn find_by_name(
        &self,
        pattern: &str,
        page: PageRequest,
    ) -> Result<Page<User>> {
        self.search(SearchField::Username, pattern, page).await
    }

    /// Users whose email contains `pattern`, ignoring case.
    pub async fn find_by_email(
        &self,
        pattern: &str,
        page: PageRequest,
    ) -> Result<Page<User>> {
        self.search(SearchField::Email, pattern, page).await
    }

    async fn search(
        &self,
        field: SearchField,
        pattern: &str,
        page: PageRequest,
    ) -> Result<Page<User>> {
        let pattern = contains_pattern(pattern);
        let total = self.repo.count_matching(field, &pattern).await?;
        let Some((offset, limit)) = page.bounds() else {
            return Ok(Page::empty(total));
        };

        Ok(Page {
            items: self
                .repo
                .page_matching(field, &pattern, offset, limit)
                .await?,
            total,
        })
    }

    pub async fn username_by_email(&self, email: &str) -> Result<Option<String>> {
        self.repo.username_by_email(email.trim()).await
    }

    /// Users active during the last `window`.
    pub async fn count_online(&self, window: TimeDelta) -> Result<i64> {
        self.repo.count_active_since(Utc::now() - window).await
    }

    /// Replace mutable fields of `user`. Returns affected rows.
    pub async fn update(&self, user: &User) -> Result<u64> {
        if let Err(err) = super::validate_email(&user.email) {
            let mut errors = validator::ValidationErrors::new();
            errors.add("email", err);
            return Err(errors.into());
        }

        self.repo.update(user).await
    }

    /// Delete user with its memberships and profile.
    pub async fn delete(&self, username: &str) -> Result<bool> {
        let deleted = self.repo.delete(username).await?;
        if deleted {
            tracing::info!(%username, "user deleted");
        }
        Ok(deleted)
    }

    /// Check a username and password pair.
    ///
    /// Every failure, storage faults included, reads as `false`.
    pub async fn validate_credentials(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || password.is_empty() {
            metrics::counter!(AUTHENTICATIONS, "outcome" => "rejected").increment(1);
            return false;
        }

        match self.check_credentials(username, password).await {
            Ok(Some(stored)) => {
                if let Err(err) = self.repo.touch_login(&stored, Utc::now()).await {
                    tracing::warn!(error = %err, username = %stored, "failed to stamp login");
                }
                metrics::counter!(AUTHENTICATIONS, "outcome" => "success").increment(1);
                true
            },
            Ok(None) => {
                tracing::debug!(%username, "credentials rejected");
                metrics::counter!(AUTHENTICATIONS, "outcome" => "rejected").increment(1);
                false
            },
            Err(err) => {
                tracing::warn!(error = %err, %username, "credential check failed");
                metrics::counter!(AUTHENTICATIONS, "outcome" => "error").increment(1);
                false
            },
        }
    }

    /// Stored username when `password` matches.
    ///
    /// Approval and lockout are flags for the caller to read; they do not
    /// change the outcome.
    async fn check_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<String>> {
        let Some(credentials) = self.repo.credentials(username).await? else {
            self.pwd.burn(password);
            return Ok(None);
        };

        if self.pwd.verify(password, &credentials.password_hash) {
            Ok(Some(credentials.username))
        } else {
            Ok(None)
        }
    }

    /// Replace the password once `old_password` checks out.
    pub async fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<bool> {
        let Some(stored) = self.check_credentials(username, old_password).await? else {
            return Ok(false);
        };
        self.policy.check(new_password)?;

        let hash = self.pwd.hash(new_password)?;
        let changed = self.repo.set_password(&stored, &hash, Utc::now()).await? > 0;
        if changed {
            tracing::info!(username = %stored, "password changed");
        }
        Ok(changed)
    }

    /// Replace the recovery question and answer once `password` checks out.
    pub async fn change_password_question_and_answer(
        &self,
        username: &str,
        password: &str,
        question: &str,
        answer: &str,
    ) -> Result<bool> {
        if question.trim().is_empty() || answer.trim().is_empty() {
            return Err(invalid_field(
                "password_answer",
                "incomplete_recovery",
                "Question and answer go together.",
            )
            .into());
        }

        let Some(stored) = self.check_credentials(username, password).await? else {
            return Ok(false);
        };

        let answer_hash = self.pwd.hash_answer(answer)?;
        Ok(self.repo.set_recovery(&stored, question, &answer_hash).await? > 0)
    }

    /// Swap the password for a generated one when `answer` is right.
    ///
    /// The plaintext is only ever returned here.
    pub async fn reset_password(&self, username: &str, answer: &str) -> Result<String> {
        let user = self.get(username).await?;
        let Some(stored_answer) = user.password_answer.as_deref() else {
            tracing::debug!(%username, "reset requested without recovery answer");
            return Err(Error::ValidationFailure);
        };

        if !self.pwd.verify_answer(answer, stored_answer) {
            tracing::warn!(%username, "wrong recovery answer");
            return Err(Error::ValidationFailure);
        }

        let password = self.pwd.generate_password(&self.policy)?;
        self.store_generated(&user.username, &password).await?;
        tracing::info!(username = %user.username, "password reset");

        Ok(password)
    }

    /// Persist a generated password. The user may have left since it was read.
    async fn store_generated(&self, username: &str, password: &str) -> Result<()> {
        let hash = self.pwd.hash(password)?;
        if self.repo.set_password(username, &hash, Utc::now()).await? == 0 {
            return Err(Error::user_not_found(username));
        }
        Ok(())
    }

    /// Clear the locked flag.
    pub async fn unlock(&self, username: &str) -> Result<bool> {
        let unlocked = self.repo.unlock(username).await? > 0;
        if unlocked {
            tracing::info!(%username, "user unlocked");
        }
        Ok(unlocked)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use sqlx::PgPool;

    use super::*;
    use crate::crypto::fast_manager;
    use crate::database::Statement;
    use crate::user::NEVER;

    fn store(pool: PgPool) -> UserStore {
        UserStore::new(
            Database::from_pool(pool),
            Arc::new(fast_manager()),
            Arc::new(PasswordPolicy::default()),
        )
    }

    async fn create_alice(store: &UserStore) -> User {
        store
            .create_user(
                NewUser::builder()
                    .username("alice")
                    .password("Secret123!")
                    .email("a@x.com")
                    .recovery("First pet?", "Fluffy")
                    .build(),
            )
            .await
            .unwrap()
    }

    async fn password_hash(store: &UserStore, username: &str) -> String {
        store.get(username).await.unwrap().password_hash
    }

    #[sqlx::test]
    async fn test_create_then_authenticate(pool: PgPool) {
        let store = store(pool);

        let user = store.create("alice", "Secret123!", "a@x.com", true).await.unwrap();
        assert_eq!(user.username, "alice");
        assert!(!user.locked);
        assert!(user.never_logged_in());
        assert_eq!(user.last_password_changed_at, NEVER);
        assert_ne!(user.password_hash, "Secret123!");

        assert!(store.validate_credentials("alice", "Secret123!").await);
        assert!(store.validate_credentials("ALICE", "Secret123!").await);
        assert!(!store.validate_credentials("alice", "wrong").await);
        assert!(!store.validate_credentials("nobody", "Secret123!").await);
        assert!(!store.validate_credentials("", "Secret123!").await);
        assert!(!store.validate_credentials("alice", "").await);

        let user = store.get("alice").await.unwrap();
        assert!(!user.never_logged_in());
        assert_eq!(user.last_login_at, user.last_activity_at);
    }

    #[sqlx::test]
    async fn test_duplicate_username(pool: PgPool) {
        let store = store(pool);
        store.create("alice", "Secret123!", "a@x.com", true).await.unwrap();

        let err = store
            .create("alice", "Secret123!", "a@x.com", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateUser(name) if name == "alice"));

        let err = store
            .create("Alice", "Other456!", "b@x.com", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateUser(_)));

        assert_eq!(store.list(PageRequest::new(0, 10)).await.unwrap().total, 1);
    }

    #[sqlx::test]
    async fn test_concurrent_create_same_username(pool: PgPool) {
        let store = store(pool);

        let (first, second) = tokio::join!(
            store.create("racer", "Secret123!", "r@x.com", true),
            store.create("RACER", "Secret123!", "r@x.com", true),
        );

        assert_eq!([&first, &second].iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            [first, second]
                .into_iter()
                .any(|r| matches!(r, Err(Error::DuplicateUser(_))))
        );
        assert_eq!(store.list(PageRequest::new(0, 10)).await.unwrap().total, 1);
    }

    #[sqlx::test]
    async fn test_create_rejects_invalid_input(pool: PgPool) {
        let store = store(pool);

        let err = store.create("", "Secret123!", "", true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = store.create("bob", "short", "", true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(e) if e.field_errors().contains_key("password")));

        let err = store.create("bob", "Secret123!", "nope", true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        assert_eq!(store.list(PageRequest::new(0, 10)).await.unwrap().total, 0);
    }

    #[sqlx::test]
    async fn test_approval_and_lock_do_not_gate_credentials(pool: PgPool) {
        let store = store(pool.clone());
        store.create("pending", "Secret123!", "p@x.com", false).await.unwrap();
        store.create("locked", "Secret123!", "", true).await.unwrap();

        Database::from_pool(pool)
            .non_query(
                Statement::new("UPDATE users SET locked = TRUE WHERE username = $1")
                    .bind("locked"),
            )
            .await
            .unwrap();

        assert!(store.validate_credentials("pending", "Secret123!").await);
        assert!(!store.validate_credentials("pending", "wrong").await);
        assert!(store.validate_credentials("locked", "Secret123!").await);

        assert!(
            store
                .change_password("pending", "Secret123!", "Another456!")
                .await
                .unwrap()
        );
        assert!(store.validate_credentials("pending", "Another456!").await);
        assert!(
            store
                .change_password_question_and_answer("locked", "Secret123!", "City?", "Paris")
                .await
                .unwrap()
        );

        let pending = store.get("pending").await.unwrap();
        assert!(!pending.approved);
        assert!(store.get("locked").await.unwrap().locked);

        assert!(store.unlock("locked").await.unwrap());
        assert!(!store.get("locked").await.unwrap().locked);
        assert!(!store.unlock("nobody").await.unwrap());
    }

    #[sqlx::test]
    async fn test_get_and_delete(pool: PgPool) {
        let store = store(pool);
        create_alice(&store).await;

        assert_eq!(store.get("ALICE").await.unwrap().username, "alice");
        assert!(matches!(
            store.get("bob").await,
            Err(Error::NotFound { entity: "user", .. })
        ));

        assert!(store.delete("Alice").await.unwrap());
        assert!(!store.delete("alice").await.unwrap());
        assert!(matches!(store.get("alice").await, Err(Error::NotFound { .. })));
    }

    #[sqlx::test]
    async fn test_list_pages_are_exhaustive(pool: PgPool) {
        let store = store(pool);
        let names = ["erin", "bob", "alice", "frank", "dave", "carol", "gina"];
        for name in names {
            store.create(name, "Secret123!", "", true).await.unwrap();
        }

        let mut seen = Vec::new();
        for index in 0..4 {
            let page = store.list(PageRequest::new(index, 2)).await.unwrap();
            assert_eq!(page.total, names.len() as i64);
            assert!(page.items.len() <= 2);
            seen.extend(page.items.into_iter().map(|u| u.username));
        }

        let mut expected: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), names.len());

        let empty = store.list(PageRequest::new(-1, 2)).await.unwrap();
        assert!(empty.items.is_empty());
        assert_eq!(empty.total, names.len() as i64);
        assert!(store.list(PageRequest::new(0, 0)).await.unwrap().items.is_empty());
    }

    #[sqlx::test]
    async fn test_search(pool: PgPool) {
        let store = store(pool);
        store.create("dave_smith", "Secret123!", "dave@corp.io", true).await.unwrap();
        store.create("davesmith", "Secret123!", "ds@home.net", true).await.unwrap();
        store.create("alice", "Secret123!", "a@corp.io", true).await.unwrap();

        let page = store.find_by_name("DAVE", PageRequest::new(0, 10)).await.unwrap();
        assert_eq!(page.total, 2);

        // `_` is matched literally.
        let page = store.find_by_name("e_s", PageRequest::new(0, 10)).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].username, "dave_smith");

        let page = store.find_by_email("corp.io", PageRequest::new(0, 1)).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].username, "alice");

        assert_eq!(
            store.username_by_email("DS@home.net").await.unwrap().as_deref(),
            Some("davesmith")
        );
        assert_eq!(store.username_by_email("x@y.z").await.unwrap(), None);
    }

    #[sqlx::test]
    async fn test_count_online(pool: PgPool) {
        let store = store(pool);
        store.create("alice", "Secret123!", "", true).await.unwrap();
        store.create("bob", "Secret123!", "", true).await.unwrap();

        assert_eq!(store.count_online(TimeDelta::minutes(15)).await.unwrap(), 0);
        assert!(store.validate_credentials("bob", "Secret123!").await);
        assert_eq!(store.count_online(TimeDelta::minutes(15)).await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn test_update(pool: PgPool) {
        let store = store(pool);
        let mut user = create_alice(&store).await;

        user.email = "new@x.com".into();
        user.approved = false;
        assert_eq!(store.update(&user).await.unwrap(), 1);

        let stored = store.get("alice").await.unwrap();
        assert_eq!(stored.email, "new@x.com");
        assert!(!stored.approved);

        user.username = "ghost".into();
        assert_eq!(store.update(&user).await.unwrap(), 0);

        user.email = "broken".into();
        assert!(matches!(store.update(&user).await, Err(Error::InvalidInput(_))));
    }

    #[sqlx::test]
    async fn test_change_password(pool: PgPool) {
        let store = store(pool);
        create_alice(&store).await;

        assert!(!store.change_password("alice", "wrong", "Another456!").await.unwrap());
        assert!(matches!(
            store.change_password("alice", "Secret123!", "short").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(store.change_password("alice", "Secret123!", "Another456!").await.unwrap());

        assert!(!store.validate_credentials("alice", "Secret123!").await);
        assert!(store.validate_credentials("alice", "Another456!").await);
        assert_ne!(store.get("alice").await.unwrap().last_password_changed_at, NEVER);
    }

    #[sqlx::test]
    async fn test_change_question_and_answer(pool: PgPool) {
        let store = store(pool);
        create_alice(&store).await;

        assert!(
            !store
                .change_password_question_and_answer("alice", "wrong", "City?", "Paris")
                .await
                .unwrap()
        );
        assert!(
            store
                .change_password_question_and_answer("alice", "Secret123!", "City?", "Paris")
                .await
                .unwrap()
        );

        let user = store.get("alice").await.unwrap();
        assert_eq!(user.password_question.as_deref(), Some("City?"));
        assert!(store.reset_password("alice", "Fluffy").await.is_err());
        assert!(store.reset_password("alice", "paris").await.is_ok());
    }

    #[sqlx::test]
    async fn test_reset_password(pool: PgPool) {
        let store = store(pool);
        create_alice(&store).await;
        let before = password_hash(&store, "alice").await;

        assert!(matches!(
            store.reset_password("alice", "wrong-answer").await,
            Err(Error::ValidationFailure)
        ));
        assert_eq!(password_hash(&store, "alice").await, before);
        assert!(store.validate_credentials("alice", "Secret123!").await);

        assert!(matches!(
            store.reset_password("bob", "Fluffy").await,
            Err(Error::NotFound { .. })
        ));

        let generated = store.reset_password("alice", " fluffy ").await.unwrap();
        assert!(generated.len() >= crate::crypto::GENERATED_MIN_LENGTH);
        assert!(store.validate_credentials("alice", &generated).await);
        assert!(!store.validate_credentials("alice", "Secret123!").await);
    }

    #[sqlx::test]
    async fn test_generated_password_needs_a_row(pool: PgPool) {
        let store = store(pool);
        create_alice(&store).await;
        store.delete("alice").await.unwrap();

        assert!(matches!(
            store.store_generated("alice", "Generated1!").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[sqlx::test]
    async fn test_reset_without_answer(pool: PgPool) {
        let store = store(pool);
        store.create("bob", "Secret123!", "", true).await.unwrap();

        assert!(matches!(
            store.reset_password("bob", "anything").await,
            Err(Error::ValidationFailure)
        ));
    }
}
