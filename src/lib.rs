//! Membership is a user, role and profile store backed by PostgreSQL.

#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod page;
pub mod profile;
pub mod role;
pub mod telemetry;
pub mod user;

use std::sync::Arc;

pub use config::{Configuration, RoleMode};
pub use crypto::{PasswordManager, PasswordPolicy};
pub use database::Database;
pub use error::{Error, Result};
pub use page::{Page, PageRequest};
pub use profile::{ProfileInfo, ProfileStore, PropertyDefinition, PropertyValue};
pub use role::RoleStore;
pub use user::{NewUser, User, UserStore};

/// Stores sharing one pool and one configuration.
#[derive(Clone)]
pub struct Provider {
    pub config: Arc<Configuration>,
    pub db: Database,
    pub users: Arc<UserStore>,
    pub roles: Arc<RoleStore>,
    pub profiles: ProfileStore,
}

impl Provider {
    /// Connect to PostgreSQL and build every store.
    ///
    /// Migrations are not run; call [`Database::migrate`] when needed.
    pub async fn new(config: Arc<Configuration>) -> Result<Self> {
        let Some(postgres) = &config.postgres else {
            tracing::error!("missing `postgres` entry on `config.yaml` file");
            return Err(Error::Configuration("`postgres` entry is missing".into()));
        };

        let db = Database::connect(postgres).await?;
        Self::with_database(config, db)
    }

    /// Build every store on top of an existing [`Database`].
    pub fn with_database(config: Arc<Configuration>, db: Database) -> Result<Self> {
        let pwd = Arc::new(PasswordManager::new(config.argon2.clone())?);
        let policy = Arc::new(PasswordPolicy::new(config.password.clone())?);

        Ok(Self {
            users: Arc::new(UserStore::new(db.clone(), pwd, policy)),
            roles: Arc::new(RoleStore::new(db.clone(), config.roles.mode)),
            profiles: ProfileStore::new(db.clone()),
            config,
            db,
        })
    }

    /// Check a username and password pair.
    pub async fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users.validate_credentials(username, password).await
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;

    fn config(mode: &str) -> Arc<Configuration> {
        Arc::new(
            Configuration::from_yaml(&format!(
                r#"
argon2:
  memory_cost: 1024
  iterations: 1
  parallelism: 1
  hash_length: 32
roles:
  mode: {mode}
"#
            ))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_missing_postgres_section() {
        assert!(matches!(
            Provider::new(config("live")).await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_password_pattern() {
        let config = Configuration::from_yaml("password:\n  pattern: \"(\"\n").unwrap();
        let db = Database::from_pool(
            sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/membership")
                .unwrap(),
        );

        assert!(matches!(
            Provider::with_database(Arc::new(config), db),
            Err(Error::Crypto(_))
        ));
    }

    #[sqlx::test]
    async fn test_end_to_end(pool: PgPool) {
        let provider =
            Provider::with_database(config("live"), Database::from_pool(pool)).unwrap();

        provider
            .users
            .create_user(
                NewUser::builder()
                    .username("alice")
                    .password("Secret123!")
                    .email("a@x.com")
                    .recovery("First pet?", "Fluffy")
                    .build(),
            )
            .await
            .unwrap();
        assert!(provider.authenticate("alice", "Secret123!").await);
        assert!(!provider.authenticate("alice", "wrong").await);

        provider.roles.create_role("admin").await.unwrap();
        provider.roles.add_users_to_roles(&["alice"], &["admin"]).await.unwrap();
        assert!(provider.roles.is_user_in_role("alice", "admin").await.unwrap());
        assert_eq!(provider.roles.users_in_role("admin").await.unwrap(), ["alice"]);

        provider
            .profiles
            .set_properties("alice", &[("theme", Some("dark"))])
            .await
            .unwrap();
        let values = provider
            .profiles
            .get_properties(
                "alice",
                &[
                    PropertyDefinition::new("theme", None),
                    PropertyDefinition::new("lang", Some("en")),
                ],
            )
            .await
            .unwrap();
        assert_eq!(values[0].value.as_deref(), Some("dark"));
        assert_eq!(values[1].value.as_deref(), Some("en"));

        assert!(matches!(
            provider.users.reset_password("alice", "wrong-answer").await,
            Err(Error::ValidationFailure)
        ));
        assert!(provider.authenticate("alice", "Secret123!").await);

        // Memberships and profile rows leave with the user.
        assert!(provider.users.delete("alice").await.unwrap());
        assert!(provider.roles.users_in_role("admin").await.unwrap().is_empty());
        assert_eq!(
            provider.profiles.all_profiles(PageRequest::new(0, 10)).await.unwrap().total,
            0
        );
    }

    #[sqlx::test]
    async fn test_cached_roles_from_configuration(pool: PgPool) {
        let provider =
            Provider::with_database(config("cached"), Database::from_pool(pool)).unwrap();

        assert_eq!(provider.roles.mode(), RoleMode::Cached);
        assert!(provider.roles.all_roles().await.unwrap().is_empty());
        assert!(matches!(
            provider.roles.create_role("admin").await,
            Err(Error::Unsupported(_))
        ));
    }
}
