//! Cryptographic logics.
//!
//! Passwords and security answers are hashed with Argon2id and stored as
//! PHC strings, so the parameters and the salt travel with the hash.

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use regex_lite::Regex;
use validator::{ValidationError, ValidationErrors};

use crate::config::{Argon2 as ArgonConfig, PasswordRules};

/// Minimum length of a generated password.
pub const GENERATED_MIN_LENGTH: usize = 12;
/// Minimum count of non-alphanumeric characters in a generated password.
pub const GENERATED_MIN_SYMBOLS: usize = 3;
const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+[]{};:,.?";
const GENERATION_ATTEMPTS: usize = 100;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
    #[error("password pattern is not a valid regex: {0}")]
    Pattern(#[from] regex_lite::Error),
    #[error("no generated password satisfied the policy after {0} attempts")]
    Generation(usize),
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash password using Argon2id with a fresh random salt.
    pub fn hash(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify password against a PHC string.
    ///
    /// Malformed or unsupported hashes simply do not match.
    pub fn verify(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: impl AsRef<str>,
    ) -> bool {
        match PasswordHash::new(phc_hash.as_ref()) {
            Ok(parsed) => self
                .argon2()
                .verify_password(password.as_ref(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Spend the same work as a verification without any stored hash.
    pub fn burn(&self, password: impl AsRef<[u8]>) {
        let _ = self.hash(password);
    }

    /// Hash a security answer. Answers compare case-insensitively.
    pub fn hash_answer(&self, answer: &str) -> Result<String> {
        self.hash(normalize_answer(answer))
    }

    /// Verify a security answer against its stored hash.
    pub fn verify_answer(&self, answer: &str, phc_hash: &str) -> bool {
        self.verify(normalize_answer(answer), phc_hash)
    }

    /// Generate a random password that also satisfies `policy`.
    ///
    /// Candidates are drawn until one passes [`PasswordPolicy::check`], which
    /// only matters when a pattern is configured.
    pub fn generate_password(&self, policy: &PasswordPolicy) -> Result<String> {
        let length = policy.min_length.max(GENERATED_MIN_LENGTH);
        let symbols = policy
            .min_non_alphanumeric
            .max(GENERATED_MIN_SYMBOLS)
            .min(length);

        for _ in 0..GENERATION_ATTEMPTS {
            let candidate = random_password(length, symbols);
            if policy.check(&candidate).is_ok() {
                return Ok(candidate);
            }
        }

        Err(CryptoError::Generation(GENERATION_ATTEMPTS))
    }
}

fn random_password(length: usize, symbols: usize) -> String {
    let mut chars: Vec<char> = (0..length - symbols)
        .map(|_| OsRng.sample(Alphanumeric) as char)
        .collect();
    chars.extend(
        (0..symbols).map(|_| SYMBOLS[OsRng.gen_range(0..SYMBOLS.len())] as char),
    );
    chars.shuffle(&mut OsRng);

    chars.into_iter().collect()
}

fn normalize_answer(answer: &str) -> String {
    answer.trim().to_lowercase()
}

/// Rules a new password must satisfy.
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub min_non_alphanumeric: usize,
    pattern: Option<Regex>,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        let rules = PasswordRules::default();
        Self {
            min_length: rules.min_length,
            min_non_alphanumeric: rules.min_non_alphanumeric,
            pattern: None,
        }
    }
}

impl PasswordPolicy {
    /// Create a new [`PasswordPolicy`] from configuration.
    pub fn new(rules: Option<PasswordRules>) -> Result<Self> {
        let rules = rules.unwrap_or_default();
        let pattern = rules.pattern.as_deref().map(Regex::new).transpose()?;

        Ok(Self {
            min_length: rules.min_length,
            min_non_alphanumeric: rules.min_non_alphanumeric,
            pattern,
        })
    }

    /// Check `password`, reporting every broken rule on the `password` field.
    pub fn check(
        &self,
        password: &str,
    ) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if password.chars().count() < self.min_length {
            errors.add(
                "password",
                ValidationError::new("too_short")
                    .with_message("Password is too short.".into()),
            );
        }

        let symbols = password.chars().filter(|c| !c.is_alphanumeric()).count();
        if symbols < self.min_non_alphanumeric {
            errors.add(
                "password",
                ValidationError::new("missing_symbols").with_message(
                    "Password needs more non-alphanumeric characters.".into(),
                ),
            );
        }

        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(password) {
                errors.add(
                    "password",
                    ValidationError::new("pattern")
                        .with_message("Password does not match pattern.".into()),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
pub(crate) fn fast_manager() -> PasswordManager {
    PasswordManager::new(Some(ArgonConfig {
        memory_cost: 1024,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    }))
    .unwrap()
}
