//! Typed builder for NewUser.

use crate::user::NewUser;

/// [`NewUser`] builder.
///
/// `build` only exists once both the username and the password are set.
#[derive(Debug, Clone)]
pub struct UserBuilder<Name, Password> {
    username: Name,
    password: Password,
    email: String,
    approved: bool,
    password_question: Option<String>,
    password_answer: Option<String>,
}

/// Value is missing on [`UserBuilder`].
#[derive(Debug, Clone)]
pub struct Missing;

/// Value is present on [`UserBuilder`].
#[derive(Clone)]
pub struct Present<T>(pub T);

impl NewUser {
    /// Start building a [`NewUser`].
    pub fn builder() -> UserBuilder<Missing, Missing> {
        UserBuilder::new()
    }
}

impl Default for UserBuilder<Missing, Missing> {
    fn default() -> Self {
        Self::new()
    }
}

impl UserBuilder<Missing, Missing> {
    /// Create a new [`UserBuilder`].
    pub fn new() -> Self {
        Self {
            username: Missing,
            password: Missing,
            email: String::default(),
            approved: true,
            password_question: None,
            password_answer: None,
        }
    }
}

impl<Password> UserBuilder<Missing, Password> {
    /// Update `username` field on [`UserBuilder`].
    pub fn username(
        self,
        username: impl Into<String>,
    ) -> UserBuilder<Present<String>, Password> {
        UserBuilder {
            username: Present(username.into().trim().to_owned()),
            password: self.password,
            email: self.email,
            approved: self.approved,
            password_question: self.password_question,
            password_answer: self.password_answer,
        }
    }
}

impl<Name> UserBuilder<Name, Missing> {
    /// Update `password` field on [`UserBuilder`].
    pub fn password(
        self,
        password: impl Into<String>,
    ) -> UserBuilder<Name, Present<String>> {
        UserBuilder {
            username: self.username,
            password: Present(password.into()),
            email: self.email,
            approved: self.approved,
            password_question: self.password_question,
            password_answer: self.password_answer,
        }
    }
}

impl<Name, Password> UserBuilder<Name, Password> {
    /// Update `email` field on [`UserBuilder`].
    pub fn email(mut self, email: impl ToString) -> Self {
        self.email = email.to_string().trim().to_owned();
        self
    }

    /// Update `approved` field on [`UserBuilder`].
    pub fn approved(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }

    /// Set the password recovery question and its answer.
    pub fn recovery(
        mut self,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        self.password_question = Some(question.into());
        self.password_answer = Some(answer.into());
        self
    }
}

impl UserBuilder<Present<String>, Present<String>> {
    /// Build a [`NewUser`].
    pub fn build(self) -> NewUser {
        NewUser {
            username: self.username.0,
            password: self.password.0,
            email: self.email,
            approved: self.approved,
            password_question: self.password_question,
            password_answer: self.password_answer,
        }
    }
}
