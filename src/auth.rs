use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use thiserror::Error;

/// Cleartext password lookup keyed on the login user: allowlisted admins
/// authenticate with their own password, everyone else with the shared one.
#[derive(Debug)]
pub struct PasswordAuthSource {
    password: String,
    admins: Arc<AdminAllowlist>,
}

impl PasswordAuthSource {
    pub fn new(password: String, admins: Arc<AdminAllowlist>) -> Self {
        Self { password, admins }
    }

    fn password_for_user(&self, user: Option<&str>) -> &str {
        user.and_then(|u| self.admins.password_for(u))
            .unwrap_or(self.password.as_str())
    }
}

#[async_trait]
impl AuthSource for PasswordAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let password = self.password_for_user(login.user());
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminListError {
    #[error("admin entry {0:?} must be user:password")]
    MissingPassword(String),
}

/// Users allowed to run administrative commands, each with its own password.
/// Empty denies everyone.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AdminAllowlist {
    credentials: HashMap<String, String>,
}

impl fmt::Debug for AdminAllowlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut users: Vec<&str> = self.credentials.keys().map(String::as_str).collect();
        users.sort_unstable();
        f.debug_struct("AdminAllowlist").field("users", &users).finish()
    }
}

impl AdminAllowlist {
    /// Parse comma-separated `user:password` entries; blanks are skipped.
    /// The password is everything after the first `:`.
    pub fn parse(list: &str) -> Result<Self, AdminListError> {
        let mut credentials = HashMap::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((user, password)) = entry.split_once(':') else {
                return Err(AdminListError::MissingPassword(entry.to_string()));
            };
            let user = user.trim();
            if user.is_empty() || password.is_empty() {
                return Err(AdminListError::MissingPassword(user.to_string()));
            }
            credentials.insert(user.to_string(), password.to_string());
        }
        Ok(Self { credentials })
    }

    pub fn is_admin(&self, user: Option<&str>) -> bool {
        user.is_some_and(|u| self.credentials.contains_key(u))
    }

    pub fn password_for(&self, user: &str) -> Option<&str> {
        self.credentials.get(user).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}
