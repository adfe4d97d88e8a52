use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-password check at startup. Who the caller is comes from the
/// connection's user name, not from this source.
#[derive(Debug)]
pub struct AgendaAuthSource {
    password: String,
}

impl AgendaAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for AgendaAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Staff,
}

/// The authenticated identity a statement runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub client_id: String,
    pub role: Role,
}

impl Caller {
    pub fn is_staff(&self) -> bool {
        self.role == Role::Staff
    }
}

/// Maps connection user names to roles.
#[derive(Debug, Default)]
pub struct StaffDirectory {
    staff: HashSet<String>,
}

impl StaffDirectory {
    pub fn new(staff: impl IntoIterator<Item = String>) -> Self {
        Self {
            staff: staff.into_iter().collect(),
        }
    }

    pub fn caller(&self, user: &str) -> Caller {
        let role = if self.staff.contains(user) {
            Role::Staff
        } else {
            Role::Client
        };
        Caller {
            client_id: user.to_string(),
            role,
        }
    }
}
