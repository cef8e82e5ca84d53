use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::Actor;

/// Shared-password check. Who the user really is stays outside the server.
#[derive(Debug)]
pub struct ChairbookAuthSource {
    password: String,
}

impl ChairbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ChairbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Maps login users to the role they act in.
#[derive(Debug, Clone, Default)]
pub struct Roles {
    operators: HashSet<String>,
}

impl Roles {
    pub fn new(operators: impl IntoIterator<Item = String>) -> Self {
        Self {
            operators: operators.into_iter().collect(),
        }
    }

    pub fn actor_for(&self, user: &str) -> Actor {
        if self.operators.contains(user) {
            Actor::Operator
        } else {
            Actor::Client
        }
    }
}
