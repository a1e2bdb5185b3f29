use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Shared-password login. Every user name is accepted; the name becomes the caller identity
/// the permission layer checks against.
#[derive(Debug)]
pub struct TemporaAuthSource {
    password: String,
}

impl TemporaAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TemporaAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!("login attempt as {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
