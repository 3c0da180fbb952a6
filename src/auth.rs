use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-secret auth: every storefront user logs in with the server password.
#[derive(Debug)]
pub struct VelocitaAuthSource {
    password: Vec<u8>,
}

impl VelocitaAuthSource {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into().into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for VelocitaAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.clone()))
    }
}
