use std::time::Duration;

use crate::error::TransferError;

pub const DEFAULT_USER_AGENT: &str = concat!("vodweave/", env!("CARGO_PKG_VERSION"));

/// Configurable options for the HTTP side of the transfer engine.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Time to establish the initial connection.
    pub connect_timeout: Duration,
    /// Maximum time between received data chunks.
    pub read_timeout: Duration,
    pub user_agent: String,
    pub follow_redirects: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            follow_redirects: true,
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, TransferError> {
        let redirect = if self.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .user_agent(self.user_agent.clone())
            .redirect(redirect)
            .build()
            .map_err(TransferError::from)
    }
}
