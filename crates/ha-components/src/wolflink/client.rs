//! Wolf SmartSet client capability
//!
//! The config flow only talks to the vendor through [`WolfClient`], so the
//! HTTP implementation ([`SmartSetClient`](super::smartset::SmartSetClient))
//! can be swapped for a fake in tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A heating system registered on the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub id: i64,
    pub gateway: String,
}

impl Device {
    pub fn new(name: impl Into<String>, id: i64, gateway: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
            gateway: gateway.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WolfClientError {
    /// Portal unreachable, timed out, or failing server-side
    #[error("cannot connect to Wolf SmartSet: {0}")]
    CannotConnect(String),

    #[error("invalid Wolf SmartSet credentials")]
    InvalidAuth,

    #[error("unexpected Wolf SmartSet error: {0}")]
    Unexpected(String),
}

pub type WolfClientResult<T> = Result<T, WolfClientError>;

/// Session on the Wolf SmartSet portal for one account
#[async_trait]
pub trait WolfClient: Send + Sync {
    /// Load the portal's text resources for `locale`
    async fn load_localized_json(&self, locale: &str) -> WolfClientResult<()>;

    /// List the systems (devices) attached to the account
    async fn fetch_system_list(&self) -> WolfClientResult<Vec<Device>>;
}

/// Builds a client from (username, password)
pub type ClientFactory = Arc<dyn Fn(&str, &str) -> Box<dyn WolfClient> + Send + Sync + 'static>;
