//! Input side of the client: server URL, device ID and manual key override

use crate::ClientConfig;
use std::sync::{PoisonError, RwLock};

/// Source of the values the loop reads at the start of every cycle
pub trait InputSource: Send + Sync + 'static {
    fn server_url(&self) -> String;

    fn device_id(&self) -> String;

    /// Manually supplied API key; empty or `None` means "provision one"
    fn api_key(&self) -> Option<String>;
}

/// Inputs held in memory, seeded from a [`ClientConfig`] and editable at runtime
#[derive(Debug, Default)]
pub struct ConfigInputs {
    values: RwLock<Values>,
}

#[derive(Debug, Default, Clone)]
struct Values {
    server_url: String,
    device_id: String,
    api_key: Option<String>,
}

impl ConfigInputs {
    pub fn new(server_url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            values: RwLock::new(Values {
                server_url: server_url.into(),
                device_id: device_id.into(),
                api_key: None,
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let inputs = Self::new(config.server_url.clone(), config.device_id.clone());
        inputs.set_api_key(config.api_key.clone());
        inputs
    }

    pub fn set_server_url(&self, server_url: impl Into<String>) {
        self.write().server_url = server_url.into();
    }

    pub fn set_device_id(&self, device_id: impl Into<String>) {
        self.write().device_id = device_id.into();
    }

    pub fn set_api_key(&self, api_key: Option<String>) {
        self.write().api_key = api_key;
    }

    fn read(&self) -> Values {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Values> {
        self.values.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InputSource for ConfigInputs {
    fn server_url(&self) -> String {
        self.read().server_url
    }

    fn device_id(&self) -> String {
        self.read().device_id
    }

    fn api_key(&self) -> Option<String> {
        self.read().api_key.filter(|key| !key.is_empty())
    }
}
