//! Device provisioning: exchange the device ID for an API key

use crate::api::{HEADER_ID, SETUP_PATH, SetupResponse, endpoint};
use crate::{ApiRequest, ClientError, Presenter, Transport};
use std::sync::Arc;

/// Obtains the API key for a device, or reuses one already known
pub struct Provisioner {
    transport: Arc<dyn Transport>,
    presenter: Arc<dyn Presenter>,
}

impl Provisioner {
    pub fn new(transport: Arc<dyn Transport>, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            transport,
            presenter,
        }
    }

    /// Return an API key for `device_id`.
    ///
    /// A non-empty `cached_key` is returned as is without contacting the
    /// server. Otherwise the setup endpoint is called, its image is shown, and
    /// the issued key is returned for the caller to cache.
    pub async fn provision(
        &self,
        server_url: &str,
        device_id: &str,
        cached_key: Option<&str>,
    ) -> Result<String, ClientError> {
        if server_url.is_empty() {
            return Err(ClientError::Config("API server is not set".into()));
        }

        if device_id.is_empty() {
            return Err(ClientError::Config("Device ID is required".into()));
        }

        if let Some(key) = cached_key.filter(|key| !key.is_empty()) {
            tracing::debug!("Using cached API key for device {}", device_id);
            return Ok(key.to_string());
        }

        let request = ApiRequest::get(endpoint(server_url, SETUP_PATH)?).header(HEADER_ID, device_id);
        let response = self.transport.send(request).await?;
        response.ensure_ok()?;

        let setup: SetupResponse = response.json()?;
        tracing::debug!("Setup: {:?}", setup);

        if !setup.is_success() {
            return Err(ClientError::Api {
                status: setup.status,
            });
        }

        if setup.image_url.is_empty() {
            tracing::warn!("Setup response carried no image URL");
        } else {
            self.presenter.show_image(&setup.image_url);
        }

        tracing::info!("Device {} provisioned", device_id);
        Ok(setup.api_key)
    }
}
