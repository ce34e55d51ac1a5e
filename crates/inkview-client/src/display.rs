//! Display refresh: fetch the current image and the next refresh interval

use crate::api::{
    DISPLAY_PATH, DisplayResponse, HEADER_ACCESS_TOKEN, HEADER_ID, HEADER_REFRESH_RATE, endpoint,
};
use crate::{ApiRequest, ClientError, Presenter, Transport};
use std::sync::Arc;
use std::time::Duration;

/// Result of a successful display fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayUpdate {
    pub image_url: String,
    /// Interval to wait before the next fetch
    pub refresh_interval: Duration,
}

/// Fetches the image a device should display
pub struct DisplayFetcher {
    transport: Arc<dyn Transport>,
    presenter: Arc<dyn Presenter>,
}

impl DisplayFetcher {
    pub fn new(transport: Arc<dyn Transport>, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            transport,
            presenter,
        }
    }

    /// Fetch and show the current image.
    ///
    /// `current_interval` is advertised to the server in the `Refresh-Rate`
    /// header and kept when the response carries no usable refresh rate.
    pub async fn fetch(
        &self,
        server_url: &str,
        device_id: &str,
        api_key: &str,
        current_interval: Duration,
    ) -> Result<DisplayUpdate, ClientError> {
        if server_url.is_empty() {
            return Err(ClientError::Config("API server is not set".into()));
        }

        if api_key.is_empty() {
            return Err(ClientError::Config("API key is not set".into()));
        }

        let request = ApiRequest::get(endpoint(server_url, DISPLAY_PATH)?)
            .header(HEADER_ID, device_id)
            .header(HEADER_ACCESS_TOKEN, api_key)
            .header(HEADER_REFRESH_RATE, advertised_secs(current_interval).to_string());

        let response = self.transport.send(request).await?;
        response.ensure_ok()?;

        let body: DisplayResponse = response.json()?;
        tracing::debug!("Display: {:?}", body);

        if !body.is_success() {
            return Err(ClientError::Api {
                status: body.status,
            });
        }

        if body.image_url.is_empty() {
            tracing::warn!("Display response carried no image URL");
        } else {
            self.presenter.show_image(&body.image_url);
        }

        let refresh_interval = match body.refresh_rate_secs() {
            Some(secs) => {
                tracing::info!("Setting refresh frequency to {} seconds", secs);
                Duration::from_secs(secs)
            }
            None => {
                if let Some(raw) = &body.refresh_rate {
                    tracing::warn!("Ignoring unusable refresh rate {}", raw);
                }
                current_interval
            }
        };

        Ok(DisplayUpdate {
            image_url: body.image_url,
            refresh_interval,
        })
    }
}

/// Interval rounded to whole seconds
fn advertised_secs(interval: Duration) -> u64 {
    ((interval.as_millis() + 500) / 1000) as u64
}
