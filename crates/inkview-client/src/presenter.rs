//! Output side of the client: where images, control state and alerts go

/// Receives the side effects of provisioning and polling.
///
/// Calls are made from the loop's task without any internal lock held, so an
/// implementation may call back into the loop (for example to stop it).
pub trait Presenter: Send + Sync + 'static {
    /// Display the image at `url`
    fn show_image(&self, url: &str);

    /// `true` when the loop starts (stop enabled, start disabled),
    /// `false` when it stops (start enabled, stop disabled)
    fn set_controls_enabled(&self, running: bool);

    /// Surface a fatal error to the user
    fn alert(&self, message: &str);
}

/// Presenter that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPresenter;

impl Presenter for LogPresenter {
    fn show_image(&self, url: &str) {
        tracing::info!("Showing image {}", url);
    }

    fn set_controls_enabled(&self, running: bool) {
        if running {
            tracing::info!("Refresh loop running");
        } else {
            tracing::info!("Refresh loop stopped");
        }
    }

    fn alert(&self, message: &str) {
        tracing::error!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_log_presenter_as_trait_object() {
        let presenter: Arc<dyn Presenter> = Arc::new(LogPresenter);
        presenter.set_controls_enabled(true);
        presenter.show_image("https://x.test/a.png");
        presenter.alert("HTTP status code (500) does not indicate success");
        presenter.set_controls_enabled(false);
    }
}
