use super::Inner;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Run the step loop on a tokio task until the peer connection is shut down or dropped
pub(super) fn spawn(inner: Weak<Inner>, notify: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            notify.notified().await;

            let Some(inner) = inner.upgrade() else {
                break;
            };

            inner.step();

            if inner.is_shutdown() {
                log::debug!("peer connection driver exiting");
                break;
            }
        }
    });
}
