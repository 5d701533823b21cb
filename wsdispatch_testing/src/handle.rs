//! Helpers around [`ConnectionHandle`].

use wsdispatch::ConnectionHandle;

use crate::socket::WAIT_LIMIT;

/// Wait until every delivered frame has been settled.
///
/// # Panics
///
/// Panics if frames are still pending after [`WAIT_LIMIT`].
pub async fn wait_idle(handle: &ConnectionHandle) {
    let wait = async {
        while handle.pending() > 0 {
            tokio::task::yield_now().await;
        }
    };
    tokio::time::timeout(WAIT_LIMIT, wait)
        .await
        .expect("frames still pending");
}
