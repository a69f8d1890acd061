use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::schemas::CallbackPayload;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deliver one job completion to the consumer's callback endpoint.
///
/// Best effort, exactly one attempt. Returns true only when the consumer
/// answered 2xx; every other outcome is logged and reported as false so the
/// caller can record the miss without retrying.
pub async fn send_callback(client: &Client, callback_url: &str, payload: &CallbackPayload) -> bool {
    let send = client
        .post(callback_url)
        .json(payload)
        .timeout(CALLBACK_TIMEOUT)
        .send()
        .await;

    match send {
        Ok(res) if res.status().is_success() => {
            info!(
                "Callback delivered for request {} ({})",
                payload.request_id, payload.status
            );
            true
        }
        Ok(res) => {
            warn!(
                "Callback for request {} rejected with status {}",
                payload.request_id,
                res.status()
            );
            false
        }
        Err(e) => {
            warn!(
                "Callback for request {} failed to send: {}",
                payload.request_id, e
            );
            false
        }
    }
}
