use crate::config::RetryConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

/// Runs `action` with exponential back-off, retrying while `is_retriable`
/// holds and attempts remain. The final error is returned unchanged.
pub async fn with_retries<'a, In, F, G, R, E>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    input: &'a In,
    action: F,
    is_retriable: G,
) -> Result<R, E>
where
    In: Send + Sync,
    F: for<'b> Fn(&'b In) -> Pin<Box<dyn Future<Output = Result<R, E>> + 'b + Send>>,
    G: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1u32;
    loop {
        match action(input).await {
            Ok(result) => {
                return Ok(result);
            }
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                let delay = jittered(config, attempt);
                warn!(
                    target_label,
                    op_label,
                    op_id = op_id.as_deref(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{error}, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                info!(
                    target_label,
                    op_label,
                    op_id = op_id.as_deref(),
                    attempt,
                    "giving up: {error}"
                );
                return Err(error);
            }
        }
    }
}

fn jittered(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.delay_for_attempt(attempt);
    match config.max_jitter_factor {
        Some(factor) if factor > 0.0 => {
            let jitter = rand::rng().random_range(0.0..factor);
            base.mul_f64(1.0 + jitter)
        }
        _ => base,
    }
}
