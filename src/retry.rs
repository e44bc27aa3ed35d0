use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Execute an async function with exponential backoff retry.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, name: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= config.max_retries => {
                error!("{name} failed after {} retries: {e}", config.max_retries);
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    "{name} failed (attempt {}/{}) retrying in {:.1}s: {e}",
                    attempt + 1,
                    config.max_retries + 1,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
