/// Sequential strategy with wraparound cursor
use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;

use super::{BalanceStrategy, PickContext, RETRY_PAUSE};
use crate::error::{DriverError, DriverResult};
use crate::topology::HostSpec;

/// Walks the configured host list with a wrapping cursor.
///
/// The first selection starts at a uniformly random index; every later
/// selection advances the cursor by one, skipping blacklisted hosts. A
/// full fruitless wrap pauses briefly and retries against a freshly
/// fetched blacklist snapshot.
#[derive(Debug, Default)]
pub struct SequentialStrategy {
    cursor: Option<usize>,
}

impl SequentialStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceStrategy for SequentialStrategy {
    async fn pick(&mut self, ctx: &mut PickContext<'_>) -> DriverResult<HostSpec> {
        let mut last_err: Option<DriverError> = None;

        for _attempt in 0..ctx.max_attempts {
            let hosts = ctx.candidates().await;
            if hosts.is_empty() {
                return Err(DriverError::internal("no hosts configured"));
            }
            let excluded = ctx.excluded().await;

            let start = match self.cursor {
                None => rand::thread_rng().gen_range(0..hosts.len()),
                Some(cursor) => (cursor + 1) % hosts.len(),
            };

            let mut found = None;
            for offset in 0..hosts.len() {
                let index = (start + offset) % hosts.len();
                if !excluded.contains(&hosts[index]) {
                    found = Some(index);
                    break;
                }
            }

            let Some(index) = found else {
                sleep(RETRY_PAUSE).await;
                continue;
            };

            self.cursor = Some(index);
            let host = hosts[index].clone();

            match ctx.acquire(&host).await {
                Ok(()) => return Ok(host),
                Err(e) if ctx.classifier.is_connection_error(&e) => {
                    tracing::debug!("host {} failed, excluding: {}", host, e);
                    ctx.exclude(&host).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(DriverError::exhausted(
            ctx.max_attempts,
            last_err.unwrap_or_else(|| DriverError::internal("no candidate hosts available")),
        ))
    }
}
