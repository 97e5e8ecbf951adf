/// Affinity-ordered strategy
use async_trait::async_trait;
use std::collections::HashSet;

use super::{BalanceStrategy, PickContext, RandomStrategy};
use crate::error::{DriverError, DriverResult};
use crate::topology::HostSpec;

/// Tries an explicit host preference order first, falling back to the
/// random strategy once the affinity list is exhausted or unset.
///
/// Affinity entries that are blacklisted or no longer part of the
/// configured topology are skipped.
pub struct AffinityStrategy {
    order: Vec<HostSpec>,
    fallback: RandomStrategy,
}

impl AffinityStrategy {
    pub fn new(order: Vec<HostSpec>) -> Self {
        Self {
            order,
            fallback: RandomStrategy::new(),
        }
    }
}

#[async_trait]
impl BalanceStrategy for AffinityStrategy {
    async fn pick(&mut self, ctx: &mut PickContext<'_>) -> DriverResult<HostSpec> {
        let mut last_err: Option<DriverError> = None;
        let mut attempts_used = 0u32;

        let excluded = ctx.excluded().await;
        let configured: HashSet<HostSpec> = ctx.candidates().await.into_iter().collect();

        for host in self.order.clone() {
            if attempts_used >= ctx.max_attempts {
                break;
            }
            if excluded.contains(&host) || !configured.contains(&host) {
                continue;
            }

            attempts_used += 1;
            match ctx.acquire(&host).await {
                Ok(()) => return Ok(host),
                Err(e) if ctx.classifier.is_connection_error(&e) => {
                    tracing::debug!("affinity host {} failed, excluding: {}", host, e);
                    ctx.exclude(&host).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let total = ctx.max_attempts;
        let remaining = total.saturating_sub(attempts_used);
        if remaining == 0 {
            return Err(DriverError::exhausted(
                total,
                last_err.unwrap_or_else(|| DriverError::internal("affinity list exhausted")),
            ));
        }

        ctx.max_attempts = remaining;
        match self.fallback.pick(ctx).await {
            Err(DriverError::Exhausted { last, .. }) => {
                Err(DriverError::Exhausted {
                    attempts: total,
                    last,
                })
            }
            other => other,
        }
    }
}
