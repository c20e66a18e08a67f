//! Bounded pool of permits for toolchain invocations.

use crate::error::{ResolveError, ResolveResult};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Default number of concurrent toolchain processes.
pub const DEFAULT_CAPACITY: usize = 20;

/// Counting pool that caps the number of concurrently running toolchain
/// processes.
///
/// Waiting for a permit is cancel safe: a caller that stops waiting (its
/// future is dropped, or its cancellation token fires) never consumes one.
#[derive(Clone, Debug)]
pub struct Pool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Pool {
    pub fn new(capacity: usize) -> ResolveResult<Self> {
        if capacity == 0 {
            return Err(ResolveError::Config(
                "pool capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Wait until a permit is free.
    pub async fn acquire(&self) -> ResolveResult<PoolToken> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ResolveError::Cancelled)?;
        Ok(PoolToken {
            permit: Some(permit),
        })
    }

    /// Wait until a permit is free or `cancel` fires, whichever comes first.
    pub async fn acquire_until(&self, cancel: &CancellationToken) -> ResolveResult<PoolToken> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResolveError::Cancelled),
            token = self.acquire() => token,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held permit. Released by [`PoolToken::release`] or on drop.
#[derive(Debug)]
pub struct PoolToken {
    permit: Option<OwnedSemaphorePermit>,
}

impl PoolToken {
    /// Return the permit to the pool. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}
