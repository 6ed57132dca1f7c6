//! Limits on what the workers of concurrent invocations may hold at once

use crate::error::CubeError;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Configured limits of a [ResourceManager]. `None` means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Limits {
    pub connections: Option<usize>,
    pub memory: Option<usize>,
    pub helpers: Option<usize>,
}

/// [ResourceManager] is shared by every invocation of the service. Workers take a helper permit
/// for the duration of their item list, a connection permit per storage server they talk to, and
/// a memory reservation sized to the source rows of each fragment they write.
///
/// Permits are always taken in that order (helper, connection, memory) and released in reverse,
/// so two workers cannot each hold what the other is waiting for.
#[derive(Debug)]
pub struct ResourceManager {
    limits: Limits,
    storage_connections: Option<Semaphore>,
    memory: Option<Semaphore>,
    helpers: Option<Semaphore>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(
        connection_limit: Option<usize>,
        memory_limit: Option<usize>,
        helper_limit: Option<usize>,
    ) -> Self {
        Self {
            limits: Limits {
                connections: connection_limit,
                memory: memory_limit,
                helpers: helper_limit,
            },
            storage_connections: connection_limit.map(Semaphore::new),
            memory: memory_limit.map(Semaphore::new),
            helpers: helper_limit.map(Semaphore::new),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Acquire a connection to a storage server.
    pub async fn storage_connection(&self) -> Result<Option<SemaphorePermit>, CubeError> {
        optional_acquire(&self.storage_connections, 1).await
    }

    /// Reserve `bytes` of memory.
    ///
    /// A request larger than the whole pool fails immediately instead of waiting forever.
    pub async fn memory(&self, bytes: usize) -> Result<Option<SemaphorePermit>, CubeError> {
        if let Some(total) = self.limits.memory {
            if bytes > total {
                return Err(CubeError::InsufficientMemory {
                    requested: bytes,
                    total,
                });
            }
        }
        optional_acquire(&self.memory, bytes).await
    }

    /// Reserve memory for transforming `rows` source rows of `row_bytes` each.
    pub async fn fragment_memory(
        &self,
        rows: u64,
        row_bytes: u64,
    ) -> Result<Option<SemaphorePermit>, CubeError> {
        let bytes = usize::try_from(rows.saturating_mul(row_bytes))?;
        self.memory(bytes).await
    }

    /// Acquire an execution helper.
    pub async fn helper(&self) -> Result<Option<SemaphorePermit>, CubeError> {
        optional_acquire(&self.helpers, 1).await
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Semaphore>,
    n: usize,
) -> Result<Option<SemaphorePermit>, CubeError> {
    let Some(sem) = sem else {
        return Ok(None);
    };
    let permit = sem.acquire_many(n.try_into()?).await?;
    Ok(Some(permit))
}
