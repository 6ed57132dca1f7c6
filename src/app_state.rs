use crate::catalog::MemoryCatalog;
use crate::cli::CommandLineArgs;
use crate::engine::Backends;
use crate::resource_manager::ResourceManager;
use crate::storage::MemoryStorage;

use std::sync::Arc;

use tracing::info;

/// Shared application state passed to each operator request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Catalog, storage and resource manager shared by every invocation.
    pub backends: Backends,
}

impl AppState {
    /// Create and return an [AppState].
    ///
    /// Registers `dbms_instances` in-memory storage servers and a default container, folder 1.
    pub async fn new(args: &CommandLineArgs) -> Self {
        let helper_limit = args
            .helper_limit
            .or_else(|| Some(num_cpus::get().saturating_sub(1).max(1)));
        let resources = ResourceManager::new(args.connection_limit, args.memory_limit, helper_limit);
        info!(limits = ?resources.limits(), "resource limits");

        let catalog = Arc::new(MemoryCatalog::new());
        for port in 0..args.dbms_instances {
            catalog.add_dbms("localhost", 5432 + port).await;
        }
        catalog.add_container("default", 1).await;

        Self {
            args: args.clone(),
            backends: Backends {
                catalog,
                storage: Arc::new(MemoryStorage::new()),
                resources: Arc::new(resources),
                pid_base: args.pid_base_url.clone(),
            },
        }
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
