//! Explicit construction and teardown of the configured block store.

use std::sync::Arc;

use tracing::info;

use crate::config::{Backend, StorageConfig};
use crate::error::BlockServerResult;
use crate::identity::SessionSource;
use crate::local::BlockServerLocal;
use crate::logging::init_logging;
use crate::memory::BlockServerMemory;
use crate::remote::BlockServerRemote;
use crate::server::{BlockServer, BlockServerKind};

/// Install logging and build the block store `config` selects.
///
/// A remote store does not dial until its first operation.
pub async fn init(
    config: &StorageConfig,
    session: Arc<dyn SessionSource>,
) -> BlockServerResult<BlockServerKind> {
    init_logging(config.debug);
    config.validate()?;

    let server = match config.block_backend() {
        Backend::Memory => BlockServerKind::Memory(BlockServerMemory::new(config.quota_bytes)),
        Backend::Disk(root) => {
            BlockServerKind::Local(BlockServerLocal::open(root, config.quota_bytes).await?)
        }
        Backend::Remote(addr) => BlockServerKind::Remote(BlockServerRemote::new(
            addr,
            session,
            config.connection_config(),
        )),
    };
    info!(
        backend = server.name(),
        metadata = ?config.metadata_backend(),
        "block server initialized"
    );
    Ok(server)
}

/// Shut `server` down. Safe to call more than once.
pub async fn shutdown(server: &BlockServerKind) {
    server.shutdown().await;
    info!(backend = server.name(), "block server shut down");
}
