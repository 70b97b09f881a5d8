use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tracing::info;

use super::*;

/// ATT server responsible for the attribute database shared by all
/// connections.
pub struct Server {
    cfg: Config,
    db: Arc<Registry>,
    net: Arc<dyn Transport>,
    sm: Arc<dyn SecurityManager>,
}

impl Server {
    /// Creates a server with an empty attribute registry.
    #[must_use]
    pub fn new(cfg: Config, net: Arc<dyn Transport>, sm: Arc<dyn SecurityManager>) -> Self {
        Self {
            db: Arc::new(Registry::new(cfg.max_handles)),
            cfg,
            net,
            sm,
        }
    }

    /// Returns the server configuration.
    #[inline(always)]
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    /// Returns the attribute registry. It is only mutable while no
    /// [`Bearer`] exists.
    pub fn registry(&mut self) -> RegistryState<'_> {
        if Arc::strong_count(&self.db) > 1 {
            return RegistryState::Live(&self.db);
        }
        RegistryState::Mutable(Arc::make_mut(&mut self.db))
    }

    /// Creates the server state for a new connection. The registry stays
    /// live until the returned bearer is dropped.
    #[must_use]
    pub fn connect(&self, conn: ConnId) -> Bearer {
        info!("{conn} ATT bearer created");
        Bearer::new(
            conn,
            Arc::clone(&self.db),
            Arc::clone(&self.net),
            Arc::clone(&self.sm),
            &self.cfg,
        )
    }

    /// Reads the complete value of attribute `hdl` on behalf of the
    /// application, bypassing permission checks.
    pub fn read_local(&self, hdl: Handle) -> Result<Value> {
        let at = self.db.find_by_handle(hdl).ok_or(Error::InvalidHandle(hdl))?;
        (at.io().read(&local_ctx(at), 0))
            .map_err(|e| Error::Att(ErrorRsp::new(0, Some(hdl), e)))
    }

    /// Writes the complete value of attribute `hdl` on behalf of the
    /// application, bypassing permission checks.
    pub fn write_local(&self, hdl: Handle, v: &[u8]) -> Result<()> {
        let at = self.db.find_by_handle(hdl).ok_or(Error::InvalidHandle(hdl))?;
        (at.io().write(&local_ctx(at), 0, v))
            .map_err(|e| Error::Att(ErrorRsp::new(0, Some(hdl), e)))
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("cfg", &self.cfg)
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

/// Returns the I/O context of a local access.
#[inline]
const fn local_ctx(at: &Attr) -> IoCtx {
    IoCtx {
        conn: None,
        op: None,
        hdl: at.handle(),
        uuid: at.uuid(),
    }
}
