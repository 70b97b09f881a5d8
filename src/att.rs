//! Attribute Protocol server ([Vol 3] Part F).
//!
//! [`Server`] owns the attribute [`Registry`] and hands out one [`Bearer`] per
//! connection. The bearer decodes client PDUs, checks attribute permissions
//! against the link security reported by the [`SecurityManager`], calls the
//! attribute [`Io`] capabilities, and encodes the responses.

use att_server_crypto::Signature;

pub use {
    bearer::*, config::*, consts::*, handle::*, io::*, perm::*, registry::*, sec::*, server::*,
    transport::*,
};
pub(crate) use {pdu::*, queue::*};

use crate::{Declaration, Uuid, Uuid16, UuidPacker};

mod bearer;
mod config;
mod consts;
mod handle;
mod io;
mod pdu;
mod perm;
mod queue;
mod registry;
mod rsp;
mod sec;
mod server;
mod transport;

/// Error type returned by the ATT server.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Att(#[from] ErrorRsp),
    #[error("indication for {0} is awaiting confirmation")]
    IndicationPending(Handle),
    #[error("invalid attribute handle {0}")]
    InvalidHandle(Handle),
    #[error("no buffer available for {0}")]
    NoBuffer(Opcode),
    #[error("transport failure on {0}")]
    Transport(ConnId),
}

/// Common ATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Result of a request handler. The error is sent to the peer.
pub type RspResult<T> = std::result::Result<T, ErrorRsp>;

/// `ATT_ERROR_RSP` PDU ([Vol 3] Part F, Section 3.4.1.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("ATT {req:#04X}{} failed with {err}", .hdl.map_or(String::new(), |h| format!(" for handle {:#06X}", u16::from(h))))]
pub struct ErrorRsp {
    pub(crate) req: u8,
    pub(crate) hdl: Option<Handle>,
    pub(crate) err: ErrorCode,
}

impl ErrorRsp {
    /// Creates a new error response.
    #[inline(always)]
    #[must_use]
    pub(crate) const fn new(req: u8, hdl: Option<Handle>, err: ErrorCode) -> Self {
        Self { req, hdl, err }
    }

    /// Returns the raw opcode of the request that failed.
    #[inline(always)]
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        self.req
    }

    /// Returns the handle that caused the error, if any.
    #[inline(always)]
    #[must_use]
    pub const fn hdl(&self) -> Option<Handle> {
        self.hdl
    }

    /// Returns the error code.
    #[inline(always)]
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.err
    }
}
