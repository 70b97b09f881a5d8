use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::*;

/// ATT bearer ([Vol 3] Part F, Section 3.2.11). Holds the server state of a
/// single connection and processes its PDUs strictly in arrival order.
/// Dropping the bearer discards any prepared writes without committing them.
pub struct Bearer {
    conn: ConnId,
    pub(super) db: Arc<Registry>,
    net: Arc<dyn Transport>,
    pub(super) sec: SecurityGate,
    pub(super) cfg: Config,
    pub(super) mtu: u16,
    pub(super) mtu_latched: bool,
    pub(super) queue: PrepareQueue,
    indicating: Option<Handle>,
    sign_failures: u32,
    aware: ChangeAware,
}

/// Client awareness of registry changes ([Vol 3] Part G, Section 2.5.2.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum ChangeAware {
    Aware,
    /// The client was sent `DatabaseOutOfSync` and becomes aware with its
    /// next request.
    HalfAware,
    Unaware,
}

impl Bearer {
    /// Creates the server state for a new connection.
    pub(super) fn new(
        conn: ConnId,
        db: Arc<Registry>,
        net: Arc<dyn Transport>,
        sm: Arc<dyn SecurityManager>,
        cfg: &Config,
    ) -> Self {
        let seen = cfg.robust_caching.then(|| sm.db_change_seen(conn)).flatten();
        let aware = match seen {
            Some(n) if n != db.change_count() => {
                debug!("{conn} client is change-unaware ({n} != {})", db.change_count());
                ChangeAware::Unaware
            }
            _ => ChangeAware::Aware,
        };
        Self {
            conn,
            db,
            net,
            sec: SecurityGate::new(conn, sm),
            cfg: cfg.clone(),
            mtu: DEFAULT_MTU,
            mtu_latched: false,
            queue: PrepareQueue::new(cfg.prep_queue_cap, cfg.queued_write_timeout),
            indicating: None,
            sign_failures: 0,
            aware,
        }
    }

    /// Returns the connection identifier.
    #[inline(always)]
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.conn
    }

    /// Returns the effective `ATT_MTU`.
    #[inline(always)]
    #[must_use]
    pub const fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Returns the handle of the indication awaiting confirmation, if any.
    #[inline(always)]
    #[must_use]
    pub const fn outstanding_indication(&self) -> Option<Handle> {
        self.indicating
    }

    /// Returns the time when the pending prepared write transaction will be
    /// discarded, if any.
    #[inline]
    #[must_use]
    pub fn queue_deadline(&self) -> Option<Instant> {
        self.queue.deadline()
    }

    /// Waits for the prepared write idle timer to expire and discards the
    /// queue. Never completes while the queue is empty, so it can be used as
    /// one branch of a `select!` loop.
    pub async fn wait_queue_timeout(&mut self) {
        let Some(t) = self.queue.deadline() else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(t).await;
        self.expire_queue();
    }

    /// Processes a PDU received on channel `cid` and returns the response, if
    /// any ([Vol 3] Part F, Section 3.3). The response is either the request
    /// buffer reused or a new buffer from the transport.
    pub async fn deliver(&mut self, cid: Cid, pdu: Buffer) -> Option<Buffer> {
        self.expire_queue();
        let Some(&raw) = pdu.as_ref().first() else {
            warn!("{} empty PDU on {cid}", self.conn);
            return None;
        };
        trace!("{} {cid} <- {:02X?}", self.conn, pdu.as_ref());
        let op = match Opcode::try_from(raw) {
            Ok(op) if matches!(op.typ(), PduType::Req | PduType::Cmd | PduType::Cfm) => op,
            Ok(op) if matches!(op.typ(), PduType::Rsp | PduType::Ntf | PduType::Ind) => {
                warn!("{} unexpected {op}", self.conn);
                return None;
            }
            _ if Opcode::is_cmd(raw) => {
                warn!("{} unsupported command {raw:#04X}", self.conn);
                return None;
            }
            _ => {
                warn!("{} unsupported request {raw:#04X}", self.conn);
                let e = ErrorRsp::new(raw, None, ErrorCode::RequestNotSupported);
                return Some(self.sent(cid, self.error_rsp(pdu, e)));
            }
        };
        let req = match Req::decode(op, pdu.as_ref()) {
            Ok(req) => req,
            Err(e) if op.typ() == PduType::Req => {
                warn!("{} invalid {op}: {e}", self.conn);
                return Some(self.sent(cid, self.error_rsp(pdu, e)));
            }
            Err(e) => {
                warn!("{} dropped {op}: {e}", self.conn);
                return None;
            }
        };
        match req {
            Req::WriteCmd { hdl, val } => {
                if !self.check_aware() {
                    warn!("{} dropped {op} from change-unaware client", self.conn);
                    return None;
                }
                if let Err(e) = self.write_value(op, hdl, &val).await {
                    warn!("{} {e}", self.conn);
                }
                None
            }
            Req::SignedWrite { hdl, val, msg, sig } => {
                self.signed_write(cid, hdl, &val, &msg, &sig).await;
                None
            }
            Req::HandleValueCfm => {
                match self.indicating.take() {
                    Some(hdl) => debug!("{} indication for {hdl} confirmed", self.conn),
                    None => warn!("{} unexpected {op}", self.conn),
                }
                None
            }
            req => {
                let rsp = self.respond(cid, op, req, pdu).await;
                Some(self.sent(cid, rsp))
            }
        }
    }

    /// Sends an `ATT_HANDLE_VALUE_NTF` PDU ([Vol 3] Part F, Section 3.4.7.1).
    pub fn notify(&self, hdl: Handle, v: &[u8]) -> Result<()> {
        self.push_value(Opcode::HandleValueNtf, hdl, v)
    }

    /// Sends an `ATT_MULTIPLE_HANDLE_VALUE_NTF` PDU
    /// ([Vol 3] Part F, Section 3.4.7.4). Values that do not fit in the
    /// `ATT_MTU` are not sent, except that the first value is truncated.
    pub fn notify_multiple(&self, vals: &[(Handle, &[u8])]) -> Result<()> {
        let op = Opcode::MultipleHandleValueNtf;
        for &(hdl, _) in vals {
            self.db.find_by_handle(hdl).ok_or(Error::InvalidHandle(hdl))?;
        }
        let mut b = self.new_buf(op)?;
        let lim = self.rsp_lim(&b);
        b.append().u8(op);
        for (i, &(hdl, v)) in vals.iter().enumerate() {
            let avail = lim - b.len();
            if avail <= 4 || (i > 0 && 4 + v.len() > avail) {
                break;
            }
            let n = v.len().min(avail - 4);
            #[allow(clippy::cast_possible_truncation)]
            b.append().u16(hdl).u16(n as u16).put(&v[..n]);
        }
        self.transmit(b)
    }

    /// Sends an `ATT_HANDLE_VALUE_IND` PDU ([Vol 3] Part F, Section 3.4.7.2).
    /// Only one indication may be outstanding. The caller must queue others
    /// until the client confirms the current one.
    pub fn indicate(&mut self, hdl: Handle, v: &[u8]) -> Result<()> {
        if let Some(h) = self.indicating {
            return Err(Error::IndicationPending(h));
        }
        self.push_value(Opcode::HandleValueInd, hdl, v)?;
        self.indicating = Some(hdl);
        Ok(())
    }

    /// Returns the response size limit for buffer `b`.
    #[inline]
    pub(super) fn rsp_lim(&self, b: &Buffer) -> usize {
        usize::from(self.mtu).min(b.lim())
    }

    /// Returns the attribute I/O context for request `op`.
    #[inline]
    pub(super) const fn io_ctx(&self, op: Opcode, at: &Attr) -> IoCtx {
        IoCtx {
            conn: Some(self.conn),
            op: Some(op),
            hdl: at.handle(),
            uuid: at.uuid(),
        }
    }

    /// Executes request `req` and returns its response or error response.
    async fn respond(&mut self, cid: Cid, op: Opcode, req: Req, pdu: Buffer) -> Buffer {
        let mut rsp = match self.rsp_buf(op, pdu) {
            Ok(b) => b,
            Err(b) => return b,
        };
        rsp.clear();
        if let Err(e) = self.change_aware(op, &req) {
            return self.error_rsp(rsp, e);
        }
        let r = match req {
            Req::ExchangeMtu { mtu } => self.exchange_mtu(cid, &mut rsp, mtu),
            Req::FindInformation { hdls } => self.find_information(&mut rsp, hdls),
            Req::FindByTypeValue { hdls, typ, val } => {
                (self.find_by_type_value(&mut rsp, hdls, typ, &val)).await
            }
            Req::ReadByType { hdls, typ } => self.read_by_type(&mut rsp, hdls, typ).await,
            Req::Read { hdl } => self.read(&mut rsp, hdl).await,
            Req::ReadBlob { hdl, off } => self.read_blob(&mut rsp, hdl, off).await,
            Req::ReadMultiple { hdls } => self.read_multiple(&mut rsp, &hdls).await,
            Req::ReadMultipleVariable { hdls } => {
                self.read_multiple_variable(&mut rsp, &hdls).await
            }
            Req::ReadByGroupType { hdls, typ } => {
                self.read_by_group_type(&mut rsp, hdls, typ).await
            }
            Req::Write { hdl, val } => self.write(&mut rsp, hdl, &val).await,
            Req::PrepareWrite { hdl, off, val } => {
                self.prepare_write(&mut rsp, hdl, off, &val).await
            }
            Req::ExecuteWrite { commit } => self.execute_write(&mut rsp, commit).await,
            Req::WriteCmd { .. } | Req::SignedWrite { .. } | Req::HandleValueCfm => {
                op.err(ErrorCode::UnlikelyError)
            }
        };
        match r {
            Ok(()) => rsp,
            Err(e) => self.error_rsp(rsp, e),
        }
    }

    /// Updates client change awareness for request `req` and fails the request
    /// with `DatabaseOutOfSync` if the client has not seen the latest registry
    /// change.
    fn change_aware(&mut self, op: Opcode, req: &Req) -> RspResult<()> {
        let hdl = match *req {
            Req::ReadByType { typ, .. } if is_discovery(typ) => {
                self.set_aware();
                return Ok(());
            }
            Req::ReadByGroupType { .. } => {
                if self.aware == ChangeAware::Unaware {
                    self.aware = ChangeAware::HalfAware;
                }
                return Ok(());
            }
            Req::ReadByType { hdls, .. } => u16::from(hdls.start()),
            Req::Read { hdl }
            | Req::ReadBlob { hdl, .. }
            | Req::Write { hdl, .. }
            | Req::PrepareWrite { hdl, .. } => hdl,
            Req::ReadMultiple { .. }
            | Req::ReadMultipleVariable { .. }
            | Req::ExecuteWrite { .. } => 0,
            _ => return Ok(()),
        };
        if self.check_aware() {
            return Ok(());
        }
        warn!("{} database out of sync for {op}", self.conn);
        self.aware = ChangeAware::HalfAware;
        op.hdl_err(ErrorCode::DatabaseOutOfSync, hdl)
    }

    /// Returns whether the client is change-aware, completing the transition
    /// from the half-aware state.
    fn check_aware(&mut self) -> bool {
        match self.aware {
            ChangeAware::Aware => true,
            ChangeAware::HalfAware => {
                self.set_aware();
                true
            }
            ChangeAware::Unaware => false,
        }
    }

    /// Makes the client change-aware and records the registry change it has
    /// seen.
    fn set_aware(&mut self) {
        if self.aware != ChangeAware::Aware {
            debug!("{} client is change-aware", self.conn);
            self.aware = ChangeAware::Aware;
        }
        if self.cfg.robust_caching {
            self.sec.set_db_change_seen(self.db.change_count());
        }
    }

    /// Selects the response buffer for request `op`. Write requests must get
    /// a new buffer before the value is handed to the application. Other
    /// requests reuse the request buffer if it is large enough. Returns the
    /// final error response if no buffer could be allocated.
    fn rsp_buf(&self, op: Opcode, pdu: Buffer) -> std::result::Result<Buffer, Buffer> {
        let mtu = usize::from(self.mtu);
        if matches!(op, Opcode::WriteReq | Opcode::ExecuteWriteReq) {
            return self.net.request_new_buffer(mtu).ok_or_else(|| {
                let e = ErrorRsp::new(op.into(), None, ErrorCode::InsufficientResources);
                self.error_rsp(pdu, e)
            });
        }
        if pdu.lim() >= mtu {
            return Ok(pdu);
        }
        Ok(self.net.request_new_buffer(mtu).unwrap_or(pdu))
    }

    /// Encodes an `ATT_ERROR_RSP` PDU into `b`
    /// ([Vol 3] Part F, Section 3.4.1.1).
    fn error_rsp(&self, mut b: Buffer, e: ErrorRsp) -> Buffer {
        error!("{} {e}", self.conn);
        b.clear();
        (b.append().u8(Opcode::ErrorRsp).u8(e.req))
            .u16(e.hdl.map_or(0, u16::from))
            .u8(e.err);
        b
    }

    /// Verifies and executes an `ATT_SIGNED_WRITE_CMD`
    /// ([Vol 3] Part F, Section 3.4.5.4). Failures are never reported to the
    /// peer, but too many of them terminate the link.
    async fn signed_write(&mut self, cid: Cid, hdl: u16, v: &[u8], msg: &[u8], sig: &Signature) {
        if !self.cfg.signed_writes || cid != Cid::ATT {
            warn!("{} signed write not allowed on {cid}", self.conn);
            return;
        }
        let ok = (self.sec.signing_key())
            .map_or(false, |k| sig.counter() == k.counter && k.csrk.verify(msg, sig));
        if !ok {
            self.sign_failures += 1;
            warn!(
                "{} invalid signature for handle {hdl:#06X} (counter {}, failure {})",
                self.conn,
                sig.counter(),
                self.sign_failures
            );
            if self.sign_failures >= self.cfg.max_sign_failures {
                error!("{} too many signature failures, disconnecting", self.conn);
                self.net.disconnect(self.conn);
            }
            return;
        }
        self.sign_failures = 0;
        self.sec.incr_sign_counter();
        if let Err(e) = self.write_value(Opcode::SignedWriteCmd, hdl, v).await {
            warn!("{} {e}", self.conn);
        }
    }

    /// Sends a server-initiated value PDU.
    fn push_value(&self, op: Opcode, hdl: Handle, v: &[u8]) -> Result<()> {
        self.db.find_by_handle(hdl).ok_or(Error::InvalidHandle(hdl))?;
        let mut b = self.new_buf(op)?;
        let n = v.len().min(self.rsp_lim(&b) - 3);
        b.append().u8(op).u16(hdl).put(&v[..n]);
        self.transmit(b)
    }

    /// Allocates an empty buffer for a server-initiated PDU.
    fn new_buf(&self, op: Opcode) -> Result<Buffer> {
        let Some(mut b) = self.net.request_new_buffer(usize::from(self.mtu)) else {
            error!("{} no buffer for {op}", self.conn);
            return Err(Error::NoBuffer(op));
        };
        b.clear();
        Ok(b)
    }

    /// Transmits a server-initiated PDU on the ATT channel.
    fn transmit(&self, b: Buffer) -> Result<()> {
        trace!("{} {} -> {:02X?}", self.conn, Cid::ATT, b.as_ref());
        self.net.transmit(self.conn, Cid::ATT, b).map_err(|e| {
            error!("{} transmit failed: {e}", self.conn);
            e
        })
    }

    /// Logs an outbound response.
    #[inline]
    fn sent(&self, cid: Cid, b: Buffer) -> Buffer {
        trace!("{} {cid} -> {:02X?}", self.conn, b.as_ref());
        b
    }

    /// Discards the prepared write queue if its idle timer expired.
    fn expire_queue(&mut self) {
        let n = self.queue.len();
        if self.queue.expire(Instant::now()) {
            debug!("{} discarded {n} expired prepared write(s)", self.conn);
        }
    }
}

/// Returns whether Read By Type of `typ` is part of characteristic or
/// database hash discovery, which makes the client change-aware.
#[inline]
fn is_discovery(typ: Uuid) -> bool {
    const DATABASE_HASH: u16 = 0x2B2A;
    matches!(
        Declaration::of(typ),
        Some(Declaration::Include | Declaration::Characteristic)
    ) || typ.as_u16() == Some(DATABASE_HASH)
}

impl Debug for Bearer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bearer")
            .field("conn", &self.conn)
            .field("mtu", &self.mtu)
            .field("queue", &self.queue.len())
            .field("indicating", &self.indicating)
            .field("aware", &self.aware)
            .finish_non_exhaustive()
    }
}
