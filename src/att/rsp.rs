use std::sync::Arc;

use tracing::debug;

use super::*;

/// MTU exchange ([Vol 3] Part F, Section 3.4.2).
impl Bearer {
    /// Handles `ATT_EXCHANGE_MTU_REQ` ([Vol 3] Part F, Section 3.4.2.1). The
    /// first exchange latches the effective MTU. Later exchanges are answered
    /// but do not change it.
    pub(super) fn exchange_mtu(&mut self, cid: Cid, rsp: &mut Buffer, mtu: u16) -> RspResult<()> {
        if cid != Cid::ATT {
            return Opcode::ExchangeMtuReq.err(ErrorCode::RequestNotSupported);
        }
        let srv = self.cfg.server_mtu();
        if self.mtu_latched {
            debug!("{} ignoring repeated MTU exchange ({mtu})", self.conn());
        } else {
            self.mtu = mtu.max(DEFAULT_MTU).min(srv);
            self.mtu_latched = true;
            debug!("{} ATT_MTU={}", self.conn(), self.mtu);
        }
        rsp.append().u8(Opcode::ExchangeMtuRsp).u16(srv);
        Ok(())
    }
}

/// Find information ([Vol 3] Part F, Section 3.4.3).
impl Bearer {
    /// Handles `ATT_FIND_INFORMATION_REQ` ([Vol 3] Part F, Section 3.4.3.1).
    /// All entries in the response share the UUID width of the first one.
    pub(super) fn find_information(&self, rsp: &mut Buffer, hdls: HandleRange) -> RspResult<()> {
        let lim = self.rsp_lim(rsp);
        let mut it = self.db.range(hdls);
        let Some(first) = it.next() else {
            return Opcode::FindInformationReq.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
        };
        let w = first.uuid().enc_len();
        let fmt = if w == Uuid16::BYTES { 0x01 } else { 0x02 };
        rsp.append().u8(Opcode::FindInformationRsp).u8(fmt);
        for at in std::iter::once(first).chain(it) {
            if at.uuid().enc_len() != w || rsp.len() + 2 + w > lim {
                break;
            }
            rsp.append().u16(at.handle()).uuid(at.uuid());
        }
        Ok(())
    }

    /// Handles `ATT_FIND_BY_TYPE_VALUE_REQ` ([Vol 3] Part F, Section 3.4.3.3).
    /// Each match is reported with the last handle of its group. Finding the
    /// group end may look past the end of the requested range.
    pub(super) async fn find_by_type_value(
        &self,
        rsp: &mut Buffer,
        hdls: HandleRange,
        typ: Uuid,
        val: &[u8],
    ) -> RspResult<()> {
        let op = Opcode::FindByTypeValueReq;
        let lim = self.rsp_lim(rsp);
        rsp.append().u8(Opcode::FindByTypeValueRsp);
        let put = |rsp: &mut Buffer, first: Handle, last: Handle| {
            if rsp.len() + 4 > lim {
                return false;
            }
            rsp.append().u16(first).u16(last);
            true
        };
        let mut group: Option<(Handle, Handle)> = None;
        for at in self.db.range(HandleRange::new(hdls.start(), Handle::MAX)) {
            if let Some((first, last)) = group {
                if !ends_group(typ, at.uuid()) {
                    group = Some((first, at.handle()));
                    continue;
                }
                group = None;
                if !put(rsp, first, last) {
                    break;
                }
            }
            if at.handle() > hdls.end() {
                break;
            }
            if at.uuid() != typ {
                continue;
            }
            let v = match self.read_value(op, at, 0).await {
                Ok(v) => v,
                Err(e) => return op.hdl_err(e.err, hdls.start()),
            };
            if v.len() <= Uuid::BYTES && v.as_slice() == val {
                group = Some((at.handle(), at.handle()));
            }
        }
        if let Some((first, last)) = group {
            put(rsp, first, last);
        }
        if rsp.len() == 1 {
            return op.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
        }
        Ok(())
    }
}

/// Returns whether an attribute of type `at` ends a group of type `typ`.
fn ends_group(typ: Uuid, at: Uuid) -> bool {
    use Declaration::*;
    if !typ.is_16() {
        return true;
    }
    if !at.is_16() {
        return false;
    }
    let at = Declaration::of(at);
    match Declaration::of(typ) {
        Some(PrimaryService | SecondaryService) => at.map_or(false, Declaration::is_service),
        Some(Characteristic) => {
            matches!(at, Some(PrimaryService | SecondaryService | Characteristic))
        }
        _ => true,
    }
}

/// Reading attributes ([Vol 3] Part F, Section 3.4.4).
impl Bearer {
    /// Handles `ATT_READ_BY_TYPE_REQ` ([Vol 3] Part F, Section 3.4.4.1). All
    /// values in the response have the same length as the first one.
    pub(super) async fn read_by_type(
        &self,
        rsp: &mut Buffer,
        hdls: HandleRange,
        typ: Uuid,
    ) -> RspResult<()> {
        let op = Opcode::ReadByTypeReq;
        let lim = self.rsp_lim(rsp);
        let cap = lim.saturating_sub(4).min(usize::from(u8::MAX) - 2);
        let after = Handle::new(u16::from(hdls.start()) - 1);
        let mut n = None;
        for at in self.db.find_by_uuid(after, Some(typ), hdls.end()) {
            let v = match self.read_value(op, at, 0).await {
                Ok(v) => v,
                Err(e) if n.is_none() => return Err(e),
                Err(_) => break,
            };
            let vn = v.len().min(cap);
            match n {
                None => {
                    n = Some(vn);
                    #[allow(clippy::cast_possible_truncation)]
                    rsp.append().u8(Opcode::ReadByTypeRsp).u8((2 + vn) as u8);
                }
                Some(n) if n != vn => break,
                Some(_) => {}
            }
            if rsp.len() + 2 + vn > lim {
                break;
            }
            rsp.append().u16(at.handle()).put(&v[..vn]);
        }
        if n.is_none() {
            return op.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
        }
        Ok(())
    }

    /// Handles `ATT_READ_REQ` ([Vol 3] Part F, Section 3.4.4.3).
    pub(super) async fn read(&self, rsp: &mut Buffer, hdl: u16) -> RspResult<()> {
        let op = Opcode::ReadReq;
        let at = lookup(&self.db, op, hdl)?;
        let v = self.read_value(op, at, 0).await?;
        let n = v.len().min(self.rsp_lim(rsp) - 1);
        rsp.append().u8(Opcode::ReadRsp).put(&v[..n]);
        Ok(())
    }

    /// Handles `ATT_READ_BLOB_REQ` ([Vol 3] Part F, Section 3.4.4.5).
    pub(super) async fn read_blob(&self, rsp: &mut Buffer, hdl: u16, off: u16) -> RspResult<()> {
        let op = Opcode::ReadBlobReq;
        let at = lookup(&self.db, op, hdl)?;
        let v = self.read_value(op, at, off).await?;
        let n = v.len().min(self.rsp_lim(rsp) - 1);
        rsp.append().u8(Opcode::ReadBlobRsp).put(&v[..n]);
        Ok(())
    }

    /// Handles `ATT_READ_MULTIPLE_REQ` ([Vol 3] Part F, Section 3.4.4.7).
    /// Values are concatenated until the response is full.
    pub(super) async fn read_multiple(&self, rsp: &mut Buffer, hdls: &[u16]) -> RspResult<()> {
        let op = Opcode::ReadMultipleReq;
        let lim = self.rsp_lim(rsp);
        rsp.append().u8(Opcode::ReadMultipleRsp);
        for &hdl in hdls {
            if rsp.len() >= lim {
                break;
            }
            let at = lookup(&self.db, op, hdl)?;
            let v = self.read_value(op, at, 0).await?;
            let n = v.len().min(lim - rsp.len());
            rsp.append().put(&v[..n]);
        }
        Ok(())
    }

    /// Handles `ATT_READ_MULTIPLE_VARIABLE_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.11). Each value is prefixed with its
    /// full length, even if the value itself is truncated.
    pub(super) async fn read_multiple_variable(
        &self,
        rsp: &mut Buffer,
        hdls: &[u16],
    ) -> RspResult<()> {
        let op = Opcode::ReadMultipleVariableReq;
        let lim = self.rsp_lim(rsp);
        rsp.append().u8(Opcode::ReadMultipleVariableRsp);
        for &hdl in hdls {
            if rsp.len() + 2 > lim {
                break;
            }
            let at = lookup(&self.db, op, hdl)?;
            let v = self.read_value(op, at, 0).await?;
            let n = v.len().min(lim - rsp.len() - 2);
            let full = u16::try_from(v.len()).unwrap_or(u16::MAX);
            rsp.append().u16(full).put(&v[..n]);
        }
        Ok(())
    }

    /// Handles `ATT_READ_BY_GROUP_TYPE_REQ`
    /// ([Vol 3] Part F, Section 3.4.4.9). A group that is still open when the
    /// database ends is reported with an end handle of `0xFFFF`.
    pub(super) async fn read_by_group_type(
        &self,
        rsp: &mut Buffer,
        hdls: HandleRange,
        typ: Uuid,
    ) -> RspResult<()> {
        let op = Opcode::ReadByGroupTypeReq;
        if !Declaration::of(typ).map_or(false, Declaration::is_service) {
            return op.hdl_err(ErrorCode::UnsupportedGroupType, hdls.start());
        }
        let lim = self.rsp_lim(rsp);
        let put = |rsp: &mut Buffer, first: Handle, last: u16, u: Uuid| {
            if rsp.len() + 4 + u.enc_len() > lim {
                return false;
            }
            rsp.append().u16(first).u16(last).uuid(u);
            true
        };
        let mut width = None;
        let mut group: Option<(Handle, Handle, Uuid)> = None;
        let mut eof = true;
        for at in self.db.range(HandleRange::new(hdls.start(), Handle::MAX)) {
            if at.handle() > hdls.end() {
                eof = false;
                break;
            }
            if let Some((first, last, u)) = group {
                if !Declaration::of(at.uuid()).map_or(false, Declaration::is_service) {
                    group = Some((first, at.handle(), u));
                    continue;
                }
                group = None;
                if !put(rsp, first, last.into(), u) {
                    break;
                }
            }
            if at.uuid() != typ {
                continue;
            }
            let u = match self.read_value(op, at, 0).await {
                Ok(v) => match Uuid::try_from(v.as_slice()) {
                    Ok(u) => u,
                    Err(()) if width.is_none() => {
                        return op.hdl_err(ErrorCode::UnlikelyError, at.handle());
                    }
                    Err(()) => break,
                },
                Err(e) if width.is_none() => return Err(e),
                Err(_) => break,
            };
            match width {
                None => {
                    width = Some(u.enc_len());
                    let n = if u.is_16() { 6 } else { 20 };
                    rsp.append().u8(Opcode::ReadByGroupTypeRsp).u8(n);
                }
                Some(w) if w != u.enc_len() => break,
                Some(_) => {}
            }
            group = Some((at.handle(), at.handle(), u));
        }
        if let Some((first, last, u)) = group {
            put(rsp, first, if eof { u16::MAX } else { last.into() }, u);
        }
        if width.is_none() {
            return op.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
        }
        Ok(())
    }

    /// Reads the value of attribute `at` starting at offset `off` after
    /// checking read permissions.
    pub(super) async fn read_value(&self, op: Opcode, at: &Attr, off: u16) -> RspResult<Value> {
        self.sec.check(op, at, Access::READ).await?;
        (at.io().read(&self.io_ctx(op, at), usize::from(off)))
            .or_else(|e| op.hdl_err(e, at.handle()))
    }
}

/// Writing attributes ([Vol 3] Part F, Section 3.4.5).
impl Bearer {
    /// Handles `ATT_WRITE_REQ` ([Vol 3] Part F, Section 3.4.5.1).
    pub(super) async fn write(&self, rsp: &mut Buffer, hdl: u16, v: &[u8]) -> RspResult<()> {
        self.write_value(Opcode::WriteReq, hdl, v).await?;
        rsp.append().u8(Opcode::WriteRsp);
        Ok(())
    }

    /// Writes the complete value of attribute `hdl` after checking write
    /// permissions.
    pub(super) async fn write_value(&self, op: Opcode, hdl: u16, v: &[u8]) -> RspResult<()> {
        let at = lookup(&self.db, op, hdl)?;
        if v.len() > self.cfg.max_attr_len {
            return op.hdl_err(ErrorCode::InvalidAttributeValueLength, hdl);
        }
        self.sec.check(op, at, Access::WRITE).await?;
        (at.io().write(&self.io_ctx(op, at), 0, v)).or_else(|e| op.hdl_err(e, hdl))
    }
}

/// Queued writes ([Vol 3] Part F, Section 3.4.6).
impl Bearer {
    /// Handles `ATT_PREPARE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.1). The
    /// response echoes the request parameters.
    pub(super) async fn prepare_write(
        &mut self,
        rsp: &mut Buffer,
        hdl: u16,
        off: u16,
        v: &[u8],
    ) -> RspResult<()> {
        let op = Opcode::PrepareWriteReq;
        let db = Arc::clone(&self.db);
        let at = lookup(&db, op, hdl)?;
        self.sec.check(op, at, Access::WRITE).await?;
        if 5 + v.len() > self.rsp_lim(rsp) {
            return op.hdl_err(ErrorCode::InvalidAttributeValueLength, hdl);
        }
        (self.queue.push(at.handle(), off, v)).or_else(|e| op.hdl_err(e, hdl))?;
        debug!(
            "{} queued {} byte(s) for {} at offset {off} ({} pending)",
            self.conn(),
            v.len(),
            at.handle(),
            self.queue.len()
        );
        (rsp.append().u8(Opcode::PrepareWriteRsp).u16(hdl))
            .u16(off)
            .put(v);
        Ok(())
    }

    /// Handles `ATT_EXECUTE_WRITE_REQ` ([Vol 3] Part F, Section 3.4.6.3). The
    /// queue is validated before anything is written. A write failure stops
    /// the transaction without undoing earlier writes. The queue is always
    /// emptied.
    pub(super) async fn execute_write(&mut self, rsp: &mut Buffer, commit: bool) -> RspResult<()> {
        let op = Opcode::ExecuteWriteReq;
        if !commit {
            debug!("{} cancelled {} prepared write(s)", self.conn(), self.queue.len());
            self.queue.clear();
            rsp.append().u8(Opcode::ExecuteWriteRsp);
            return Ok(());
        }
        let valid = self.queue.validate(self.cfg.max_attr_len);
        let vals = self.queue.take();
        if let Err((hdl, e)) = valid {
            return op.hdl_err(e, hdl);
        }
        debug!("{} executing {} queued write(s)", self.conn(), vals.len());
        let db = Arc::clone(&self.db);
        for (hdl, v) in vals {
            let at = lookup(&db, op, hdl.into())?;
            self.sec.check(op, at, Access::WRITE).await?;
            (at.io().write(&self.io_ctx(op, at), 0, &v)).or_else(|e| op.hdl_err(e, hdl))?;
        }
        rsp.append().u8(Opcode::ExecuteWriteRsp);
        Ok(())
    }
}

/// Returns the visible attribute with raw handle `hdl` or an `InvalidHandle`
/// error.
#[inline]
fn lookup(db: &Registry, op: Opcode, hdl: u16) -> RspResult<&Attr> {
    (Handle::new(hdl).and_then(|h| db.find_by_handle(h)))
        .map_or_else(|| op.hdl_err(ErrorCode::InvalidHandle, hdl), Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(v: u16) -> Uuid {
        Uuid16::new(v).unwrap().as_uuid()
    }

    #[test]
    fn group_ends() {
        let (pri, sec, chr) = (u(0x2800), u(0x2801), u(0x2803));
        let (val, long) = (u(0x2A00), Uuid::new(0x1234_5678_9ABC_DEF0_1234_5678_9ABC_DEF0).unwrap());
        assert!(ends_group(pri, sec));
        assert!(!ends_group(pri, chr));
        assert!(!ends_group(pri, val));
        assert!(!ends_group(pri, long));
        assert!(ends_group(chr, pri));
        assert!(ends_group(chr, chr));
        assert!(!ends_group(chr, val));
        assert!(ends_group(val, val));
        assert!(ends_group(long, val));
        assert!(ends_group(u(0x2802), chr));
    }
}
