use smallvec::SmallVec;
use structbuf::Unpack;

use super::*;

/// Handles of a Read Multiple request.
pub(crate) type HandleList = SmallVec<[u16; 8]>;

/// Decoded client PDU ([Vol 3] Part F, Section 3.4). Parameters are copied out
/// of the received buffer, so that the buffer can be reused for the response.
/// Handles are kept raw for error reporting.
#[derive(Debug)]
pub(crate) enum Req {
    ExchangeMtu {
        mtu: u16,
    },
    FindInformation {
        hdls: HandleRange,
    },
    FindByTypeValue {
        hdls: HandleRange,
        typ: Uuid,
        val: Value,
    },
    ReadByType {
        hdls: HandleRange,
        typ: Uuid,
    },
    Read {
        hdl: u16,
    },
    ReadBlob {
        hdl: u16,
        off: u16,
    },
    ReadMultiple {
        hdls: HandleList,
    },
    ReadMultipleVariable {
        hdls: HandleList,
    },
    ReadByGroupType {
        hdls: HandleRange,
        typ: Uuid,
    },
    Write {
        hdl: u16,
        val: Value,
    },
    WriteCmd {
        hdl: u16,
        val: Value,
    },
    SignedWrite {
        hdl: u16,
        val: Value,
        msg: Value,
        sig: Signature,
    },
    PrepareWrite {
        hdl: u16,
        off: u16,
        val: Value,
    },
    ExecuteWrite {
        commit: bool,
    },
    HandleValueCfm,
}

impl Req {
    /// Decodes PDU `pdu` with opcode `op`. The caller has already verified
    /// that `op` is a client PDU accepted by the server.
    pub fn decode(op: Opcode, pdu: &[u8]) -> RspResult<Self> {
        use Opcode::*;
        let Some(n) = op.hdr_len() else {
            return op.err(ErrorCode::RequestNotSupported);
        };
        if pdu.len() < n {
            return op.err(ErrorCode::InvalidPdu);
        }
        let b = &pdu[1..];
        let mut p = b.unpack();
        Ok(match op {
            ExchangeMtuReq => Self::ExchangeMtu { mtu: p.u16() },
            FindInformationReq => Self::FindInformation {
                hdls: handle_range(op, p.u16(), p.u16())?,
            },
            FindByTypeValueReq => {
                let hdls = handle_range(op, p.u16(), p.u16())?;
                let Some(typ) = Uuid16::new(p.u16()) else {
                    return op.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
                };
                Self::FindByTypeValue {
                    hdls,
                    typ: typ.as_uuid(),
                    val: Value::from_slice(&b[6..]),
                }
            }
            ReadByTypeReq | ReadByGroupTypeReq => {
                if !matches!(b.len() - 4, 2 | 16) {
                    return op.err(ErrorCode::InvalidPdu);
                }
                let hdls = handle_range(op, p.u16(), p.u16())?;
                let Ok(typ) = Uuid::try_from(&b[4..]) else {
                    return op.hdl_err(ErrorCode::AttributeNotFound, hdls.start());
                };
                if op == ReadByTypeReq {
                    Self::ReadByType { hdls, typ }
                } else {
                    Self::ReadByGroupType { hdls, typ }
                }
            }
            ReadReq => Self::Read { hdl: p.u16() },
            ReadBlobReq => Self::ReadBlob {
                hdl: p.u16(),
                off: p.u16(),
            },
            ReadMultipleReq | ReadMultipleVariableReq => {
                // A trailing odd byte is ignored
                let hdls = (b.chunks_exact(2))
                    .map(|h| u16::from_le_bytes([h[0], h[1]]))
                    .collect();
                if op == ReadMultipleReq {
                    Self::ReadMultiple { hdls }
                } else {
                    Self::ReadMultipleVariable { hdls }
                }
            }
            WriteReq => Self::Write {
                hdl: p.u16(),
                val: Value::from_slice(&b[2..]),
            },
            WriteCmd => Self::WriteCmd {
                hdl: p.u16(),
                val: Value::from_slice(&b[2..]),
            },
            SignedWriteCmd => {
                let (msg, sig) = pdu.split_at(pdu.len() - Signature::LEN);
                let mut s = [0; Signature::LEN];
                s.copy_from_slice(sig);
                Self::SignedWrite {
                    hdl: p.u16(),
                    val: Value::from_slice(&msg[3..]),
                    msg: Value::from_slice(msg),
                    sig: Signature::from_le_bytes(&s),
                }
            }
            PrepareWriteReq => Self::PrepareWrite {
                hdl: p.u16(),
                off: p.u16(),
                val: Value::from_slice(&b[4..]),
            },
            ExecuteWriteReq => Self::ExecuteWrite {
                // Any non-zero flag value commits
                commit: p.u8() != 0,
            },
            HandleValueCfm => Self::HandleValueCfm,
            _ => return op.err(ErrorCode::RequestNotSupported),
        })
    }
}

/// Validates a start/end handle range ([Vol 3] Part F, Section 3.4.3.1).
#[inline]
fn handle_range(op: Opcode, start: u16, end: u16) -> RspResult<HandleRange> {
    HandleRange::from_raw(start, end).map_or_else(|| op.hdl_err(ErrorCode::InvalidHandle, start), Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(pdu: &[u8]) -> RspResult<Req> {
        Req::decode(Opcode::try_from(pdu[0]).unwrap(), pdu)
    }

    fn err(r: RspResult<Req>) -> (u8, u16, ErrorCode) {
        let e = r.unwrap_err();
        (e.opcode(), e.hdl().map_or(0, u16::from), e.code())
    }

    #[test]
    fn short_pdus() {
        use ErrorCode::InvalidPdu;
        for pdu in [
            &[0x02, 0x17][..],
            &[0x04, 0x01, 0x00, 0xFF],
            &[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00],
            &[0x0A, 0x01],
            &[0x0C, 0x01, 0x00, 0x00],
            &[0x0E, 0x01],
            &[0x12, 0x01],
            &[0x16, 0x01, 0x00, 0x00],
            &[0x18],
            &[0xD2, 0x01, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        ] {
            assert_eq!(err(decode(pdu)), (pdu[0], 0, InvalidPdu), "{pdu:02X?}");
        }
        // Read By Type requires a 2- or 16-byte UUID
        let pdu = [0x08, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x00];
        assert_eq!(err(decode(&pdu)), (0x08, 0, InvalidPdu));
    }

    #[test]
    fn handle_ranges() {
        use ErrorCode::InvalidHandle;
        let pdu = [0x04, 0x00, 0x00, 0xFF, 0xFF];
        assert_eq!(err(decode(&pdu)), (0x04, 0, InvalidHandle));
        let pdu = [0x10, 0x05, 0x00, 0x04, 0x00, 0x00, 0x28];
        assert_eq!(err(decode(&pdu)), (0x10, 5, InvalidHandle));
        let pdu = [0x04, 0x05, 0x00, 0x05, 0x00];
        assert!(matches!(decode(&pdu), Ok(Req::FindInformation { .. })));
    }

    #[test]
    fn params() {
        let pdu = [0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x0F, 0x18];
        let Ok(Req::FindByTypeValue { hdls, typ, val }) = decode(&pdu) else {
            panic!("unexpected decode result");
        };
        assert_eq!(hdls, HandleRange::ALL);
        assert_eq!(typ, Declaration::PrimaryService);
        assert_eq!(val.as_slice(), &[0x0F, 0x18]);

        let pdu = [0x0E, 0x01, 0x00, 0x02, 0x00, 0x03];
        assert!(matches!(decode(&pdu), Ok(Req::ReadMultiple { hdls }) if hdls.as_slice() == [1, 2]));

        let pdu = [0x16, 0x05, 0x00, 0x02, 0x00, 3, 4];
        assert!(matches!(
            decode(&pdu),
            Ok(Req::PrepareWrite { hdl: 5, off: 2, val }) if val.as_slice() == [3, 4]
        ));

        for (flags, commit) in [(0x00, false), (0x01, true), (0x02, true)] {
            let r = decode(&[0x18, flags]);
            assert!(matches!(r, Ok(Req::ExecuteWrite { commit: c }) if c == commit));
        }

        let mut pdu = vec![0xD2, 0x07, 0x00, 0xAA];
        pdu.extend_from_slice(&[1, 0, 0, 0, 8, 7, 6, 5, 4, 3, 2, 1]);
        let Ok(Req::SignedWrite { hdl, val, msg, sig }) = decode(&pdu) else {
            panic!("unexpected decode result");
        };
        assert_eq!((hdl, val.as_slice(), msg.as_slice()), (7, &[0xAA][..], &pdu[..4]));
        assert_eq!(sig.counter(), 1);
    }
}
