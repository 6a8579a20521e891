//! DGC wire codec
//!
//! Requests are `[version:u8][opnum:u16][value...]`, responses are
//! `[status:u8][value]`. Every value carries a one-byte tag, and each
//! message position only accepts the tags on its [`AllowList`]; anything
//! else is a protocol violation. DGC endpoints are reachable by any
//! connected peer, so decoding never allocates more than the configured
//! array limit and never recurses past [`MAX_DEPTH`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{DgcError, FaultKind, Lease, ObjectId, Result, VmId};

/// Wire format version
pub const WIRE_VERSION: u8 = 1;

/// Operation number of `clean`
pub const OP_CLEAN: u16 = 0;

/// Operation number of `dirty`
pub const OP_DIRTY: u16 = 1;

/// Deepest value nesting accepted (a lease holds one level of fields)
pub const MAX_DEPTH: usize = 2;

/// Longest fault message accepted
pub const MAX_FAULT_MESSAGE: usize = 4096;

const STATUS_OK: u8 = 0;
const STATUS_FAULT: u8 = 1;

/// Value type tags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Null = 0,
    Bool = 1,
    I64 = 2,
    ObjectIds = 3,
    VmId = 4,
    Lease = 5,
    Fault = 6,
}

impl Tag {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Null),
            1 => Some(Self::Bool),
            2 => Some(Self::I64),
            3 => Some(Self::ObjectIds),
            4 => Some(Self::VmId),
            5 => Some(Self::Lease),
            6 => Some(Self::Fault),
            _ => None,
        }
    }
}

/// Set of tags a message position may carry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllowList {
    mask: u8,
}

impl AllowList {
    /// Build an allow-list from tags
    pub const fn of(tags: &[Tag]) -> Self {
        let mut mask = 0u8;
        let mut i = 0;
        while i < tags.len() {
            mask |= 1 << (tags[i] as u8);
            i += 1;
        }
        Self { mask }
    }

    /// Arguments of a dirty request
    pub const DIRTY_REQUEST: Self = Self::of(&[Tag::ObjectIds, Tag::I64, Tag::Lease]);
    /// Arguments of a clean request
    pub const CLEAN_REQUEST: Self = Self::of(&[Tag::ObjectIds, Tag::I64, Tag::VmId, Tag::Bool]);
    /// Fields inside a lease
    pub const LEASE_FIELDS: Self = Self::of(&[Tag::Null, Tag::VmId, Tag::I64]);
    /// Result of a dirty call
    pub const DIRTY_RESPONSE: Self = Self::of(&[Tag::Lease]);
    /// Result of a clean call
    pub const CLEAN_RESPONSE: Self = Self::of(&[Tag::Null]);
    /// Body of a fault response
    pub const FAULT: Self = Self::of(&[Tag::Fault]);

    /// Check if `tag` may appear
    pub fn permits(&self, tag: Tag) -> bool {
        self.mask & (1 << (tag as u8)) != 0
    }
}

/// A decoded wire value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    ObjectIds(Vec<ObjectId>),
    VmId(VmId),
    Lease(Lease),
    Fault { kind: FaultKind, message: String },
}

impl Value {
    /// Tag of this value
    pub fn tag(&self) -> Tag {
        match self {
            Value::Null => Tag::Null,
            Value::Bool(_) => Tag::Bool,
            Value::I64(_) => Tag::I64,
            Value::ObjectIds(_) => Tag::ObjectIds,
            Value::VmId(_) => Tag::VmId,
            Value::Lease(_) => Tag::Lease,
            Value::Fault { .. } => Tag::Fault,
        }
    }

    /// Append the tagged encoding of this value
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag() as u8);
        match self {
            Value::Null => {}
            Value::Bool(b) => buf.put_u8(u8::from(*b)),
            Value::I64(v) => buf.put_i64_le(*v),
            Value::ObjectIds(ids) => {
                buf.put_u32_le(ids.len() as u32);
                for id in ids {
                    id.encode(buf);
                }
            }
            Value::VmId(vmid) => vmid.encode(buf),
            Value::Lease(lease) => {
                match lease.vmid {
                    Some(vmid) => Value::VmId(vmid).encode(buf),
                    None => Value::Null.encode(buf),
                }
                Value::I64(lease.duration_millis()).encode(buf);
            }
            Value::Fault { kind, message } => {
                buf.put_u8(*kind as u8);
                let message = truncate(message, MAX_FAULT_MESSAGE);
                buf.put_u32_le(message.len() as u32);
                buf.put_slice(message.as_bytes());
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Allow-list enforcing value reader
pub struct ValueReader<'a> {
    buf: &'a [u8],
    max_array_len: usize,
    context: &'static str,
}

impl<'a> ValueReader<'a> {
    /// Read values of the message named `context` from `buf`
    pub fn new(buf: &'a [u8], max_array_len: usize, context: &'static str) -> Self {
        Self {
            buf,
            max_array_len,
            context,
        }
    }

    /// Read one value whose tag must be on `allow`
    pub fn read(&mut self, allow: AllowList) -> Result<Value> {
        self.read_at(allow, 1)
    }

    /// Reject trailing bytes
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(DgcError::violation(format!(
                "{}: {} trailing byte(s)",
                self.context,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(DgcError::BufferUnderflow {
                needed: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn read_at(&mut self, allow: AllowList, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(DgcError::violation(format!("{}: nesting too deep", self.context)));
        }
        self.need(1)?;
        let raw = self.buf.get_u8();
        let tag = Tag::from_u8(raw)
            .ok_or_else(|| DgcError::violation(format!("{}: unknown tag {}", self.context, raw)))?;
        if !allow.permits(tag) {
            return Err(DgcError::violation(format!(
                "{}: {:?} not permitted here",
                self.context, tag
            )));
        }

        match tag {
            Tag::Null => Ok(Value::Null),
            Tag::Bool => {
                self.need(1)?;
                match self.buf.get_u8() {
                    0 => Ok(Value::Bool(false)),
                    1 => Ok(Value::Bool(true)),
                    other => Err(DgcError::violation(format!(
                        "{}: invalid bool {}",
                        self.context, other
                    ))),
                }
            }
            Tag::I64 => {
                self.need(8)?;
                Ok(Value::I64(self.buf.get_i64_le()))
            }
            Tag::ObjectIds => {
                self.need(4)?;
                let count = self.buf.get_u32_le() as usize;
                if count > self.max_array_len {
                    return Err(DgcError::violation(format!(
                        "{}: {} object ids exceeds limit {}",
                        self.context, count, self.max_array_len
                    )));
                }
                self.need(count * ObjectId::SIZE)?;
                let ids = (0..count).map(|_| ObjectId::decode(&mut self.buf)).collect();
                Ok(Value::ObjectIds(ids))
            }
            Tag::VmId => {
                self.need(VmId::SIZE)?;
                Ok(Value::VmId(VmId::decode(&mut self.buf)))
            }
            Tag::Lease => {
                let vmid = match self.read_at(AllowList::LEASE_FIELDS, depth + 1)? {
                    Value::VmId(vmid) => Some(vmid),
                    Value::Null => None,
                    other => return Err(self.unexpected("lease vmid", &other)),
                };
                let millis = match self.read_at(AllowList::LEASE_FIELDS, depth + 1)? {
                    Value::I64(v) => v,
                    other => return Err(self.unexpected("lease duration", &other)),
                };
                Ok(Value::Lease(Lease::from_millis(vmid, millis)))
            }
            Tag::Fault => {
                self.need(5)?;
                let raw_kind = self.buf.get_u8();
                let kind = FaultKind::from_u8(raw_kind).ok_or_else(|| {
                    DgcError::violation(format!("{}: unknown fault kind {}", self.context, raw_kind))
                })?;
                let len = self.buf.get_u32_le() as usize;
                if len > MAX_FAULT_MESSAGE {
                    return Err(DgcError::violation(format!(
                        "{}: fault message of {} bytes",
                        self.context, len
                    )));
                }
                self.need(len)?;
                let message = String::from_utf8_lossy(&self.buf[..len]).into_owned();
                self.buf.advance(len);
                Ok(Value::Fault { kind, message })
            }
        }
    }

    fn unexpected(&self, field: &str, got: &Value) -> DgcError {
        DgcError::violation(format!("{}: expected {}, got {:?}", self.context, field, got.tag()))
    }

    fn object_ids(&mut self, allow: AllowList) -> Result<Vec<ObjectId>> {
        match self.read(allow)? {
            Value::ObjectIds(ids) => Ok(ids),
            other => Err(self.unexpected("object ids", &other)),
        }
    }

    fn i64(&mut self, allow: AllowList, field: &str) -> Result<i64> {
        match self.read(allow)? {
            Value::I64(v) => Ok(v),
            other => Err(self.unexpected(field, &other)),
        }
    }
}

/// Arguments of `dirty`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyArgs {
    pub ids: Vec<ObjectId>,
    pub sequence_num: i64,
    pub lease: Lease,
}

impl DirtyArgs {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.ids.len() * ObjectId::SIZE);
        Value::ObjectIds(self.ids.clone()).encode(&mut buf);
        Value::I64(self.sequence_num).encode(&mut buf);
        Value::Lease(self.lease).encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &[u8], max_array_len: usize) -> Result<Self> {
        let allow = AllowList::DIRTY_REQUEST;
        let mut reader = ValueReader::new(buf, max_array_len, "dirty request");
        let ids = reader.object_ids(allow)?;
        let sequence_num = reader.i64(allow, "sequence number")?;
        let lease = match reader.read(allow)? {
            Value::Lease(lease) => lease,
            other => return Err(reader.unexpected("lease", &other)),
        };
        reader.finish()?;
        Ok(Self {
            ids,
            sequence_num,
            lease,
        })
    }
}

/// Arguments of `clean`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanArgs {
    pub ids: Vec<ObjectId>,
    pub sequence_num: i64,
    pub vmid: VmId,
    pub strong: bool,
}

impl CleanArgs {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(48 + self.ids.len() * ObjectId::SIZE);
        Value::ObjectIds(self.ids.clone()).encode(&mut buf);
        Value::I64(self.sequence_num).encode(&mut buf);
        Value::VmId(self.vmid).encode(&mut buf);
        Value::Bool(self.strong).encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &[u8], max_array_len: usize) -> Result<Self> {
        let allow = AllowList::CLEAN_REQUEST;
        let mut reader = ValueReader::new(buf, max_array_len, "clean request");
        let ids = reader.object_ids(allow)?;
        let sequence_num = reader.i64(allow, "sequence number")?;
        let vmid = match reader.read(allow)? {
            Value::VmId(vmid) => vmid,
            other => return Err(reader.unexpected("vmid", &other)),
        };
        let strong = match reader.read(allow)? {
            Value::Bool(b) => b,
            other => return Err(reader.unexpected("strong flag", &other)),
        };
        reader.finish()?;
        Ok(Self {
            ids,
            sequence_num,
            vmid,
            strong,
        })
    }
}

/// Encode the granted lease returned by `dirty`
pub fn encode_lease_result(lease: Lease) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    Value::Lease(lease).encode(&mut buf);
    buf.freeze()
}

/// Decode the result of `dirty`; the server must name a VMID
pub fn decode_lease_result(buf: &[u8]) -> Result<Lease> {
    let mut reader = ValueReader::new(buf, 0, "dirty response");
    let lease = match reader.read(AllowList::DIRTY_RESPONSE)? {
        Value::Lease(lease) => lease,
        other => return Err(reader.unexpected("lease", &other)),
    };
    reader.finish()?;
    if lease.vmid.is_none() {
        return Err(DgcError::violation("dirty response: lease without vmid"));
    }
    Ok(lease)
}

/// Encode the (empty) result of `clean`
pub fn encode_void_result() -> Bytes {
    let mut buf = BytesMut::with_capacity(1);
    Value::Null.encode(&mut buf);
    buf.freeze()
}

/// Decode the result of `clean`
pub fn decode_void_result(buf: &[u8]) -> Result<()> {
    let mut reader = ValueReader::new(buf, 0, "clean response");
    reader.read(AllowList::CLEAN_RESPONSE)?;
    reader.finish()
}

/// Frame a request payload
pub fn encode_request(opnum: u16, args: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + args.len());
    buf.put_u8(WIRE_VERSION);
    buf.put_u16_le(opnum);
    buf.put_slice(args);
    buf.freeze()
}

/// Split a request payload into operation number and arguments
pub fn decode_request(mut payload: Bytes) -> Result<(u16, Bytes)> {
    if payload.remaining() < 3 {
        return Err(DgcError::BufferUnderflow {
            needed: 3,
            have: payload.remaining(),
        });
    }
    let version = payload.get_u8();
    if version != WIRE_VERSION {
        return Err(DgcError::violation(format!("unsupported wire version {}", version)));
    }
    let opnum = payload.get_u16_le();
    Ok((opnum, payload))
}

/// Frame a successful response
pub fn encode_reply(value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + value.len());
    buf.put_u8(STATUS_OK);
    buf.put_slice(value);
    buf.freeze()
}

/// Frame a fault response
pub fn encode_fault(kind: FaultKind, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + message.len().min(MAX_FAULT_MESSAGE));
    buf.put_u8(STATUS_FAULT);
    Value::Fault {
        kind,
        message: message.to_string(),
    }
    .encode(&mut buf);
    buf.freeze()
}

/// Unwrap a response payload; faults become [`DgcError::RemoteFault`]
pub fn decode_response(mut payload: Bytes) -> Result<Bytes> {
    if !payload.has_remaining() {
        return Err(DgcError::BufferUnderflow { needed: 1, have: 0 });
    }
    match payload.get_u8() {
        STATUS_OK => Ok(payload),
        STATUS_FAULT => {
            let mut reader = ValueReader::new(&payload, 0, "fault response");
            let value = reader.read(AllowList::FAULT)?;
            reader.finish()?;
            match value {
                Value::Fault { kind, message } => Err(DgcError::RemoteFault { kind, message }),
                other => Err(DgcError::violation(format!(
                    "fault response: got {:?}",
                    other.tag()
                ))),
            }
        }
        status => Err(DgcError::violation(format!("unknown response status {}", status))),
    }
}
