//! Attribute database: an immutable handle-ordered attribute sequence with
//! a pluggable read/write handler model ([Vol 3] Part F, Section 3.2).

use std::fmt::{Debug, Display, Formatter};
use std::num::NonZeroU16;
use std::sync::Arc;

use structbuf::{Pack, StructBuf};

use crate::uuid::Uuid;

use super::server::Session;
use super::{ErrorCode, Opcode};

/// Attribute handle ([Vol 3] Part F, Section 3.2.2).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Handle(NonZeroU16);

impl Handle {
    /// Smallest valid handle.
    pub const MIN: Self = Self(NonZeroU16::MIN);
    /// Largest valid handle.
    pub const MAX: Self = Self(NonZeroU16::MAX);

    /// Wraps a raw handle. Returns `None` for the invalid handle 0x0000.
    #[inline]
    #[must_use]
    pub const fn new(h: u16) -> Option<Self> {
        match NonZeroU16::new(h) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the next handle, or `None` at the end of the handle space.
    #[inline]
    pub(crate) const fn next(self) -> Option<Self> {
        Self::new(self.0.get().wrapping_add(1))
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({:#06X})", self.0.get())
    }
}

impl Display for Handle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<Handle> for u16 {
    #[inline]
    fn from(h: Handle) -> Self {
        h.0.get()
    }
}

/// One attribute record. Readable attributes carry either a static value or
/// a handler; write-capable attributes always use a handler.
pub struct Attr {
    handle: Handle,
    end: Handle,
    typ: Uuid,
    value: Option<Box<[u8]>>,
    handler: Option<Arc<dyn Handler>>,
}

impl Attr {
    /// Returns the attribute handle.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// Returns the last handle of the group this attribute defines. Equals
    /// the attribute's own handle for non-group attributes.
    #[inline]
    #[must_use]
    pub const fn end_group(&self) -> Handle {
        self.end
    }

    /// Returns the attribute type.
    #[inline]
    #[must_use]
    pub const fn typ(&self) -> Uuid {
        self.typ
    }

    /// Returns the static attribute value, if any.
    #[inline]
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Returns the dynamic value handler, if any.
    #[inline]
    pub(crate) fn handler(&self) -> Option<&Arc<dyn Handler>> {
        self.handler.as_ref()
    }

    #[inline]
    pub(crate) fn handle_u16(&self) -> u16 {
        self.handle.into()
    }

    #[inline]
    pub(crate) fn end_u16(&self) -> u16 {
        self.end.into()
    }
}

impl Debug for Attr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_struct("Attr"))
            .field("handle", &self.handle)
            .field("end", &self.end)
            .field("typ", &self.typ)
            .field("value", &self.value)
            .field("dynamic", &self.handler.is_some())
            .finish()
    }
}

/// Immutable attribute database, ordered by handle. Built once at startup
/// and read concurrently without locking.
#[derive(Debug, Default)]
pub struct Db {
    attrs: Box<[Attr]>,
}

impl Db {
    /// Returns a new database builder.
    #[inline]
    #[must_use]
    pub fn build() -> Builder {
        Builder { attrs: Vec::new() }
    }

    /// Returns the attribute with the specified raw handle.
    #[must_use]
    pub fn at(&self, handle: u16) -> Option<&Attr> {
        let i = (self.attrs)
            .binary_search_by_key(&handle, Attr::handle_u16)
            .ok()?;
        Some(&self.attrs[i])
    }

    /// Returns all attributes with handles in `[start, end]` in ascending
    /// handle order.
    #[must_use]
    pub fn subrange(&self, start: u16, end: u16) -> &[Attr] {
        let i = self.attrs.partition_point(|at| at.handle_u16() < start);
        let j = self.attrs.partition_point(|at| at.handle_u16() <= end);
        &self.attrs[i..j]
    }

    /// Returns the number of attributes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Returns whether the database is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// Attribute database builder. Handles are assigned strictly monotonically
/// starting at 0x0001 and never change once the database is frozen.
#[derive(Debug, Default)]
pub struct Builder {
    attrs: Vec<Attr>,
}

impl Builder {
    fn append(
        &mut self,
        typ: Uuid,
        value: Option<Box<[u8]>>,
        handler: Option<Arc<dyn Handler>>,
    ) -> Handle {
        let handle = match self.attrs.last() {
            None => Handle::MIN,
            Some(at) => at.handle.next().expect("attribute handles exhausted"),
        };
        self.attrs.push(Attr {
            handle,
            end: handle,
            typ,
            value,
            handler,
        });
        handle
    }

    /// Appends an attribute with a static value.
    pub fn value(&mut self, typ: Uuid, value: impl Into<Box<[u8]>>) -> Handle {
        self.append(typ, Some(value.into()), None)
    }

    /// Appends an attribute with a dynamic value handler.
    pub fn handler(&mut self, typ: Uuid, h: Arc<dyn Handler>) -> Handle {
        self.append(typ, None, Some(h))
    }

    /// Sets the group end handle of a previously appended group-defining
    /// attribute.
    pub fn set_group_end(&mut self, decl: Handle, end: Handle) {
        let i = (self.attrs)
            .binary_search_by_key(&u16::from(decl), Attr::handle_u16)
            .expect("unknown group declaration handle");
        self.attrs[i].end = end;
    }

    /// Returns the handle that the next appended attribute will receive.
    #[must_use]
    pub fn next_handle(&self) -> Handle {
        match self.attrs.last() {
            None => Handle::MIN,
            Some(at) => at.handle.next().expect("attribute handles exhausted"),
        }
    }

    /// Returns the read-only database.
    #[must_use]
    pub fn freeze(self) -> Db {
        Db {
            attrs: self.attrs.into_boxed_slice(),
        }
    }
}

/// Dynamic attribute value handler, polymorphic over the read, write, and
/// write-without-response capabilities. The handler inspects the request
/// opcode and returns [`ErrorCode::Success`] or the error to send.
pub trait Handler: Send + Sync {
    fn handle(&self, session: &Session, req: &Request<'_>, rsp: &mut ResponseWriter) -> ErrorCode;
}

/// One attribute access passed to a [`Handler`].
#[derive(Clone, Copy, Debug)]
pub struct Request<'a> {
    op: Opcode,
    handle: Handle,
    value: &'a [u8],
    offset: u16,
}

impl<'a> Request<'a> {
    #[inline]
    pub(crate) const fn new(op: Opcode, handle: Handle, value: &'a [u8], offset: u16) -> Self {
        Self {
            op,
            handle,
            value,
            offset,
        }
    }

    /// Returns the request opcode.
    #[inline]
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.op
    }

    /// Returns the target attribute handle.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// Returns the value being written. Empty for reads.
    #[inline]
    #[must_use]
    pub const fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Returns the read offset of an `ATT_READ_BLOB_REQ`.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u16 {
        self.offset
    }
}

/// Capacity-limited response value writer. Anything written beyond the
/// capacity is truncated.
#[derive(Debug)]
pub struct ResponseWriter {
    buf: StructBuf,
}

impl ResponseWriter {
    #[inline]
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            buf: StructBuf::new(cap),
        }
    }

    /// Appends `v`, truncating at the capacity limit. Returns the number of
    /// bytes accepted.
    pub fn write(&mut self, v: &[u8]) -> usize {
        let n = v.len().min(self.buf.lim() - self.buf.as_ref().len());
        self.buf.append().put(&v[..n]);
        n
    }

    /// Returns the number of bytes written so far.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.as_ref().len()
    }

    /// Returns whether nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.as_ref().is_empty()
    }

    /// Returns the maximum number of bytes the response can carry.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.lim()
    }
}

impl AsRef<[u8]> for ResponseWriter {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.buf.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Db {
        let mut b = Db::build();
        for i in 0..5u8 {
            b.value(Uuid::u16(0x2800 + u16::from(i)), vec![i]);
        }
        b.freeze()
    }

    #[test]
    fn monotonic_handles() {
        let db = db();
        let handles: Vec<u16> = db.subrange(1, 0xFFFF).iter().map(Attr::handle_u16).collect();
        assert_eq!(handles, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn point_lookup() {
        let db = db();
        assert_eq!(db.at(3).unwrap().value(), Some(&[2u8][..]));
        assert!(db.at(0).is_none());
        assert!(db.at(6).is_none());
    }

    #[test]
    fn subrange_bounds() {
        let db = db();
        let mid = db.subrange(2, 4);
        assert_eq!(mid.len(), 3);
        assert!(mid.iter().all(|at| (2..=4).contains(&at.handle_u16())));
        assert!(db.subrange(6, 0xFFFF).is_empty());
    }

    #[test]
    fn group_end() {
        let mut b = Db::build();
        let decl = b.value(Uuid::PRIMARY_SERVICE, vec![0x00, 0x18]);
        let last = b.value(Uuid::u16(0x2A00), vec![]);
        b.set_group_end(decl, last);
        let db = b.freeze();
        assert_eq!(db.at(1).unwrap().end_group(), last);
        assert_eq!(db.at(2).unwrap().end_group(), last);
    }

    #[test]
    fn response_writer_truncates() {
        let mut w = ResponseWriter::new(4);
        assert_eq!(w.write(&[1, 2, 3]), 3);
        assert_eq!(w.write(&[4, 5, 6]), 1);
        assert_eq!(w.as_ref(), &[1, 2, 3, 4]);
    }
}
