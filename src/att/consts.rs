use std::fmt::{Debug, Display, Formatter};

/// Attribute opcode ([Vol 3] Part F, Section 3.3.1).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum Opcode {
    ErrorRsp = 0x01,
    ExchangeMtuReq = 0x02,
    ExchangeMtuRsp = 0x03,
    FindInformationReq = 0x04,
    FindInformationRsp = 0x05,
    FindByTypeValueReq = 0x06,
    FindByTypeValueRsp = 0x07,
    ReadByTypeReq = 0x08,
    ReadByTypeRsp = 0x09,
    ReadReq = 0x0A,
    ReadRsp = 0x0B,
    ReadBlobReq = 0x0C,
    ReadBlobRsp = 0x0D,
    ReadMultipleReq = 0x0E,
    ReadMultipleRsp = 0x0F,
    ReadByGroupTypeReq = 0x10,
    ReadByGroupTypeRsp = 0x11,
    WriteReq = 0x12,
    WriteRsp = 0x13,
    PrepareWriteReq = 0x16,
    PrepareWriteRsp = 0x17,
    ExecuteWriteReq = 0x18,
    ExecuteWriteRsp = 0x19,
    HandleValueNtf = 0x1B,
    HandleValueInd = 0x1D,
    HandleValueCfm = 0x1E,
    WriteCmd = 0x52,
    SignedWriteCmd = 0xD2,
}

impl Opcode {
    /// Returns the kind of attribute access the opcode performs, used to
    /// select a capability handler.
    #[must_use]
    pub const fn access(self) -> Option<Access> {
        use Opcode::*;
        match self {
            FindByTypeValueReq | ReadByTypeReq | ReadReq | ReadBlobReq | ReadMultipleReq
            | ReadByGroupTypeReq => Some(Access::Read),
            WriteReq | PrepareWriteReq | SignedWriteCmd => Some(Access::Write),
            WriteCmd => Some(Access::WriteNoRsp),
            _ => None,
        }
    }
}

impl Display for Opcode {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Attribute access kind performed by a request.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    WriteNoRsp,
}

/// ATT error codes ([Vol 3] Part F, Section 3.4.1.1).
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    thiserror::Error,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorCode {
    /// The operation completed; never sent on the wire.
    Success = 0x00,
    /// The attribute handle given was not valid on this server.
    InvalidHandle = 0x01,
    /// The attribute cannot be read.
    ReadNotPermitted = 0x02,
    /// The attribute cannot be written.
    WriteNotPermitted = 0x03,
    /// The attribute PDU was invalid.
    InvalidPdu = 0x04,
    /// The attribute requires authentication before it can be accessed.
    InsufficientAuthentication = 0x05,
    /// The server does not support the request received from the client.
    RequestNotSupported = 0x06,
    /// The specified offset was past the end of the attribute.
    InvalidOffset = 0x07,
    /// The attribute requires authorization before it can be accessed.
    InsufficientAuthorization = 0x08,
    /// Too many prepare writes have been queued.
    PrepareQueueFull = 0x09,
    /// No attribute found within the given attribute handle range.
    AttributeNotFound = 0x0A,
    /// The attribute cannot be read using an `ATT_READ_BLOB_REQ` PDU.
    AttributeNotLong = 0x0B,
    /// The encryption key size used for this link is too short.
    EncryptionKeySizeTooShort = 0x0C,
    /// The attribute value length is invalid for the operation.
    InvalidAttributeValueLength = 0x0D,
    /// The request encountered an unlikely error and could not be completed.
    UnlikelyError = 0x0E,
    /// The attribute requires encryption before it can be accessed.
    InsufficientEncryption = 0x0F,
    /// The attribute type is not a supported grouping attribute.
    UnsupportedGroupType = 0x10,
    /// Insufficient resources to complete the request.
    InsufficientResources = 0x11,
}

impl Display for ErrorCode {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
