//! Binary protocol opcodes and status codes.
//!
//! The memcached binary protocol identifies every command with a one-byte
//! opcode and every response outcome with a two-byte status. This module
//! defines both tables, the quiet-variant mapping used by pipelined batch
//! operations, and the SASL PLAIN payload helper.

use num_derive::FromPrimitive;

/// Magic byte opening every request header.
pub const REQ_MAGIC: u8 = 0x80;
/// Magic byte opening every response header.
pub const RES_MAGIC: u8 = 0x81;

/// The only SASL mechanism the client speaks.
pub const SASL_MECHANISM: &str = "PLAIN";

/// A memcached binary protocol command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Default)]
#[repr(u8)]
pub enum OpCode {
    #[default]
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
}

impl OpCode {
    /// Static command name, used as a log/metric label without allocating.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Get => "GET",
            OpCode::Set => "SET",
            OpCode::Add => "ADD",
            OpCode::Replace => "REPLACE",
            OpCode::Delete => "DELETE",
            OpCode::Increment => "INCREMENT",
            OpCode::Decrement => "DECREMENT",
            OpCode::Quit => "QUIT",
            OpCode::Flush => "FLUSH",
            OpCode::GetQ => "GETQ",
            OpCode::Noop => "NOOP",
            OpCode::Version => "VERSION",
            OpCode::GetK => "GETK",
            OpCode::GetKQ => "GETKQ",
            OpCode::Append => "APPEND",
            OpCode::Prepend => "PREPEND",
            OpCode::Stat => "STAT",
            OpCode::SetQ => "SETQ",
            OpCode::AddQ => "ADDQ",
            OpCode::ReplaceQ => "REPLACEQ",
            OpCode::DeleteQ => "DELETEQ",
            OpCode::IncrementQ => "INCREMENTQ",
            OpCode::DecrementQ => "DECREMENTQ",
            OpCode::QuitQ => "QUITQ",
            OpCode::FlushQ => "FLUSHQ",
            OpCode::AppendQ => "APPENDQ",
            OpCode::PrependQ => "PREPENDQ",
            OpCode::SaslListMechs => "SASL_LIST_MECHS",
            OpCode::SaslAuth => "SASL_AUTH",
            OpCode::SaslStep => "SASL_STEP",
        }
    }

    /// Returns true for commands the server answers only on error.
    ///
    /// Note that QUITQ and FLUSHQ are quiet on the wire but are never used
    /// by the batch framing path, which pipelines data-op quiet variants
    /// only (see [`OpCode::to_quiet`]).
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            OpCode::GetQ
                | OpCode::GetKQ
                | OpCode::SetQ
                | OpCode::AddQ
                | OpCode::ReplaceQ
                | OpCode::DeleteQ
                | OpCode::IncrementQ
                | OpCode::DecrementQ
                | OpCode::QuitQ
                | OpCode::FlushQ
                | OpCode::AppendQ
                | OpCode::PrependQ
        )
    }

    /// Map a data opcode to its quiet variant for batch pipelining.
    ///
    /// Already-quiet opcodes map to themselves. Opcodes without a data-op
    /// quiet variant (NOOP, VERSION, SASL, ...) are returned unchanged;
    /// callers only quieten data commands.
    pub fn to_quiet(&self) -> OpCode {
        if self.is_quiet() {
            return *self;
        }
        match self {
            OpCode::Get => OpCode::GetQ,
            OpCode::Set => OpCode::SetQ,
            OpCode::Add => OpCode::AddQ,
            OpCode::Replace => OpCode::ReplaceQ,
            OpCode::Delete => OpCode::DeleteQ,
            OpCode::Increment => OpCode::IncrementQ,
            OpCode::Decrement => OpCode::DecrementQ,
            OpCode::Flush => OpCode::FlushQ,
            OpCode::Append => OpCode::AppendQ,
            OpCode::Prepend => OpCode::PrependQ,
            other => *other,
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response status reported by the server.
///
/// The subset the client must classify; anything outside this table decodes
/// to [`Status::Unknown`] and is treated as a server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Default)]
#[repr(u16)]
pub enum Status {
    /// Successful operation.
    #[default]
    Success = 0x00,
    /// Key not found.
    KeyNotFound = 0x01,
    /// Key already exists.
    KeyExists = 0x02,
    /// Data size exceeds limit.
    ValueTooLarge = 0x03,
    /// Invalid arguments or operation parameters.
    InvalidArgs = 0x04,
    /// Operation was not performed because the data was not stored.
    NotStored = 0x05,
    /// Invalid value specified for increment/decrement.
    DeltaBadValue = 0x06,
    /// Authentication required / not successful.
    AuthFail = 0x20,
    /// Further authentication steps required.
    AuthContinue = 0x21,
    /// Unknown command.
    UnknownCommand = 0x81,
    /// Insufficient memory for the operation.
    OutOfMemory = 0x82,
    /// Temporary failure, the operation cannot be performed at the moment.
    TemporaryFail = 0x86,
    /// Not a memcached status; produced when a wire value falls outside
    /// the known table.
    Unknown = 0xffff,
}

impl Status {
    /// Decode a wire value, folding unrecognized codes into `Unknown`.
    pub fn from_wire(raw: u16) -> Status {
        num_traits::FromPrimitive::from_u16(raw).unwrap_or(Status::Unknown)
    }

    /// Static status name for logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::KeyNotFound => "KEY_NOT_FOUND",
            Status::KeyExists => "KEY_EXISTS",
            Status::ValueTooLarge => "VALUE_TOO_LARGE",
            Status::InvalidArgs => "INVALID_ARGS",
            Status::NotStored => "NOT_STORED",
            Status::DeltaBadValue => "DELTA_BAD_VALUE",
            Status::AuthFail => "AUTH_FAIL",
            Status::AuthContinue => "AUTH_CONTINUE",
            Status::UnknownCommand => "UNKNOWN_COMMAND",
            Status::OutOfMemory => "OUT_OF_MEMORY",
            Status::TemporaryFail => "TEMPORARY_FAIL",
            Status::Unknown => "UNKNOWN_STATUS",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the SASL PLAIN authentication body: `\0user\0pass`.
pub(crate) fn prepare_auth_data(user: &str, pass: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 + user.len() + pass.len());
    data.push(0);
    data.extend_from_slice(user.as_bytes());
    data.push(0);
    data.extend_from_slice(pass.as_bytes());
    data
}
