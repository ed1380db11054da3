//! Request framing for the binary protocol.
//!
//! Every request is a 24-byte header followed by extras, key, and body in
//! that order. All multi-byte integers are big-endian. Extras layout is a
//! function of the opcode and is produced by [`Request::prepare_extras`].
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!    /              |               |               |               |
//!   |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
//!   +---------------+---------------+---------------+---------------+
//!  0| Magic         | Opcode        | Key length                    |
//!   +---------------+---------------+---------------+---------------+
//!  4| Extras length | Data type     | vbucket id                    |
//!   +---------------+---------------+---------------+---------------+
//!  8| Total body length                                             |
//!   +---------------+---------------+---------------+---------------+
//! 12| Opaque                                                        |
//!   +---------------+---------------+---------------+---------------+
//! 16| CAS                                                           |
//!   |                                                               |
//!   +---------------+---------------+---------------+---------------+
//!   Total 24 bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{BODY_SPLIT_LEN, HDR_LEN, MAX_BODY_LEN};
use crate::error::{Error, Result};
use crate::protocol::{OpCode, REQ_MAGIC, RES_MAGIC};

/// A memcached request.
///
/// Each request is exclusively owned by the operation that created it and
/// immutable once encoding begins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// The command being issued.
    pub opcode: OpCode,
    /// The CAS token (or 0 when not applicable).
    pub cas: u64,
    /// An opaque value echoed back with the response.
    pub opaque: u32,
    /// Command extras; layout depends on the opcode.
    pub extras: Bytes,
    /// The key, if the command takes one.
    pub key: Bytes,
    /// The value payload, if the command takes one.
    pub body: Bytes,
}

impl Request {
    /// Number of bytes this request occupies on the wire.
    pub fn size(&self) -> usize {
        HDR_LEN + self.extras.len() + self.key.len() + self.body.len()
    }

    /// Fill `extras` according to the opcode's layout.
    ///
    /// - SET/ADD/REPLACE (and quiet forms): 8 bytes, `flags(4)=0 | expiration(4)`
    /// - INCREMENT/DECREMENT (and quiet forms): 20 bytes,
    ///   `delta(8) | initial(8) | expiration(4)`
    /// - FLUSH/FLUSHQ: 4 bytes, `expiration(4)`
    /// - everything else carries no extras
    ///
    /// An expiration of 0 means "no expiry"; the initial value applies only
    /// when the key is absent, with semantics delegated to the server.
    pub fn prepare_extras(&mut self, expiration: u32, delta: u64, initial: u64) {
        match self.opcode {
            OpCode::Set
            | OpCode::SetQ
            | OpCode::Add
            | OpCode::AddQ
            | OpCode::Replace
            | OpCode::ReplaceQ => {
                let mut extras = BytesMut::with_capacity(8);
                // flags always zero
                extras.put_u32(0);
                extras.put_u32(expiration);
                self.extras = extras.freeze();
            }
            OpCode::Increment | OpCode::IncrementQ | OpCode::Decrement | OpCode::DecrementQ => {
                let mut extras = BytesMut::with_capacity(20);
                extras.put_u64(delta);
                extras.put_u64(initial);
                extras.put_u32(expiration);
                self.extras = extras.freeze();
            }
            OpCode::Flush | OpCode::FlushQ => {
                let mut extras = BytesMut::with_capacity(4);
                extras.put_u32(expiration);
                self.extras = extras.freeze();
            }
            // MUST NOT have extras.
            _ => self.extras = Bytes::new(),
        }
    }

    fn put_header(&self, buf: &mut BytesMut) {
        buf.put_u8(REQ_MAGIC);
        buf.put_u8(self.opcode as u8);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        // data type, reserved
        buf.put_u8(0);
        // vbucket id, reserved
        buf.put_u16(0);
        buf.put_u32((self.extras.len() + self.key.len() + self.body.len()) as u32);
        buf.put_u32(self.opaque);
        // The CAS region stays zeroed when no token is supplied.
        buf.put_u64(self.cas);
    }

    /// Wire representation of the header with extras and key appended.
    pub fn header_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HDR_LEN + self.extras.len() + self.key.len());
        self.put_header(&mut buf);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.freeze()
    }

    /// Full wire representation of this request.
    pub fn bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.put_header(&mut buf);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Send this request across a writer.
    ///
    /// Bodies under [`BODY_SPLIT_LEN`] go out as one contiguous buffer;
    /// larger bodies are written after the header to avoid the copy. Both
    /// paths are behaviorally indistinguishable on the wire.
    pub async fn transmit<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<usize> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(Error::BodyTooLarge(self.body.len()));
        }

        if self.body.len() < BODY_SPLIT_LEN {
            let data = self.bytes();
            w.write_all(&data).await?;
            Ok(data.len())
        } else {
            let head = self.header_bytes();
            w.write_all(&head).await?;
            w.write_all(&self.body).await?;
            Ok(head.len() + self.body.len())
        }
    }

    /// Fill this request with data from a reader.
    ///
    /// `hdr_buf` is the caller's reusable 24-byte header scratch space.
    /// Used by test servers and round-trip checks; the client itself only
    /// ever receives responses.
    pub async fn receive<R: AsyncRead + Unpin>(
        rd: &mut R,
        hdr_buf: &mut [u8; HDR_LEN],
    ) -> Result<Request> {
        rd.read_exact(hdr_buf).await?;

        if hdr_buf[0] != REQ_MAGIC && hdr_buf[0] != RES_MAGIC {
            return Err(Error::BadMagic(hdr_buf[0]));
        }

        let opcode = num_traits::FromPrimitive::from_u8(hdr_buf[1])
            .ok_or(Error::Io(std::io::ErrorKind::InvalidData))?;

        let mut hdr = &hdr_buf[2..];
        let key_len = hdr.get_u16() as usize;
        let extras_len = hdr.get_u8() as usize;
        // data type + vbucket, reserved
        hdr.advance(3);
        let total_len = hdr.get_u32() as usize;
        let opaque = hdr.get_u32();
        let cas = hdr.get_u64();

        if total_len > MAX_BODY_LEN {
            return Err(Error::OversizedFrame(total_len));
        }
        let body_len = total_len
            .checked_sub(key_len + extras_len)
            .ok_or(Error::Io(std::io::ErrorKind::InvalidData))?;

        let mut buf = vec![0u8; total_len];
        rd.read_exact(&mut buf).await?;
        let mut buf = Bytes::from(buf);

        let extras = buf.split_to(extras_len);
        let key = buf.split_to(key_len);
        debug_assert_eq!(buf.len(), body_len);

        Ok(Request {
            opcode,
            cas,
            opaque,
            extras,
            key,
            body: buf,
        })
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{Request opcode={}, bodylen={}, key='{}'}}",
            self.opcode,
            self.body.len(),
            String::from_utf8_lossy(&self.key),
        )
    }
}

/// Which conditional form a store operation takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Store only if the server does not already hold the key.
    #[default]
    Add,
    /// Store unconditionally, overwriting any existing value.
    Set,
    /// Store only if the server already holds the key.
    Replace,
}

impl StoreMode {
    pub fn resolve(&self) -> OpCode {
        match self {
            StoreMode::Add => OpCode::Add,
            StoreMode::Set => OpCode::Set,
            StoreMode::Replace => OpCode::Replace,
        }
    }
}

/// Direction of an arithmetic delta operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaMode {
    /// Increase the value by the given amount.
    #[default]
    Increment,
    /// Decrease the value by the given amount.
    Decrement,
}

impl DeltaMode {
    pub fn resolve(&self) -> OpCode {
        match self {
            DeltaMode::Increment => OpCode::Increment,
            DeltaMode::Decrement => OpCode::Decrement,
        }
    }
}

/// Which end of an existing value the payload attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendMode {
    /// Append to the end of the existing value.
    #[default]
    Append,
    /// Prepend to the beginning of the existing value.
    Prepend,
}

impl AppendMode {
    pub fn resolve(&self) -> OpCode {
        match self {
            AppendMode::Append => OpCode::Append,
            AppendMode::Prepend => OpCode::Prepend,
        }
    }
}
