//! Response framing for the binary protocol.
//!
//! The response header mirrors the request header byte for byte, except
//! that the vbucket field carries the two-byte status and the magic is
//! `0x81`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::{HDR_LEN, MAX_BODY_LEN};
use crate::error::{Error, Result};
use crate::protocol::{OpCode, REQ_MAGIC, RES_MAGIC, Status};

/// A memcached response.
///
/// The buffer behind `extras`/`key`/`body` is owned by the response and is
/// not shared with the connection after it is returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Opcode of the command that produced this response.
    pub opcode: OpCode,
    /// Outcome reported by the server.
    pub status: Status,
    /// The opaque sent in the request.
    pub opaque: u32,
    /// The CAS identifier, when applicable.
    pub cas: u64,
    /// Response extras.
    pub extras: Bytes,
    /// Response key (GETK and friends).
    pub key: Bytes,
    /// Response value payload.
    pub body: Bytes,
}

impl Response {
    /// Number of bytes this response consumes on the wire.
    pub fn size(&self) -> usize {
        HDR_LEN + self.extras.len() + self.key.len() + self.body.len()
    }

    /// Full wire representation. Used by test servers.
    pub fn bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u8(RES_MAGIC);
        buf.put_u8(self.opcode as u8);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        // data type, reserved
        buf.put_u8(0);
        buf.put_u16(self.status as u16);
        buf.put_u32((self.extras.len() + self.key.len() + self.body.len()) as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Fill a response with data from a reader.
    ///
    /// Reads exactly 24 header bytes into the caller's reusable scratch
    /// buffer, validates magic and size bounds, then reads exactly
    /// `extras_len + key_len + value_len` more and slices them apart.
    pub async fn receive<R: AsyncRead + Unpin>(
        rd: &mut R,
        hdr_buf: &mut [u8; HDR_LEN],
    ) -> Result<Response> {
        rd.read_exact(hdr_buf).await?;

        if hdr_buf[0] != RES_MAGIC && hdr_buf[0] != REQ_MAGIC {
            return Err(Error::BadMagic(hdr_buf[0]));
        }

        let opcode: OpCode = num_traits::FromPrimitive::from_u8(hdr_buf[1])
            .ok_or(Error::Io(std::io::ErrorKind::InvalidData))?;

        let mut hdr = &hdr_buf[2..];
        let key_len = hdr.get_u16() as usize;
        let extras_len = hdr.get_u8() as usize;
        // data type, reserved
        hdr.advance(1);
        let status = Status::from_wire(hdr.get_u16());
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

        Ok(Response {
            opcode,
            status,
            opaque,
            cas,
            extras,
            key,
            body: buf,
        })
    }

    /// Convert this response into a `Result`, classifying any non-success
    /// status into its error kind while keeping the response inside the
    /// error.
    pub fn into_result(self) -> Result<Response> {
        if self.status == Status::Success {
            Ok(self)
        } else {
            Err(Error::from_response(self))
        }
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{Response status={}, opcode={}, opaque={}, bodylen={}}}",
            self.status,
            self.opcode,
            self.opaque,
            self.body.len(),
        )
    }
}
