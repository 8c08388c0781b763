//! Framing for both directions of a worker channel.
//!
//! [`RequestCodec`] writes client requests and reads them back (the latter is
//! what a worker does, and what the fake worker in the test suite uses).
//! [`ParcelCodec`] does the same for response parcels.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use super::{MAX_PARCEL_LEN, MIN_FRAME_LEN, Opcode, ParcelType, message::Request};
use crate::error::{Error, ProtocolError};

/// Peeks a msgpack unsigned integer at the start of `src`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the encoded width
/// and the value.
fn peek_uint(src: &[u8]) -> Result<Option<(usize, u64)>, ProtocolError> {
   let Some(&marker) = src.first() else {
      return Ok(None);
   };
   let extra = match marker {
      0x00..=0x7f => return Ok(Some((1, u64::from(marker)))),
      0xcc => 1,
      0xcd => 2,
      0xce => 4,
      0xcf => 8,
      other => return Err(ProtocolError::InvalidLengthMarker(other)),
   };
   if src.len() < 1 + extra {
      return Ok(None);
   }
   let value = src[1..=extra]
      .iter()
      .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
   Ok(Some((1 + extra, value)))
}

fn put_uint(dst: &mut BytesMut, value: u64) {
   let mut prefix = Vec::with_capacity(9);
   // Writing into a Vec cannot fail.
   let _ = rmp::encode::write_uint(&mut prefix, value);
   dst.put_slice(&prefix);
}

/// A decoded request frame: the opcode and the still-encoded argument map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
   pub opcode: Opcode,
   /// Msgpack bytes starting at the argument map. May carry trailing zero
   /// padding.
   pub args:   Bytes,
}

impl RequestFrame {
   pub fn args<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
      rmp_serde::from_slice(&self.args).map_err(|e| ProtocolError::Decode {
         what:   "request arguments",
         reason: e.to_string(),
      })
   }

   pub fn into_request(self) -> Result<Request, ProtocolError> {
      Request::from_frame(&self)
   }
}

/// Length-prefixed request frames, zero-padded to [`MIN_FRAME_LEN`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestCodec;

impl Encoder<&Request> for RequestCodec {
   type Error = Error;

   fn encode(&mut self, item: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
      let mut payload = item.to_msgpack()?;
      if payload.len() < MIN_FRAME_LEN {
         payload.resize(MIN_FRAME_LEN, 0);
      }
      dst.reserve(payload.len() + 9);
      put_uint(dst, payload.len() as u64);
      dst.put_slice(&payload);
      Ok(())
   }
}

impl Encoder<Request> for RequestCodec {
   type Error = Error;

   fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
      Encoder::<&Request>::encode(self, &item, dst)
   }
}

impl Decoder for RequestCodec {
   type Error = Error;
   type Item = RequestFrame;

   fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
      let Some((width, len)) = peek_uint(src)? else {
         return Ok(None);
      };
      if len > MAX_PARCEL_LEN {
         return Err(ProtocolError::ParcelTooLarge(len).into());
      }
      let total = width + len as usize;
      if src.len() < total {
         src.reserve(total - src.len());
         return Ok(None);
      }
      src.advance(width);
      let frame = src.split_to(len as usize).freeze();

      let mut cursor: &[u8] = &frame;
      let arity = rmp::decode::read_array_len(&mut cursor)
         .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
      if arity != 2 {
         return Err(ProtocolError::MalformedFrame(format!("expected 2 elements, got {arity}")).into());
      }
      let opcode: u8 = rmp::decode::read_int(&mut cursor)
         .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
      let opcode = Opcode::from_u8(opcode)?;
      let consumed = frame.len() - cursor.len();
      Ok(Some(RequestFrame { opcode, args: frame.slice(consumed..) }))
   }
}

/// One response parcel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
   pub kind: ParcelType,
   pub body: Bytes,
}

impl Parcel {
   pub fn new(kind: ParcelType, body: impl Into<Bytes>) -> Self {
      Self { kind, body: body.into() }
   }

   pub const fn empty(kind: ParcelType) -> Self {
      Self { kind, body: Bytes::new() }
   }

   /// Decodes the body as msgpack into `T`.
   pub fn decode<T: DeserializeOwned>(&self, what: &'static str) -> Result<T, ProtocolError> {
      rmp_serde::from_slice(&self.body).map_err(|e| ProtocolError::Decode {
         what,
         reason: e.to_string(),
      })
   }
}

/// `[type][msgpack uint length][body]` parcels.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParcelCodec;

impl Decoder for ParcelCodec {
   type Error = Error;
   type Item = Parcel;

   fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
      let Some(&type_byte) = src.first() else {
         return Ok(None);
      };
      let kind = ParcelType::from_u8(type_byte)?;
      let Some((width, len)) = peek_uint(&src[1..])? else {
         return Ok(None);
      };
      if len > MAX_PARCEL_LEN {
         return Err(ProtocolError::ParcelTooLarge(len).into());
      }
      let header = 1 + width;
      let total = header + len as usize;
      if src.len() < total {
         src.reserve(total - src.len());
         return Ok(None);
      }
      src.advance(header);
      let body = src.split_to(len as usize).freeze();
      Ok(Some(Parcel { kind, body }))
   }
}

impl Encoder<Parcel> for ParcelCodec {
   type Error = Error;

   fn encode(&mut self, item: Parcel, dst: &mut BytesMut) -> Result<(), Self::Error> {
      dst.reserve(item.body.len() + 10);
      dst.put_u8(item.kind.as_u8());
      put_uint(dst, item.body.len() as u64);
      dst.put_slice(&item.body);
      Ok(())
   }
}
