//! MBAP framing for Modbus TCP
//!
//! `transaction id (2) | protocol id (2) | length (2) | unit id (1) | PDU`
//!
//! The length field counts the unit id plus the PDU. A length outside
//! `2..=254` leaves no way to find the next frame boundary, so the decoder
//! fails and the connection is dropped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const MBAP_HEADER_LEN: usize = 7;
const MIN_LENGTH: u16 = 2;
const MAX_LENGTH: u16 = 254;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("MBAP length {0} outside 2..=254")]
    InvalidLength(u16),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// 0 for Modbus
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub header: MbapHeader,
    pub pdu: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Bytes,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = RequestFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MBAP_HEADER_LEN {
            src.reserve(MBAP_HEADER_LEN - src.len());
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[4], src[5]]);
        if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
            return Err(FrameError::InvalidLength(length));
        }

        // length already includes the unit id byte
        let total = MBAP_HEADER_LEN - 1 + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let header = MbapHeader {
            transaction_id: frame.get_u16(),
            protocol_id: frame.get_u16(),
            length: frame.get_u16(),
            unit_id: frame.get_u8(),
        };

        Ok(Some(RequestFrame {
            header,
            pdu: frame.freeze(),
        }))
    }
}

impl Encoder<ResponseFrame> for MbapCodec {
    type Error = FrameError;

    fn encode(&mut self, item: ResponseFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(MBAP_HEADER_LEN + item.pdu.len());
        dst.put_u16(item.transaction_id);
        dst.put_u16(0);
        dst.put_u16(item.pdu.len() as u16 + 1);
        dst.put_u8(item.unit_id);
        dst.put_slice(&item.pdu);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x0B]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.transaction_id, 7);
        assert_eq!(frame.header.unit_id, 1);
        assert_eq!(&frame.pdu[..], &[0x03, 0x00, 0x00, 0x00, 0x0B]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::new();
        for tid in [1u8, 2] {
            buf.extend_from_slice(&[0x00, tid, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x64, 0x00, 0x01]);
        }

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().header.transaction_id, 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().header.transaction_id, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_nonzero_protocol_id_still_framed() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x12, 0x34, 0x00, 0x02, 0x01, 0x03][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.protocol_id, 0x1234);
    }

    #[test]
    fn test_invalid_length_is_fatal() {
        let mut codec = MbapCodec;
        for length in [0u8, 1, 255] {
            let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, length, 0x01][..]);
            assert!(matches!(
                codec.decode(&mut buf),
                Err(FrameError::InvalidLength(_))
            ));
        }
    }

    #[test]
    fn test_encode_response() {
        let mut codec = MbapCodec;
        let mut dst = BytesMut::new();
        codec
            .encode(
                ResponseFrame {
                    transaction_id: 0xBEEF,
                    unit_id: 1,
                    pdu: Bytes::from_static(&[0x83, 0x02]),
                },
                &mut dst,
            )
            .unwrap();
        assert_eq!(&dst[..], &[0xBE, 0xEF, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]);
    }
}
