// Copyright 2026 Highway RPC Developers

//! Highway frame codec.
//!
//! Every frame starts with a fixed 23 byte header followed by two variable
//! length sections, the serialized control header and the opaque body:
//!
//! ```text
//! 0      7                15        19        23            23+HLEN
//! +------+----------------+---------+---------+-------------+----------+
//! | MAGIC| CORRELATION ID | TOTALLEN| HDRLEN  | CONTROL HDR | BODY     |
//! +------+----------------+---------+---------+-------------+----------+
//! ```
//!
//! All integers are big-endian. `TOTALLEN = HDRLEN + BODYLEN`.

use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{HighwayError, Result};

pub const HW_MAGIC: &[u8; 7] = b"highway";

const HW_OFF_MAGIC: usize = 0x0;
const HW_OFF_CORRELATION_ID: usize = 0x7;
const HW_OFF_TOTAL_LEN: usize = 0xf;
const HW_OFF_HEADER_LEN: usize = 0x13;
const HW_OFF_DATA: usize = 0x17;

pub const HW_HEADER_SZ: usize = HW_OFF_DATA;

/// The fixed-size region at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub correlation_id: u64,
    pub total_len: u32,
    pub header_len: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> Result<FrameHeader> {
        if buf.len() < HW_HEADER_SZ {
            return Err(HighwayError::framing(
                "unable to parse frame header: not enough bytes",
            ));
        }
        check_magic(buf)?;

        let correlation_id = BigEndian::read_u64(
            &buf[HW_OFF_CORRELATION_ID..HW_OFF_TOTAL_LEN],
        );
        let total_len =
            BigEndian::read_u32(&buf[HW_OFF_TOTAL_LEN..HW_OFF_HEADER_LEN]);
        let header_len =
            BigEndian::read_u32(&buf[HW_OFF_HEADER_LEN..HW_OFF_DATA]);

        Ok(FrameHeader {
            correlation_id,
            total_len,
            header_len,
        })
    }

    /// Length of the body section. A header length larger than the total
    /// length is rejected rather than wrapped.
    pub fn body_len(&self) -> Result<u32> {
        self.total_len.checked_sub(self.header_len).ok_or_else(|| {
            HighwayError::framing(format!(
                "negative body length: total {} < header {}",
                self.total_len, self.header_len
            ))
        })
    }
}

fn check_magic(buf: &[u8]) -> Result<()> {
    let magic = &buf[HW_OFF_MAGIC..HW_OFF_CORRELATION_ID];
    if magic != HW_MAGIC {
        Err(HighwayError::framing(format!("bad magic {:02x?}", magic)))
    } else {
        Ok(())
    }
}

/// One complete wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: u64,
    pub header: Bytes,
    pub body: Bytes,
}

impl Frame {
    pub fn new<H, B>(correlation_id: u64, header: H, body: B) -> Frame
    where
        H: Into<Bytes>,
        B: Into<Bytes>,
    {
        Frame {
            correlation_id,
            header: header.into(),
            body: body.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HW_HEADER_SZ + self.header.len() + self.body.len()
    }

    /// Splits a payload of exactly `header.total_len` bytes into the control
    /// header and body sections.
    fn from_payload(header: &FrameHeader, mut payload: Bytes) -> Result<Frame> {
        let body_len = header.body_len()?;
        if payload.len() != header.total_len as usize {
            return Err(HighwayError::framing(format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.total_len
            )));
        }
        let control = payload.split_to(header.header_len as usize);
        debug_assert_eq!(payload.len(), body_len as usize);

        Ok(Frame {
            correlation_id: header.correlation_id,
            header: control,
            body: payload,
        })
    }
}

/// Writes magic, correlation id, total length, header length and then the
/// two sections into `buf`.
pub fn encode_frame(
    correlation_id: u64,
    header: &[u8],
    body: &[u8],
    buf: &mut BytesMut,
) -> Result<()> {
    let header_len = u32::try_from(header.len()).map_err(|_| {
        HighwayError::framing("control header does not fit in 32 bits")
    })?;
    let total_len = header
        .len()
        .checked_add(body.len())
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| HighwayError::framing("frame does not fit in 32 bits"))?;

    buf.reserve(HW_HEADER_SZ + total_len as usize);
    buf.put_slice(HW_MAGIC);
    buf.put_u64(correlation_id);
    buf.put_u32(total_len);
    buf.put_u32(header_len);
    buf.put_slice(header);
    buf.put_slice(body);
    Ok(())
}

/// Reads exactly the fixed header region.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte of a
/// new frame. A stream that ends partway through the header is a framing
/// error.
pub async fn decode_frame_header<R>(reader: &mut R) -> Result<Option<FrameHeader>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HW_HEADER_SZ];
    let mut filled = 0;
    while filled < HW_HEADER_SZ {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(HighwayError::framing(format!(
                "stream ended after {} of {} header bytes",
                filled, HW_HEADER_SZ
            )));
        }
        filled += n;
    }
    FrameHeader::parse(&raw).map(Some)
}

/// Reads exactly `total_len` bytes of control header plus body.
pub async fn decode_frame_payload<R>(reader: &mut R, total_len: u32) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; total_len as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            HighwayError::framing(format!(
                "stream ended before {} payload bytes arrived",
                total_len
            ))
        } else {
            HighwayError::Io(e)
        }
    })?;
    Ok(Bytes::from(payload))
}

/// Reads one whole frame, or `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let header = match decode_frame_header(reader).await? {
        Some(header) => header,
        None => return Ok(None),
    };
    header.body_len()?;
    let payload = decode_frame_payload(reader, header.total_len).await?;
    Frame::from_payload(&header, payload).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(frame.encoded_len());
    encode_frame(frame.correlation_id, &frame.header, &frame.body, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Stream codec used by the connection receive loops.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighwayCodec;

impl Decoder for HighwayCodec {
    type Item = Frame;
    type Error = HighwayError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() >= HW_OFF_CORRELATION_ID {
            check_magic(buf)?;
        }
        if buf.len() < HW_HEADER_SZ {
            return Ok(None);
        }

        let header = FrameHeader::parse(&buf[..HW_HEADER_SZ])?;
        header.body_len()?;
        let frame_len = HW_HEADER_SZ + header.total_len as usize;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(HW_HEADER_SZ);
        let payload = buf.split_to(header.total_len as usize).freeze();
        Frame::from_payload(&header, payload).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(HighwayError::framing(format!(
                "stream ended with {} bytes of a partial frame",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Frame> for HighwayCodec {
    type Error = HighwayError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<()> {
        encode_frame(frame.correlation_id, &frame.header, &frame.body, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::{quickcheck, TestResult};

    fn encoded(id: u64, header: &[u8], body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(id, header, body, &mut buf).unwrap();
        buf
    }

    #[test]
    fn header_layout() {
        let buf = encoded(0x0102_0304_0506_0708, b"hdr", b"body!");
        assert_eq!(&buf[..7], b"highway");
        assert_eq!(&buf[7..15], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(BigEndian::read_u32(&buf[15..19]), 8);
        assert_eq!(BigEndian::read_u32(&buf[19..23]), 3);
        assert_eq!(&buf[23..26], b"hdr");
        assert_eq!(&buf[26..], b"body!");
    }

    #[test]
    fn codec_round_trip() {
        fn prop(id: u64, header: Vec<u8>, body: Vec<u8>) -> TestResult {
            let mut buf = encoded(id, &header, &body);
            let frame = match HighwayCodec.decode(&mut buf) {
                Ok(Some(frame)) => frame,
                _ => return TestResult::failed(),
            };
            TestResult::from_bool(
                buf.is_empty()
                    && frame.correlation_id == id
                    && frame.header[..] == header[..]
                    && frame.body[..] == body[..],
            )
        }
        quickcheck(prop as fn(u64, Vec<u8>, Vec<u8>) -> TestResult);
    }

    #[test]
    fn codec_waits_for_whole_frame() {
        let full = encoded(9, b"h", b"payload");
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(HighwayCodec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        let frame = HighwayCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.body, Bytes::from_static(b"payload"));
    }

    #[test]
    fn codec_decodes_back_to_back_frames() {
        let mut buf = encoded(1, b"a", b"");
        buf.extend_from_slice(&encoded(2, b"b", b"x"));
        let first = HighwayCodec.decode(&mut buf).unwrap().unwrap();
        let second = HighwayCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.correlation_id, 1);
        assert!(first.body.is_empty());
        assert_eq!(second.correlation_id, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn bad_magic_is_framing_error() {
        let mut buf = encoded(1, b"h", b"b");
        buf[0] = b'H';
        assert!(matches!(
            HighwayCodec.decode(&mut buf),
            Err(HighwayError::Framing(_))
        ));
    }

    #[test]
    fn negative_body_length_is_rejected() {
        let mut buf = encoded(1, b"hdr", b"");
        // header length 3 > total length 2
        buf[15..19].copy_from_slice(&2u32.to_be_bytes());
        assert!(matches!(
            HighwayCodec.decode(&mut buf),
            Err(HighwayError::Framing(_))
        ));
    }

    #[test]
    fn eof_mid_frame_is_framing_error() {
        let full = encoded(3, b"h", b"body");
        let mut partial = BytesMut::from(&full[..10]);
        assert!(matches!(
            HighwayCodec.decode_eof(&mut partial),
            Err(HighwayError::Framing(_))
        ));
        let mut empty = BytesMut::new();
        assert!(HighwayCodec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_from_chunked_stream() {
        let full = encoded(42, b"ctl", b"ping");
        let mut reader = tokio_test::io::Builder::new()
            .read(&full[..5])
            .read(&full[5..20])
            .read(&full[20..])
            .build();
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.correlation_id, 42);
        assert_eq!(frame.header, Bytes::from_static(b"ctl"));
        assert_eq!(frame.body, Bytes::from_static(b"ping"));
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_header_and_payload() {
        let full = encoded(42, b"ctl", b"ping");

        let mut short_header: &[u8] = &full[..HW_HEADER_SZ - 1];
        assert!(matches!(
            decode_frame_header(&mut short_header).await,
            Err(HighwayError::Framing(_))
        ));

        let mut short_payload: &[u8] = &full[..full.len() - 2];
        assert!(matches!(
            read_frame(&mut short_payload).await,
            Err(HighwayError::Framing(_))
        ));

        let mut clean: &[u8] = &[];
        assert!(decode_frame_header(&mut clean).await.unwrap().is_none());
    }
}
