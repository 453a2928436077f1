//! UNI-TELWAY frame codec.
//!
//! A frame carries one UNI-TE message behind an X-WAY header:
//!
//! ```text
//! <DLE> <STX> addr len [X-WAY header (6)] code [payload] BCC
//! ```
//!
//! Every `<DLE>` in `len` and in the data section is doubled on the wire, the
//! address and the BCC never are. See [`crate::checksum`] for the BCC.

use std::convert::TryFrom;
use std::iter::once;

use arrayvec::ArrayVec;
use log::trace;
use snafu::{ensure, Snafu};

use crate::ascii::*;
use crate::buffer::Buffer;
use crate::checksum;
use crate::nom_parser::{self, RawFrame};
use crate::types::{Address, XwayHeader};

/// Maximum length of the data section, X-WAY header and code included.
pub const MAX_DATA_LEN: usize = 255;
/// Maximum length of the payload following the UNI-TE code.
pub const MAX_PAYLOAD_LEN: usize = MAX_DATA_LEN - XwayHeader::LEN - 1;
/// Maximum length of an encoded frame, with every data byte doubled.
pub const MAX_FRAME_LEN: usize = 3 + 2 * (1 + MAX_DATA_LEN) + 1;

pub type Payload = ArrayVec<u8, MAX_PAYLOAD_LEN>;
pub type FrameBytes = ArrayVec<u8, MAX_FRAME_LEN>;

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[snafu(display("Payload of {} bytes exceeds the maximum of {}", len, max))]
    PayloadTooLarge { len: usize, max: usize },
}

/// Errors from decoding received bytes.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes end in the middle of a frame. Wait for more data.
    #[snafu(display("Truncated frame"))]
    Truncated,
    #[snafu(display("Bad framing: {}", reason))]
    BadFraming { reason: &'static str },
    #[snafu(display(
        "Checksum mismatch, computed {:#04x}, received {:#04x}",
        expected,
        received
    ))]
    ChecksumMismatch { expected: u8, received: u8 },
    /// The station answered with `<NAK>`.
    #[snafu(display("Negative acknowledge"))]
    NegativeAcknowledge,
}

impl DecodeError {
    /// True if the error goes away by itself once more bytes are received.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::Truncated)
    }
}

/// One UNI-TELWAY frame, the checksum excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    address: u8,
    header: XwayHeader,
    code: u8,
    payload: Payload,
}

impl Frame {
    /// # Errors
    /// [`EncodeError::PayloadTooLarge`] if `payload` doesn't fit in a frame.
    pub fn new(
        address: Address,
        header: XwayHeader,
        code: u8,
        payload: &[u8],
    ) -> Result<Self, EncodeError> {
        let payload = Payload::try_from(payload).map_err(|_| EncodeError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        })?;
        Ok(Self {
            address: *address,
            header,
            code,
            payload,
        })
    }

    /// Link address of the frame. Received frames may carry any value.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn header(&self) -> XwayHeader {
        self.header
    }

    /// UNI-TE request or response code.
    pub fn code(&self) -> u8 {
        self.code
    }

    /// UNI-TE bytes after the code.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Encode the frame to its on-wire form, with a freshly computed BCC.
    pub fn encode(&self) -> FrameBytes {
        let mut out = FrameBytes::new();
        out.push(DLE);
        out.push(STX);
        out.push(self.address);
        // bounded by the payload capacity
        let len = (XwayHeader::LEN + 1 + self.payload.len()) as u8;
        let header = self.header.to_bytes();
        let data = once(&len)
            .chain(header.iter())
            .chain(once(&self.code))
            .chain(self.payload.iter());
        for &byte in data {
            out.push(byte);
            if byte == DLE {
                out.push(DLE);
            }
        }
        let bcc = checksum::compute(&out);
        out.push(bcc);
        out
    }

    /// Decode the frame at the start of `bytes`. Returns the frame and the
    /// number of bytes it occupied.
    ///
    /// # Errors
    /// [`DecodeError::Truncated`] if `bytes` ends inside the frame, otherwise
    /// [`DecodeError::BadFraming`] or [`DecodeError::ChecksumMismatch`].
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        match nom_parser::parse_frame(bytes) {
            (_, nom_parser::Token::NeedData) => TruncatedSnafu.fail(),
            (consumed, nom_parser::Token::Frame(raw)) => Ok((Self::from_raw(raw)?, consumed)),
            _ => BadFramingSnafu {
                reason: "no <DLE> <STX> frame start",
            }
            .fail(),
        }
    }

    fn from_raw(raw: RawFrame<'_>) -> Result<Self, DecodeError> {
        ensure!(
            checksum::verify(raw.covered, raw.bcc),
            ChecksumMismatchSnafu {
                expected: checksum::compute(raw.covered),
                received: raw.bcc,
            }
        );
        ensure!(
            raw.data.len() > XwayHeader::LEN,
            BadFramingSnafu {
                reason: "data section shorter than the X-WAY header and code",
            }
        );
        let mut header = [0; XwayHeader::LEN];
        header.copy_from_slice(&raw.data[..XwayHeader::LEN]);
        let payload = Payload::try_from(&raw.data[XwayHeader::LEN + 1..]).map_err(|_| {
            DecodeError::BadFraming {
                reason: "payload too long",
            }
        })?;
        Ok(Self {
            address: raw.address,
            header: XwayHeader::from_bytes(header),
            code: raw.data[XwayHeader::LEN],
            payload,
        })
    }
}

/// Encode a frame in one go, see [`Frame::encode`].
///
/// # Errors
/// [`EncodeError::PayloadTooLarge`] if `payload` doesn't fit in a frame.
pub fn encode(
    address: Address,
    header: XwayHeader,
    code: u8,
    payload: &[u8],
) -> Result<FrameBytes, EncodeError> {
    Ok(Frame::new(address, header, code, payload)?.encode())
}

/// See [`Frame::decode`].
pub fn decode(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    Frame::decode(bytes)
}

/// A complete unit of the received byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A frame with a valid checksum.
    Frame(Frame),
    /// `<DLE> <ENQ> addr`, the bus master giving `addr` the right to talk.
    Poll(u8),
    /// `<NAK>`, the station rejected the last frame.
    Nak,
}

/// Accumulates received bytes and extracts complete tokens from them.
///
/// Bytes may be pushed in chunks of any size, a token is only returned once
/// all of it has been received.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Buffer,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buffer: Buffer::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.write(bytes);
    }

    /// Number of buffered bytes not yet returned as a token.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    /// True if the buffer holds the start of a token but not all of it.
    /// Only meaningful after [`next_token`](Self::next_token) returned `Ok(None)`.
    pub fn incomplete(&self) -> bool {
        !self.is_empty()
    }

    /// Extract the next token. Line noise between tokens is skipped.
    ///
    /// Returns `Ok(None)` when more data is needed. A corrupt frame is
    /// reported once and dropped whole, then the buffer is resynchronised on
    /// the next `<DLE> <STX>`, `<DLE> <ENQ>` or `<NAK>`.
    ///
    /// # Errors
    /// [`DecodeError::BadFraming`] or [`DecodeError::ChecksumMismatch`].
    pub fn next_token(&mut self) -> Result<Option<Token>, DecodeError> {
        use nom_parser::Token as Raw;
        loop {
            let (consumed, result) = match nom_parser::parse_token(self.buffer.as_ref()) {
                (_, Raw::NeedData) => return Ok(None),
                (consumed, Raw::Noise) => {
                    trace!(
                        "skipping noise: {}",
                        crate::hex(&self.buffer.as_ref()[..consumed])
                    );
                    (consumed, None)
                }
                (consumed, Raw::Poll(address)) => (consumed, Some(Ok(Token::Poll(address)))),
                (consumed, Raw::Nak) => (consumed, Some(Ok(Token::Nak))),
                (consumed, Raw::Invalid) => (
                    consumed,
                    Some(BadFramingSnafu {
                        reason: "<DLE> not followed by <STX>, <ENQ> or <DLE>",
                    }
                    .fail()),
                ),
                (consumed, Raw::Frame(raw)) => {
                    (consumed, Some(Frame::from_raw(raw).map(Token::Frame)))
                }
            };
            match result {
                None => self.buffer.consume(consumed),
                Some(Ok(token)) => {
                    self.buffer.consume(consumed);
                    return Ok(Some(token));
                }
                Some(Err(err)) => {
                    self.buffer.consume(consumed);
                    self.skip_to_token_start();
                    return Err(err);
                }
            }
        }
    }

    /// Like [`next_token`](Self::next_token), but polls and `<NAK>`s are skipped.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        loop {
            match self.next_token()? {
                Some(Token::Frame(frame)) => return Ok(Some(frame)),
                Some(token) => trace!("skipping {:?}", token),
                None => return Ok(None),
            }
        }
    }

    /// Drop everything up to the next token start. A trailing `<DLE>` is
    /// kept, it may be the start of a token still being received.
    fn skip_to_token_start(&mut self) {
        let data = self.buffer.as_ref();
        let skip = (0..data.len())
            .find(|&i| match data[i] {
                NAK => true,
                DLE => matches!(data.get(i + 1), None | Some(&STX) | Some(&ENQ)),
                _ => false,
            })
            .unwrap_or_else(|| data.len());
        self.buffer.consume(skip);
    }
}
