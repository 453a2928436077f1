//! UNI-TE requests and responses.
//!
//! Every operation the master can carry out is a [`Request`] variant. A
//! request encodes to a UNI-TE code and payload, and decodes the payload of
//! the station's response frame into a [`Response`].

use std::convert::TryFrom;

use nom::bytes::complete::take;
use nom::combinator::all_consuming;
use nom::multi::{length_count, length_data};
use nom::number::complete::{le_i16, le_u16, u8 as byte};
use nom::sequence::tuple;
use nom::IResult;
use snafu::ensure;

use crate::error::{invalid_argument, unexpected, Error, RejectedByStationSnafu, Rejection};
use crate::frame::{Frame, Payload, MAX_PAYLOAD_LEN};
use crate::types::{BitState, Category, Mode, ObjectKind, ObjectRef, ObjectValue, Width};

/// Response code of a request the station failed to carry out.
pub const REQUEST_FAILED: u8 = 0xFD;
/// Response code acknowledging writes and supervisor messages.
pub const ACKNOWLEDGED: u8 = 0xFE;
/// Sub-code of the available memory query, echoed in the response.
const AVAILABLE_MEMORY: u8 = 0x77;
/// Single channel access in the I/O channel requests.
const IO_CHANNEL_ACCESS: u8 = 0x01;

/// UNI-TE request codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RequestCode {
    Mirror,
    Identification,
    Status,
    AvailableMemory,
    SupervisorMessage,
    ReadInternalBit,
    ReadSystemBit,
    ReadInternalWord,
    ReadSystemWord,
    ReadConstantWord,
    ReadInternalDword,
    ReadConstantDword,
    WriteInternalBit,
    WriteSystemBit,
    WriteInternalWord,
    WriteSystemWord,
    WriteInternalDword,
    ReadObjects,
    WriteObjects,
    ReadIoChannel,
    WriteIoChannel,
}

impl RequestCode {
    pub const fn code(self) -> u8 {
        use RequestCode::*;
        match self {
            Mirror => 0xFA,
            Identification => 0x0F,
            Status => 0x31,
            AvailableMemory | SupervisorMessage => 0xF5,
            ReadInternalBit => 0x00,
            ReadSystemBit => 0x01,
            ReadInternalWord => 0x04,
            ReadConstantWord => 0x05,
            ReadSystemWord => 0x06,
            ReadInternalDword => 0x40,
            ReadConstantDword => 0x41,
            WriteInternalBit => 0x10,
            WriteSystemBit => 0x11,
            WriteInternalWord => 0x14,
            WriteSystemWord => 0x15,
            WriteInternalDword => 0x46,
            ReadObjects => 0x36,
            WriteObjects => 0x37,
            ReadIoChannel => 0x43,
            WriteIoChannel => 0x48,
        }
    }

    /// The code of a successful response.
    pub const fn response_code(self) -> u8 {
        use RequestCode::*;
        match self {
            Mirror => 0xFB,
            Identification => 0x3F,
            Status => 0x61,
            AvailableMemory => 0xF5,
            SupervisorMessage | WriteInternalBit | WriteSystemBit | WriteInternalWord
            | WriteSystemWord | WriteInternalDword | WriteObjects => ACKNOWLEDGED,
            ReadInternalBit | ReadSystemBit | ReadInternalWord | ReadSystemWord
            | ReadConstantWord | ReadInternalDword | ReadConstantDword | ReadObjects
            | ReadIoChannel | WriteIoChannel => self.code() + 0x30,
        }
    }

    /// Single object read of `kind`. NC objects are only reachable through
    /// [`RequestCode::ReadObjects`].
    pub const fn read(kind: ObjectKind) -> Option<Self> {
        use ObjectKind::*;
        Some(match kind {
            InternalBit => Self::ReadInternalBit,
            SystemBit => Self::ReadSystemBit,
            InternalWord => Self::ReadInternalWord,
            SystemWord => Self::ReadSystemWord,
            ConstantWord => Self::ReadConstantWord,
            InternalDword => Self::ReadInternalDword,
            ConstantDword => Self::ReadConstantDword,
            Nc(_) => return None,
        })
    }

    /// Single object write of `kind`, if there is one.
    pub const fn write(kind: ObjectKind) -> Option<Self> {
        use ObjectKind::*;
        Some(match kind {
            InternalBit => Self::WriteInternalBit,
            SystemBit => Self::WriteSystemBit,
            InternalWord => Self::WriteInternalWord,
            SystemWord => Self::WriteSystemWord,
            InternalDword => Self::WriteInternalDword,
            ConstantWord | ConstantDword | Nc(_) => return None,
        })
    }
}

/// An operation on the station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask the station to echo `data`.
    Mirror(Vec<u8>),
    Identification,
    Status,
    /// Free memory of the station, in bytes.
    AvailableMemory,
    /// An ASCII text message for the station's operator.
    SupervisorMessage(String),
    ReadObject(ObjectRef),
    /// Read `count` consecutive objects. Bit counts must be a multiple of 8.
    ReadObjects { start: ObjectRef, count: u16 },
    WriteObject(ObjectRef, ObjectValue),
    /// Write consecutive word or double word objects.
    WriteObjects {
        start: ObjectRef,
        values: Vec<ObjectValue>,
    },
    /// Read `count` of each of the `%I`, `%Q`, `%IW` and `%QW` objects of a
    /// channel, from `start`.
    ReadIoChannel {
        channel: IoChannel,
        start: u8,
        count: u8,
    },
    /// Write bits and words of a channel from `start`. The object count is
    /// the longer of the two.
    WriteIoChannel {
        channel: IoChannel,
        start: u16,
        bits: Vec<bool>,
        words: Vec<i16>,
    },
}

impl Request {
    pub fn code(&self) -> RequestCode {
        match self {
            Request::Mirror(_) => RequestCode::Mirror,
            Request::Identification => RequestCode::Identification,
            Request::Status => RequestCode::Status,
            Request::AvailableMemory => RequestCode::AvailableMemory,
            Request::SupervisorMessage(_) => RequestCode::SupervisorMessage,
            Request::ReadObject(object) => {
                RequestCode::read(object.kind).unwrap_or(RequestCode::ReadObjects)
            }
            Request::ReadObjects { .. } => RequestCode::ReadObjects,
            Request::WriteObject(object, _) => {
                RequestCode::write(object.kind).unwrap_or(RequestCode::WriteObjects)
            }
            Request::WriteObjects { .. } => RequestCode::WriteObjects,
            Request::ReadIoChannel { .. } => RequestCode::ReadIoChannel,
            Request::WriteIoChannel { .. } => RequestCode::WriteIoChannel,
        }
    }

    /// Validate the request and encode it to a UNI-TE code and the payload
    /// following it, the category first.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] or [`Error::PayloadTooLarge`], no I/O has
    /// happened at this point.
    pub fn encode(&self, category: Category) -> Result<(u8, Payload), Error> {
        let mut data = vec![*category];
        match self {
            Request::Mirror(bytes) => data.extend_from_slice(bytes),
            Request::Identification | Request::Status => {}
            Request::AvailableMemory => data.push(AVAILABLE_MEMORY),
            Request::SupervisorMessage(text) => {
                if !text.is_ascii() {
                    return Err(invalid_argument("supervisor message must be ASCII"));
                }
                data.extend_from_slice(text.as_bytes());
            }
            Request::ReadObject(object) => match object.kind {
                ObjectKind::Nc(_) => objects_header(&mut data, *object, 1),
                _ => data.extend_from_slice(&object.index.to_le_bytes()),
            },
            Request::ReadObjects { start, count } => {
                check_read_count(*start, *count)?;
                objects_header(&mut data, *start, *count);
            }
            Request::WriteObject(object, value) => {
                check_write(*object, *value)?;
                match object.kind {
                    ObjectKind::Nc(_) => objects_header(&mut data, *object, 1),
                    _ => data.extend_from_slice(&object.index.to_le_bytes()),
                }
                data.extend_from_slice(&value.to_bytes());
            }
            Request::WriteObjects { start, values } => {
                if start.kind.width() == Width::Bit {
                    return Err(invalid_argument(
                        "multi-object writes of bits are not supported",
                    ));
                }
                if values.is_empty() {
                    return Err(invalid_argument("nothing to write"));
                }
                for value in values {
                    check_write(*start, *value)?;
                }
                let count = u16::try_from(values.len())
                    .map_err(|_| invalid_argument("too many values"))?;
                objects_header(&mut data, *start, count);
                for value in values {
                    data.extend_from_slice(&value.to_bytes());
                }
            }
            Request::ReadIoChannel {
                channel,
                start,
                count,
            } => {
                if *count == 0 {
                    return Err(invalid_argument("nothing to read"));
                }
                channel_header(&mut data, channel)?;
                data.push(*count);
                data.push(*start);
            }
            Request::WriteIoChannel {
                channel,
                start,
                bits,
                words,
            } => {
                let bit_count =
                    u8::try_from(bits.len()).map_err(|_| invalid_argument("too many bits"))?;
                let word_count =
                    u16::try_from(words.len()).map_err(|_| invalid_argument("too many words"))?;
                if bits.is_empty() && words.is_empty() {
                    return Err(invalid_argument("nothing to write"));
                }
                channel_header(&mut data, channel)?;
                data.push(0);
                data.extend_from_slice(&u16::from(bit_count).max(word_count).to_le_bytes());
                data.extend_from_slice(&start.to_le_bytes());
                data.push(bit_count);
                data.extend(bits.iter().map(|&bit| u8::from(bit)));
                data.extend_from_slice(&word_count.to_le_bytes());
                for word in words {
                    data.extend_from_slice(&word.to_le_bytes());
                }
            }
        }
        let payload = Payload::try_from(data.as_slice()).map_err(|_| Error::PayloadTooLarge {
            len: data.len(),
            max: MAX_PAYLOAD_LEN,
        })?;
        Ok((self.code().code(), payload))
    }
}

/// Segment, object type, start index and count of the multi-object requests.
fn objects_header(data: &mut Vec<u8>, start: ObjectRef, count: u16) {
    data.push(start.kind.segment());
    data.push(start.kind.object_type());
    data.extend_from_slice(&start.index.to_le_bytes());
    data.extend_from_slice(&count.to_le_bytes());
}

/// Channel address, access and object type of the I/O channel requests.
fn channel_header(data: &mut Vec<u8>, channel: &IoChannel) -> Result<(), Error> {
    if channel.address.is_empty() {
        return Err(invalid_argument("I/O channel without an address"));
    }
    data.extend_from_slice(&channel.address);
    data.push(IO_CHANNEL_ACCESS);
    data.push(channel.object_type);
    Ok(())
}

/// Length of `count` objects of `kind` in a multi-object read response.
fn objects_len(kind: ObjectKind, count: usize) -> usize {
    match kind.width() {
        Width::Bit if kind.has_forcing() => count / 4,
        Width::Bit => count / 8,
        Width::Word => count * 2,
        Width::DWord => count * 4,
    }
}

fn check_read_count(start: ObjectRef, count: u16) -> Result<(), Error> {
    if count == 0 {
        return Err(invalid_argument("nothing to read"));
    }
    if start.kind.width() == Width::Bit && count % 8 != 0 {
        return Err(invalid_argument(format!(
            "bits are read by 8, {} isn't a multiple of 8",
            count
        )));
    }
    // type echo + values
    if 1 + objects_len(start.kind, usize::from(count)) > MAX_PAYLOAD_LEN {
        return Err(invalid_argument(format!(
            "{} objects from {} don't fit in one response",
            count, start
        )));
    }
    Ok(())
}

fn check_write(object: ObjectRef, value: ObjectValue) -> Result<(), Error> {
    if object.kind.is_read_only() {
        return Err(invalid_argument(format!("{} is read-only", object)));
    }
    if object.kind.width() != value.width() {
        return Err(invalid_argument(format!(
            "{:?} doesn't fit in {}",
            value, object
        )));
    }
    Ok(())
}

/// Identification of the station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub product_type: u8,
    pub sub_type: u8,
    pub version: u8,
    pub label: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Status {
    /// Run state of the controller.
    pub state: u8,
    /// Fault flags, zero when there are none.
    pub faults: u8,
    pub mode: Mode,
}

/// An I/O channel of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoChannel {
    /// X-WAY address bytes of the channel.
    pub address: Vec<u8>,
    /// Object type of the channel's I/O.
    pub object_type: u8,
}

impl IoChannel {
    pub fn new(address: impl Into<Vec<u8>>, object_type: u8) -> Self {
        Self {
            address: address.into(),
            object_type,
        }
    }
}

/// Inputs and outputs of an I/O channel, in object order from the start of
/// the read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoImage {
    /// `%I` bits.
    pub inputs: Vec<bool>,
    /// `%Q` bits.
    pub outputs: Vec<bool>,
    /// `%IW` words.
    pub input_words: Vec<i16>,
    /// `%QW` words.
    pub output_words: Vec<i16>,
}

/// A decoded, successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// True if the station echoed the data unchanged.
    Mirror(bool),
    Identification(Identification),
    Status(Status),
    AvailableMemory(u32),
    /// Write or supervisor message carried out.
    Acknowledged,
    Value(ObjectValue),
    Bit(BitState),
    Values(Vec<ObjectValue>),
    Bits(Vec<BitState>),
    IoChannel(IoImage),
}

impl Response {
    /// Decode the response to `request` carried by `frame`.
    ///
    /// # Errors
    /// [`Error::RejectedByStation`] if the station refused the request,
    /// [`Error::UnexpectedResponseShape`] if the frame isn't a response to it.
    pub fn decode(request: &Request, frame: &Frame) -> Result<Self, Error> {
        ensure!(
            !frame.header().is_refused(),
            RejectedByStationSnafu {
                rejection: Rejection::Refused
            }
        );
        let expected = request.code().response_code();
        match frame.code() {
            REQUEST_FAILED => {
                return RejectedByStationSnafu {
                    rejection: Rejection::RequestFailed,
                }
                .fail()
            }
            code if code != expected => {
                return Err(unexpected(format!(
                    "response code {:#04x}, expected {:#04x}",
                    code, expected
                )))
            }
            _ => {}
        }

        let data = frame.payload();
        match request {
            Request::Mirror(sent) => Ok(Response::Mirror(data == sent.as_slice())),
            Request::Identification => parse_identification(data).map(Response::Identification),
            Request::Status => match *data {
                [state, faults, mode] => Ok(Response::Status(Status {
                    state,
                    faults,
                    mode: Mode::try_from(mode).map_err(|e| unexpected(e.to_string()))?,
                })),
                _ => Err(length_mismatch("status", 3, data.len())),
            },
            Request::AvailableMemory => match *data {
                [AVAILABLE_MEMORY, a, b, c, d] => {
                    Ok(Response::AvailableMemory(u32::from_le_bytes([a, b, c, d])))
                }
                _ => Err(unexpected(format!(
                    "available memory response {}",
                    crate::hex(data)
                ))),
            },
            Request::SupervisorMessage(_)
            | Request::WriteObject(..)
            | Request::WriteObjects { .. } => Ok(Response::Acknowledged),
            Request::ReadObject(object) => parse_read_object(*object, data),
            Request::ReadObjects { start, count } => {
                parse_read_objects(*start, usize::from(*count), data)
            }
            Request::ReadIoChannel { .. } => parse_io_image(data).map(Response::IoChannel),
            Request::WriteIoChannel { .. } => match *data {
                [0] => Ok(Response::Acknowledged),
                [report] => Err(channel_rejection(report)),
                _ => Err(length_mismatch("I/O channel write", 1, data.len())),
            },
        }
    }
}

fn length_mismatch(what: &str, expected: usize, received: usize) -> Error {
    unexpected(format!(
        "{} payload of {} bytes, expected {}",
        what, received, expected
    ))
}

fn parse_identification(data: &[u8]) -> Result<Identification, Error> {
    let parsed: IResult<&[u8], _> =
        all_consuming(tuple((byte, byte, byte, length_data(byte))))(data);
    let (_, (product_type, sub_type, version, label)) =
        parsed.map_err(|_| unexpected(format!("identification {}", crate::hex(data))))?;
    if !label.is_ascii() {
        return Err(unexpected("identification label isn't ASCII"));
    }
    Ok(Identification {
        product_type,
        sub_type,
        version,
        label: label.iter().map(|&c| char::from(c)).collect(),
    })
}

fn channel_rejection(report: u8) -> Error {
    Error::RejectedByStation {
        rejection: Rejection::ChannelReport(report),
    }
}

/// General report, channel fault, three module status bytes and the
/// operation report, then the `%I` and `%Q` bits with a byte count each and
/// the `%IW` and `%QW` words with a u16 count each. Only bit 0 of a bit byte
/// is the value.
fn parse_io_image(data: &[u8]) -> Result<IoImage, Error> {
    let malformed = || unexpected(format!("I/O channel read {}", crate::hex(data)));
    let reports: IResult<&[u8], _> = tuple((byte, byte, take(3usize), byte))(data);
    let (rest, (report, fault, _, operation)) = reports.map_err(|_| malformed())?;
    if let Some(&code) = [report, fault, operation].iter().find(|&&code| code != 0) {
        return Err(channel_rejection(code));
    }
    let sections: IResult<&[u8], _> = all_consuming(tuple((
        length_data(byte),
        length_data(byte),
        length_count(le_u16, le_i16),
        length_count(le_u16, le_i16),
    )))(rest);
    let (_, (inputs, outputs, input_words, output_words)) = sections.map_err(|_| malformed())?;
    let bits = |bytes: &[u8]| -> Vec<bool> { bytes.iter().map(|&b| b & 1 != 0).collect() };
    Ok(IoImage {
        inputs: bits(inputs),
        outputs: bits(outputs),
        input_words,
        output_words,
    })
}

fn bit(byte: u8, offset: usize) -> bool {
    byte & (1 << (offset % 8)) != 0
}

fn parse_read_object(object: ObjectRef, data: &[u8]) -> Result<Response, Error> {
    let index = usize::from(object.index);
    match object.kind {
        ObjectKind::InternalBit => match *data {
            [values, forcing] => Ok(Response::Bit(BitState {
                value: bit(values, index),
                forced: Some(bit(forcing, index)),
            })),
            _ => Err(length_mismatch("bit read", 2, data.len())),
        },
        ObjectKind::SystemBit => match *data {
            [values] => Ok(Response::Bit(BitState {
                value: bit(values, index),
                forced: None,
            })),
            _ => Err(length_mismatch("bit read", 1, data.len())),
        },
        // multi-object response, the object type echo isn't meaningful
        ObjectKind::Nc(_) => match *data {
            [_, lo, hi] => Ok(Response::Value(ObjectValue::Word(i16::from_le_bytes([
                lo, hi,
            ])))),
            _ => Err(length_mismatch("NC object read", 3, data.len())),
        },
        kind => {
            let width = kind.width();
            ObjectValue::from_bytes(width, data)
                .map(Response::Value)
                .ok_or_else(|| length_mismatch("object read", objects_len(kind, 1), data.len()))
        }
    }
}

fn parse_read_objects(start: ObjectRef, count: usize, data: &[u8]) -> Result<Response, Error> {
    let kind = start.kind;
    let (object_type, values) = match data.split_first() {
        Some((object_type, values)) => (*object_type, values),
        None => return Err(length_mismatch("multi-object read", 1, 0)),
    };
    if !matches!(kind, ObjectKind::Nc(_)) && object_type != kind.object_type() {
        return Err(unexpected(format!(
            "object type {:#04x}, expected {:#04x}",
            object_type,
            kind.object_type()
        )));
    }
    let expected = objects_len(kind, count);
    if values.len() != expected {
        return Err(length_mismatch(
            "multi-object read",
            expected + 1,
            data.len(),
        ));
    }

    match kind.width() {
        Width::Bit => {
            let (values, forcing) = values.split_at(count / 8);
            Ok(Response::Bits(
                (0..count)
                    .map(|i| BitState {
                        value: bit(values[i / 8], i),
                        forced: forcing.get(i / 8).map(|&f| bit(f, i)),
                    })
                    .collect(),
            ))
        }
        width => {
            let size = if width == Width::Word { 2 } else { 4 };
            values
                .chunks_exact(size)
                .map(|chunk| ObjectValue::from_bytes(width, chunk))
                .collect::<Option<Vec<_>>>()
                .map(Response::Values)
                .ok_or_else(|| unexpected("malformed object values"))
        }
    }
}
