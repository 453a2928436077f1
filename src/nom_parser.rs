use nom::branch::alt;
use nom::combinator::{consumed, map, value};
use nom::multi::count;
use nom::sequence::{pair, preceded};
use nom::Err::{Error, Failure, Incomplete};
use nom::IResult;

use crate::ascii::*;

type Buf = [u8];

/// A frame as it was cut from the byte stream, before BCC verification.
#[derive(PartialEq, Debug, Clone)]
pub(crate) struct RawFrame<'a> {
    pub address: u8,
    /// Data section with `<DLE>` doubling removed.
    pub data: Vec<u8>,
    /// The wire bytes covered by the BCC.
    pub covered: &'a Buf,
    pub bcc: u8,
}

#[derive(PartialEq, Debug, Clone)]
pub(crate) enum Token<'a> {
    Frame(RawFrame<'a>),
    /// `<DLE> <ENQ> <addr>`, the bus master polling a slave.
    Poll(u8),
    Nak,
    /// Bytes that can't start a token.
    Noise,
    /// A token start that turned out not to be one.
    Invalid,
    NeedData,
}

/// Parse the next token of the byte stream. Returns the number of bytes to
/// consume along with the token, `(0, NeedData)` if the buffer ends in the
/// middle of a token.
pub(crate) fn parse_token(buf: &Buf) -> (usize, Token<'_>) {
    match buf.first() {
        None => (0, Token::NeedData),
        Some(&DLE) if buf.get(1) == Some(&STX) => finish(buf, frame(buf)),
        Some(&c) if c == DLE || c == NAK => finish(buf, alt((poll, nak))(buf)),
        Some(_) => finish(buf, noise(buf)),
    }
}

/// Like [`parse_token`], but only a frame is accepted.
pub(crate) fn parse_frame(buf: &Buf) -> (usize, Token<'_>) {
    if buf.is_empty() {
        return (0, Token::NeedData);
    }
    finish(buf, frame(buf))
}

/// An invalid token consumes everything up to where parsing failed, at
/// least one byte.
fn finish<'a>(buf: &'a Buf, result: IResult<&'a Buf, Token<'a>>) -> (usize, Token<'a>) {
    match result {
        Ok((remaining, token)) => (buf.len() - remaining.len(), token),
        Err(Incomplete(_)) => (0, Token::NeedData),
        Err(Error(err)) | Err(Failure(err)) => {
            ((buf.len() - err.input.len()).max(1), Token::Invalid)
        }
    }
}

fn noise(buf: &Buf) -> IResult<&Buf, Token> {
    map(
        nom::bytes::complete::take_till(|c| c == DLE || c == NAK),
        |_| Token::Noise,
    )(buf)
}

fn frame(buf: &Buf) -> IResult<&Buf, Token> {
    let (buf, (covered, (address, data))) = consumed(preceded(
        pair(ascii_char(DLE), ascii_char(STX)),
        pair(byte, stuffed_data),
    ))(buf)?;
    let (buf, bcc) = byte(buf)?;
    Ok((
        buf,
        Token::Frame(RawFrame {
            address,
            data,
            covered,
            bcc,
        }),
    ))
}

fn poll(buf: &Buf) -> IResult<&Buf, Token> {
    map(
        preceded(pair(ascii_char(DLE), ascii_char(ENQ)), byte),
        Token::Poll,
    )(buf)
}

fn nak(buf: &Buf) -> IResult<&Buf, Token> {
    value(Token::Nak, ascii_char(NAK))(buf)
}

/// Length byte followed by that many data bytes, all `<DLE>` doubled.
fn stuffed_data(buf: &Buf) -> IResult<&Buf, Vec<u8>> {
    let (buf, len) = stuffed_byte(buf)?;
    count(stuffed_byte, usize::from(len))(buf)
}

fn stuffed_byte(buf: &Buf) -> IResult<&Buf, u8> {
    let (rest, c) = byte(buf)?;
    if c == DLE {
        value(DLE, ascii_char(DLE))(rest)
    } else {
        Ok((rest, c))
    }
}

fn byte(buf: &Buf) -> IResult<&Buf, u8> {
    nom::number::streaming::u8(buf)
}

fn ascii_char<'a>(ascii_char: u8) -> impl Fn(&'a Buf) -> IResult<&'a Buf, char> {
    nom::character::streaming::char(ascii_char as char)
}
