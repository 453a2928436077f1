//! UNI-TELWAY / UNI-TE client protocol engine.
//!
//! This crate talks to NUM numerical-control units (NUM 1060) over a
//! UNI-TELWAY serial link, usually tunnelled through a TCP to RS485 adapter.
//!
//! The protocol core is sans-io: [`frame`] turns UNI-TE messages into wire
//! frames and back, [`message`] maps the closed set of supported operations to
//! request and response payloads, and [`master::Transaction`] is the state
//! machine of a single request/response exchange. [`master::io::Master`]
//! drives transactions over any [`master::io::Transport`], one at a time.
//!
//! # Example
//!
//! ```no_run
//! use unitelway_proto::{connect, Config, ObjectKind, ObjectRef};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new(1)?;
//! let num = connect("10.1.70.9", 8234, config)?;
//!
//! println!("{:?}", num.status()?);
//! let word = ObjectRef::new(ObjectKind::InternalWord, 12);
//! num.write_object(word, 1234i16)?;
//! println!("{:?}", num.read_object(word)?);
//! # Ok(()) }
//! ```

mod buffer;
pub mod checksum;
pub mod config;
pub mod error;
pub mod frame;
pub mod master;
pub mod message;
mod nom_parser;
pub mod types;

pub use config::{Config, TurnPolicy};
pub use error::{Error, Rejection};
pub use frame::{DecodeError, Frame, FrameBuffer, Token};
pub use master::io::{connect, Master, Transport};
pub use message::{Identification, IoChannel, IoImage, Request, RequestCode, Response, Status};
pub use types::{
    addr, Address, BitState, Category, IntoAddress, Mode, NcObject, ObjectKind, ObjectRef,
    ObjectValue, Width, XwayHeader,
};

pub(crate) mod ascii {
    pub const STX: u8 = 0x02;
    pub const ENQ: u8 = 0x05;
    pub const DLE: u8 = 0x10;
    pub const NAK: u8 = 0x15;
}

/// Format bytes as space separated hex, the way frames are logged.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        // writing to a String can't fail
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
