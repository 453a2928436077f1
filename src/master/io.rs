//! Blocking UNI-TELWAY master over any byte stream.
//!
//! The link is shared: any number of threads may use one [`Master`], their
//! requests are carried out one at a time, in the order they were issued.

use std::convert::TryFrom;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::FairMutex;
use snafu::ResultExt;

use super::{Step, Transaction};
use crate::config::{Config, TurnPolicy};
use crate::error::{unexpected, Error, TransportSnafu};
use crate::frame::{FrameBuffer, Token};
use crate::message::{Identification, IoChannel, IoImage, Request, Response, Status};
use crate::types::{Address, BitState, Mode, NcObject, ObjectRef, ObjectValue, Width};

/// Byte stream to the station, usually a TCP connection to a serial adapter.
pub trait Transport {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receive whatever is available within `timeout`.
    ///
    /// `Ok(0)` means the connection was closed. An error of kind
    /// [`ErrorKind::TimedOut`] or [`ErrorKind::WouldBlock`] means nothing
    /// arrived in time.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)?;
        self.flush()
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        // a zero timeout means blocking forever
        self.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        self.read(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Open a TCP session to the adapter at `host:port`, then send the
/// connection query of `config` if it has one.
///
/// # Errors
/// [`Error::Transport`] if no address of `host` accepts the connection
/// within the configured timeout, or [`Error::InvalidArgument`] for an
/// invalid `config`.
pub fn connect(host: &str, port: u16, config: Config) -> Result<Master<TcpStream>, Error> {
    config.validate()?;
    let mut last_error = None;
    for address in (host, port).to_socket_addrs().context(TransportSnafu)? {
        match TcpStream::connect_timeout(&address, config.timeout) {
            Ok(stream) => {
                debug!("connected to {}", address);
                stream.set_nodelay(true).context(TransportSnafu)?;
                return Master::new(stream, config);
            }
            Err(err) => {
                warn!("connecting to {} failed: {}", address, err);
                last_error = Some(err);
            }
        }
    }
    Err(Error::Transport {
        source: last_error
            .unwrap_or_else(|| io::Error::new(ErrorKind::NotFound, "host has no address")),
    })
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

fn io_error(source: io::Error) -> Error {
    if is_disconnect(&source) {
        Error::LinkLost { source }
    } else {
        Error::Transport { source }
    }
}

/// The transport and the receive state that outlives single transactions.
#[derive(Debug)]
struct Link<T> {
    transport: T,
    buffer: FrameBuffer,
    /// Set while a transaction is in flight, and left set if it ends without
    /// a decoded reply. The next transaction drains the link first.
    needs_resync: bool,
    last_send: Option<Instant>,
}

impl<T: Transport> Link<T> {
    fn run(&mut self, mut transaction: Transaction, config: &Config) -> Result<Response, Error> {
        if self.needs_resync {
            self.drain(config, self.late_reply_deadline(config))?;
        }
        self.needs_resync = true;
        self.buffer.clear();

        let result = self.run_attempts(&mut transaction, config);
        if transaction.response_received() {
            self.needs_resync = false;
        }
        result
    }

    fn run_attempts(
        &mut self,
        transaction: &mut Transaction,
        config: &Config,
    ) -> Result<Response, Error> {
        loop {
            match self.attempt(transaction, config)? {
                Step::Done(result) => return result,
                Step::Retry => {
                    warn!(
                        "{:?}: attempt {} of {} failed",
                        transaction.request().code(),
                        transaction.attempts(),
                        config.max_attempts
                    );
                    self.drain(config, Instant::now())?;
                }
            }
        }
    }

    fn attempt(&mut self, transaction: &mut Transaction, config: &Config) -> Result<Step, Error> {
        if config.turn == TurnPolicy::AwaitPoll
            && !self.await_poll(config.address, config.timeout)?
        {
            debug!("not polled within {:?}", config.timeout);
            return Ok(transaction.turn_missed());
        }

        debug!("sending {}", crate::hex(transaction.request_bytes()));
        self.transport
            .send(transaction.request_bytes())
            .map_err(io_error)?;
        self.last_send = Some(Instant::now());
        transaction.data_sent();

        let deadline = Instant::now() + config.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(transaction.timed_out(&self.buffer));
            }
            if self.receive(deadline - now)? > 0 {
                if let Some(step) = transaction.receive_data(&mut self.buffer) {
                    return Ok(step);
                }
            }
        }
    }

    /// Wait for the bus master to poll `address`. Returns false on timeout.
    fn await_poll(&mut self, address: Address, timeout: Duration) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            loop {
                match self.buffer.next_token() {
                    Ok(Some(Token::Poll(polled))) if address == polled => return Ok(true),
                    Ok(Some(token)) => trace!("waiting for poll, skipping {:?}", token),
                    Ok(None) => break,
                    Err(err) => trace!("waiting for poll: {}", err),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.receive(deadline - now)?;
        }
    }

    /// Read into the buffer. Returns the number of bytes received, 0 on
    /// timeout.
    fn receive(&mut self, timeout: Duration) -> Result<usize, Error> {
        let mut chunk = [0; 256];
        match self.transport.receive(&mut chunk, timeout) {
            Ok(0) => Err(Error::LinkLost {
                source: io::Error::new(ErrorKind::UnexpectedEof, "connection closed"),
            }),
            Ok(len) => {
                trace!("received {}", crate::hex(&chunk[..len]));
                self.buffer.push(&chunk[..len]);
                Ok(len)
            }
            Err(err) if is_timeout(&err) => Ok(0),
            Err(err) => Err(io_error(err)),
        }
    }

    /// Until when a reply to the last request may still arrive: one more
    /// `timeout` after its response deadline.
    fn late_reply_deadline(&self, config: &Config) -> Instant {
        self.last_send
            .and_then(|sent| sent.checked_add(config.timeout.saturating_mul(2)))
            .unwrap_or_else(Instant::now)
    }

    /// Drop buffered bytes and read until `quiet_after` has passed and the
    /// link has been quiet for `drain_timeout`. Gives up one `timeout` after
    /// `quiet_after` on a link that never goes quiet.
    fn drain(&mut self, config: &Config, quiet_after: Instant) -> Result<(), Error> {
        let give_up = quiet_after
            .max(Instant::now())
            .checked_add(config.timeout)
            .unwrap_or(quiet_after);
        let mut dropped = self.buffer.len();
        self.buffer.clear();
        loop {
            let now = Instant::now();
            let wait = if now < quiet_after {
                (quiet_after - now).max(config.drain_timeout)
            } else {
                config.drain_timeout
            };
            let len = self.receive(wait)?;
            dropped += len;
            self.buffer.clear();
            let now = Instant::now();
            if (len == 0 && now >= quiet_after) || now >= give_up {
                break;
            }
        }
        if dropped > 0 {
            warn!("resynchronising, dropped {} bytes", dropped);
        }
        Ok(())
    }
}

/// Blocking master for one station.
///
/// ## Example
/// ```no_run
/// use unitelway_proto::{connect, Config, Mode};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let num = connect("10.1.70.9", 8234, Config::new(1)?)?;
/// if num.mode()? != Mode::Manual {
///     num.set_mode(Mode::Manual)?;
/// }
/// # Ok(()) }
/// ```
#[derive(Debug)]
pub struct Master<T> {
    link: FairMutex<Link<T>>,
    config: Config,
}

impl<T: Transport> Master<T> {
    /// Take over `transport`, sending the connection query first if `config`
    /// has one. Whatever the adapter answers to it is drained before the
    /// first request.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] if `config` doesn't validate,
    /// [`Error::Transport`] or [`Error::LinkLost`] if the connection query
    /// can't be sent.
    pub fn new(transport: T, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let mut link = Link {
            transport,
            buffer: FrameBuffer::new(),
            needs_resync: false,
            last_send: None,
        };
        if let Some(query) = &config.connection_query {
            debug!("sending connection query {}", crate::hex(query));
            link.transport.send(query).map_err(io_error)?;
            link.needs_resync = true;
        }
        Ok(Self {
            link: FairMutex::new(link),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Carry out `request`, waiting for the link if another request is in
    /// progress. The request is validated before waiting.
    pub fn execute(&self, request: Request) -> Result<Response, Error> {
        let transaction = Transaction::new(request, &self.config)?;
        let mut link = self.link.lock();
        link.run(transaction, &self.config)
    }

    /// Send `data` and check that the station echoes it unchanged.
    pub fn mirror(&self, data: &[u8]) -> Result<bool, Error> {
        match self.execute(Request::Mirror(data.to_vec()))? {
            Response::Mirror(matched) => Ok(matched),
            other => Err(wrong_response(other)),
        }
    }

    pub fn identification(&self) -> Result<Identification, Error> {
        match self.execute(Request::Identification)? {
            Response::Identification(identification) => Ok(identification),
            other => Err(wrong_response(other)),
        }
    }

    pub fn status(&self) -> Result<Status, Error> {
        match self.execute(Request::Status)? {
            Response::Status(status) => Ok(status),
            other => Err(wrong_response(other)),
        }
    }

    /// Free memory of the station, in bytes.
    pub fn available_memory(&self) -> Result<u32, Error> {
        match self.execute(Request::AvailableMemory)? {
            Response::AvailableMemory(free) => Ok(free),
            other => Err(wrong_response(other)),
        }
    }

    pub fn send_supervisor_message(&self, text: &str) -> Result<(), Error> {
        self.acknowledged(Request::SupervisorMessage(text.into()))
    }

    /// Read one object. Bits are returned without their forcing state, see
    /// [`read_bit`](Self::read_bit).
    pub fn read_object(&self, object: ObjectRef) -> Result<ObjectValue, Error> {
        match self.execute(Request::ReadObject(object))? {
            Response::Value(value) => Ok(value),
            Response::Bit(state) => Ok(ObjectValue::Bit(state.value)),
            other => Err(wrong_response(other)),
        }
    }

    pub fn read_bit(&self, object: ObjectRef) -> Result<BitState, Error> {
        ensure_bits(object)?;
        match self.execute(Request::ReadObject(object))? {
            Response::Bit(state) => Ok(state),
            other => Err(wrong_response(other)),
        }
    }

    /// ## Example
    /// ```no_run
    /// # use unitelway_proto::{connect, Config, ObjectKind, ObjectRef};
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let num = connect("10.1.70.9", 8234, Config::new(1)?)?;
    /// num.write_object(ObjectRef::new(ObjectKind::InternalBit, 3), true)?;
    /// num.write_object(ObjectRef::new(ObjectKind::InternalDword, 0), -70000i32)?;
    /// # Ok(()) }
    /// ```
    pub fn write_object(
        &self,
        object: ObjectRef,
        value: impl Into<ObjectValue>,
    ) -> Result<(), Error> {
        self.acknowledged(Request::WriteObject(object, value.into()))
    }

    /// Read `count` consecutive objects from `start`.
    pub fn read_objects(&self, start: ObjectRef, count: u16) -> Result<Vec<ObjectValue>, Error> {
        match self.execute(Request::ReadObjects { start, count })? {
            Response::Values(values) => Ok(values),
            Response::Bits(states) => Ok(states
                .into_iter()
                .map(|state| ObjectValue::Bit(state.value))
                .collect()),
            other => Err(wrong_response(other)),
        }
    }

    /// Read `count` consecutive bits from `start`, `count` a multiple of 8.
    pub fn read_bits(&self, start: ObjectRef, count: u16) -> Result<Vec<BitState>, Error> {
        ensure_bits(start)?;
        match self.execute(Request::ReadObjects { start, count })? {
            Response::Bits(states) => Ok(states),
            other => Err(wrong_response(other)),
        }
    }

    /// Write consecutive words or double words from `start`.
    pub fn write_objects(&self, start: ObjectRef, values: &[ObjectValue]) -> Result<(), Error> {
        self.acknowledged(Request::WriteObjects {
            start,
            values: values.to_vec(),
        })
    }

    /// Read `count` of each of the `%I`, `%Q`, `%IW` and `%QW` objects of
    /// `channel`, from `start`.
    pub fn read_io_channel(
        &self,
        channel: &IoChannel,
        start: u8,
        count: u8,
    ) -> Result<IoImage, Error> {
        let request = Request::ReadIoChannel {
            channel: channel.clone(),
            start,
            count,
        };
        match self.execute(request)? {
            Response::IoChannel(image) => Ok(image),
            other => Err(wrong_response(other)),
        }
    }

    /// Write `bits` and `words` of `channel` from `start`.
    ///
    /// # Errors
    /// [`Error::RejectedByStation`] with [`Rejection::ChannelReport`] if the
    /// module reports a failure.
    ///
    /// [`Rejection::ChannelReport`]: crate::Rejection::ChannelReport
    pub fn write_io_channel(
        &self,
        channel: &IoChannel,
        start: u16,
        bits: &[bool],
        words: &[i16],
    ) -> Result<(), Error> {
        self.acknowledged(Request::WriteIoChannel {
            channel: channel.clone(),
            start,
            bits: bits.to_vec(),
            words: words.to_vec(),
        })
    }

    /// Current mode of the numerical control.
    pub fn mode(&self) -> Result<Mode, Error> {
        let word = self.read_nc_word(NcObject::ModeSelection)?;
        Mode::try_from(word as u16).map_err(|err| unexpected(err.to_string()))
    }

    pub fn set_mode(&self, mode: Mode) -> Result<(), Error> {
        self.write_object(ObjectRef::nc(NcObject::ModeSelection), mode as i16)
    }

    /// Number of the part programme being executed.
    pub fn programme_number(&self) -> Result<i16, Error> {
        self.read_nc_word(NcObject::CurrentProgrammeNumber)
    }

    /// Close the transport.
    pub fn close(self) -> Result<(), Error> {
        self.link
            .into_inner()
            .transport
            .close()
            .context(TransportSnafu)
    }

    /// Get the transport back, any buffered bytes are dropped.
    pub fn into_inner(self) -> T {
        self.link.into_inner().transport
    }

    fn read_nc_word(&self, object: NcObject) -> Result<i16, Error> {
        match self.read_object(ObjectRef::nc(object))? {
            ObjectValue::Word(word) => Ok(word),
            other => Err(unexpected(format!("{:?} for a word object", other))),
        }
    }

    fn acknowledged(&self, request: Request) -> Result<(), Error> {
        match self.execute(request)? {
            Response::Acknowledged => Ok(()),
            other => Err(wrong_response(other)),
        }
    }
}

fn ensure_bits(object: ObjectRef) -> Result<(), Error> {
    if object.kind.width() == Width::Bit {
        Ok(())
    } else {
        Err(crate::error::invalid_argument(format!(
            "{} isn't a bit object",
            object
        )))
    }
}

fn wrong_response(response: Response) -> Error {
    unexpected(format!("{:?}", response))
}
