#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use unitelway_proto::frame::FrameBuffer;
use unitelway_proto::types::XWAY_REFUSED;
use unitelway_proto::{Address, Frame, Transport, XwayHeader};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Multi-object (segment, object type) of a memory area.
pub type Space = (u8, u8);

pub const INTERNAL_BITS: Space = (0x64, 0x05);
pub const SYSTEM_BITS: Space = (0x64, 0x06);
pub const INTERNAL_WORDS: Space = (0x68, 0x07);
pub const CONSTANT_WORDS: Space = (0x69, 0x07);
pub const SYSTEM_WORDS: Space = (0x6A, 0x07);
pub const INTERNAL_DWORDS: Space = (0x68, 0x08);
pub const CONSTANT_DWORDS: Space = (0x69, 0x08);
pub const MODE_SELECTION: Space = (0xB4, 0x00);
pub const PROGRAMME_NUMBER: Space = (0xB5, 0x00);
/// Bits and words of the I/O channel, wired back so inputs read what the
/// outputs were set to.
pub const IO_BITS: Space = (0xF0, 0x01);
pub const IO_WORDS: Space = (0xF0, 0x02);

pub const IDENTIFICATION: [u8; 8] = [0x0A, 0x02, 0x31, 4, b'N', b'U', b'M', b' '];

/// How the station mangles its next reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// No reply at all.
    Silent,
    /// Wrong BCC.
    Corrupt,
    /// Last byte missing.
    Truncate,
    /// UNI-TE 0xFD.
    Reject,
    /// X-WAY type 0x22.
    Refuse,
    Nak,
    /// A response code that doesn't belong to the request.
    WrongCode,
    /// Close the connection instead of replying.
    Close,
    /// Reply after the given delay instead of the default one.
    Delay(Duration),
    /// Send these bytes in front of the reply.
    Prefix(Vec<u8>),
}

fn single_space(code: u8) -> Option<Space> {
    Some(match code {
        0x00 | 0x10 => INTERNAL_BITS,
        0x01 | 0x11 => SYSTEM_BITS,
        0x04 | 0x14 => INTERNAL_WORDS,
        0x05 => CONSTANT_WORDS,
        0x06 | 0x15 => SYSTEM_WORDS,
        0x40 | 0x46 => INTERNAL_DWORDS,
        0x41 => CONSTANT_DWORDS,
        _ => return None,
    })
}

fn le_u16(bytes: &[u8]) -> Option<u16> {
    Some(u16::from_le_bytes([*bytes.get(0)?, *bytes.get(1)?]))
}

/// Segment, object type, first index and count of a multi-object request.
fn objects_header(args: &[u8]) -> Option<(Space, u16, u16)> {
    let space = (*args.get(0)?, *args.get(1)?);
    Some((space, le_u16(args.get(2..)?)?, le_u16(args.get(4..)?)?))
}

/// Start, bit bytes and word bytes of an I/O channel write: 2 address bytes,
/// access, object type, 0, count, start, bit count, bits, word count, words.
fn io_write(args: &[u8]) -> Option<(u16, Vec<u8>, Vec<u8>)> {
    let start = le_u16(args.get(7..)?)?;
    let bit_count = usize::from(*args.get(9)?);
    let bits = args.get(10..10 + bit_count)?;
    let rest = args.get(10 + bit_count..)?;
    let word_count = usize::from(le_u16(rest)?);
    let words = rest.get(2..2 + 2 * word_count)?;
    Some((start, bits.to_vec(), words.to_vec()))
}

struct StationState {
    address: Address,
    requests: FrameBuffer,
    rx: VecDeque<u8>,
    ready_at: Instant,
    reply_pending: bool,
    memory: HashMap<(Space, u16), i32>,
    forced: HashMap<u16, bool>,
    faults: VecDeque<Fault>,
    chunk_size: usize,
    reply_delay: Duration,
    poll: Option<u8>,
    poll_in_rx: Option<u8>,
    turn: bool,
    closed: bool,
    panic_on_receive: bool,
    sent: Vec<Vec<u8>>,
    codes: Vec<u8>,
    messages: Vec<String>,
    violations: usize,
    out_of_turn: usize,
}

impl StationState {
    fn get(&self, space: Space, index: u16) -> i32 {
        self.memory.get(&(space, index)).copied().unwrap_or(0)
    }

    fn set(&mut self, space: Space, index: u16, value: i32) {
        self.memory.insert((space, index), value);
    }

    fn bits_byte(&self, space: Space, start: u16) -> u8 {
        (0..8).fold(0, |byte, i| {
            byte | (((self.get(space, start + i) & 1) as u8) << i)
        })
    }

    fn forcing_byte(&self, start: u16) -> u8 {
        (0..8).fold(0, |byte, i| {
            let forced = self.forced.get(&(start + i)).is_some();
            byte | ((forced as u8) << i)
        })
    }

    fn read_values(&self, space: Space, start: u16, count: u16) -> Vec<u8> {
        let mut out = Vec::new();
        match space.1 {
            0x05 | 0x06 => {
                for chunk in 0..count / 8 {
                    out.push(self.bits_byte(space, start + chunk * 8));
                }
                if space.1 == 0x05 {
                    for chunk in 0..count / 8 {
                        out.push(self.forcing_byte(start + chunk * 8));
                    }
                }
            }
            0x08 => {
                for i in 0..count {
                    out.extend_from_slice(&self.get(space, start + i).to_le_bytes());
                }
            }
            _ => {
                for i in 0..count {
                    out.extend_from_slice(&(self.get(space, start + i) as i16).to_le_bytes());
                }
            }
        }
        out
    }

    /// Carry out a request, returns the response code and payload.
    fn handle(&mut self, code: u8, payload: &[u8]) -> (u8, Vec<u8>) {
        let args = payload.get(1..).unwrap_or(&[]);
        match code {
            0xFA => (0xFB, args.to_vec()),
            0x0F => (0x3F, IDENTIFICATION.to_vec()),
            0x31 => (0x61, vec![1, 0, self.get(MODE_SELECTION, 0) as u8]),
            0xF5 if args == [0x77] => {
                let mut out = vec![0x77];
                out.extend_from_slice(&65536u32.to_le_bytes());
                (0xF5, out)
            }
            0xF5 => {
                self.messages.push(String::from_utf8_lossy(args).into_owned());
                (0xFE, vec![])
            }
            0x00 | 0x01 | 0x04 | 0x05 | 0x06 | 0x40 | 0x41 => {
                let (space, index) = match (single_space(code), le_u16(args)) {
                    (Some(space), Some(index)) => (space, index),
                    _ => return (0xFD, vec![]),
                };
                let out = match code {
                    0x00 => vec![
                        self.bits_byte(space, index & !7),
                        self.forcing_byte(index & !7),
                    ],
                    0x01 => vec![self.bits_byte(space, index & !7)],
                    _ => self.read_values(space, index, 1),
                };
                (code + 0x30, out)
            }
            0x10 | 0x11 | 0x14 | 0x15 | 0x46 => {
                let (space, index) = match (single_space(code), le_u16(args)) {
                    (Some(space), Some(index)) => (space, index),
                    _ => return (0xFD, vec![]),
                };
                let value = &args[2..];
                let value = match (code, value.len()) {
                    (0x10, 1) | (0x11, 1) => i32::from(value[0] & 1),
                    (0x14, 2) | (0x15, 2) => i32::from(i16::from_le_bytes([value[0], value[1]])),
                    (0x46, 4) => i32::from_le_bytes([value[0], value[1], value[2], value[3]]),
                    _ => return (0xFD, vec![]),
                };
                self.set(space, index, value);
                (0xFE, vec![])
            }
            0x36 => {
                let (space, start, count) = match objects_header(args) {
                    Some(header) => header,
                    None => return (0xFD, vec![]),
                };
                // NC objects echo the word type
                let echo = if space.1 == 0x00 { 0x07 } else { space.1 };
                let mut out = vec![echo];
                out.extend(self.read_values(space, start, count));
                (0x66, out)
            }
            0x37 => {
                let (space, start, count) = match objects_header(args) {
                    Some(header) => header,
                    None => return (0xFD, vec![]),
                };
                let size = if space.1 == 0x08 { 4 } else { 2 };
                let values = &args[6..];
                if values.len() != size * usize::from(count) {
                    return (0xFD, vec![]);
                }
                for (i, chunk) in values.chunks(size).enumerate() {
                    let value = if size == 4 {
                        i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
                    } else {
                        i32::from(i16::from_le_bytes([chunk[0], chunk[1]]))
                    };
                    self.set(space, start + i as u16, value);
                }
                (0xFE, vec![])
            }
            0x43 => {
                // 2 address bytes, access, object type, count, start
                let (count, start) = match args.get(4..6) {
                    Some(&[count, start]) => (u16::from(count), u16::from(start)),
                    _ => return (0xFD, vec![]),
                };
                let mut out = vec![0; 6];
                for _ in 0..2 {
                    out.push(count as u8);
                    out.extend((start..start + count).map(|i| self.get(IO_BITS, i) as u8));
                }
                for _ in 0..2 {
                    out.extend_from_slice(&count.to_le_bytes());
                    for i in start..start + count {
                        out.extend_from_slice(&(self.get(IO_WORDS, i) as i16).to_le_bytes());
                    }
                }
                (0x73, out)
            }
            0x48 => match io_write(args) {
                Some((start, bits, words)) => {
                    for (i, bit) in (start..).zip(bits) {
                        self.set(IO_BITS, i, i32::from(bit & 1));
                    }
                    for (i, word) in (start..).zip(words.chunks_exact(2)) {
                        self.set(IO_WORDS, i, i32::from(i16::from_le_bytes([word[0], word[1]])));
                    }
                    (0x78, vec![0])
                }
                None => (0x78, vec![0x01]),
            },
            _ => (0xFD, vec![]),
        }
    }

    fn reply(&mut self, request: &Frame) {
        let fault = self.faults.pop_front();
        let (mut code, payload) = self.handle(request.code(), request.payload());
        let mut header = XwayHeader::default();
        let mut delay = self.reply_delay;
        let mut prefix = Vec::new();
        match &fault {
            Some(Fault::Silent) => return,
            Some(Fault::Close) => {
                self.closed = true;
                return;
            }
            Some(Fault::Nak) => {
                self.enqueue(&[0x15], delay);
                return;
            }
            Some(Fault::Reject) => code = 0xFD,
            Some(Fault::Refuse) => header.kind = XWAY_REFUSED,
            Some(Fault::WrongCode) => code = code.wrapping_add(1),
            Some(Fault::Delay(d)) => delay = *d,
            Some(Fault::Prefix(bytes)) => prefix = bytes.clone(),
            _ => {}
        }
        let frame = match Frame::new(self.address, header, code, &payload) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let mut bytes = frame.encode().to_vec();
        match fault {
            Some(Fault::Corrupt) => {
                let last = bytes.len() - 1;
                bytes[last] = bytes[last].wrapping_add(1);
            }
            Some(Fault::Truncate) => {
                bytes.pop();
            }
            _ => {}
        }
        prefix.extend(bytes);
        self.enqueue(&prefix, delay);
    }

    fn enqueue(&mut self, bytes: &[u8], delay: Duration) {
        self.rx.extend(bytes.iter().copied());
        self.ready_at = Instant::now() + delay;
        self.reply_pending = true;
    }

    fn enqueue_poll(&mut self) {
        if let (true, Some(polled)) = (self.rx.is_empty(), self.poll) {
            self.rx.extend([0x10, 0x05, polled].iter().copied());
            self.ready_at = Instant::now() + Duration::from_millis(2);
            self.poll_in_rx = Some(polled);
        }
    }

    fn deliver(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.chunk_size).min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..len)) {
            *slot = byte;
        }
        if self.rx.is_empty() {
            self.reply_pending = false;
            if self.poll_in_rx.take() == Some(*self.address) {
                self.turn = true;
            }
        }
        len
    }
}

/// A NUM station at the other end of the link. Clones share the station.
#[derive(Clone)]
pub struct Station(Arc<Mutex<StationState>>);

impl Station {
    pub fn new(address: u8) -> Self {
        Station(Arc::new(Mutex::new(StationState {
            address: Address::new(address).unwrap(),
            requests: FrameBuffer::new(),
            rx: VecDeque::new(),
            ready_at: Instant::now(),
            reply_pending: false,
            memory: HashMap::new(),
            forced: HashMap::new(),
            faults: VecDeque::new(),
            chunk_size: 64,
            reply_delay: Duration::from_millis(1),
            poll: None,
            poll_in_rx: None,
            turn: false,
            closed: false,
            panic_on_receive: false,
            sent: Vec::new(),
            codes: Vec::new(),
            messages: Vec::new(),
            violations: 0,
            out_of_turn: 0,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, StationState> {
        self.0.lock().expect("station mutex poisoned")
    }

    pub fn push_fault(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.lock().chunk_size = chunk_size.max(1);
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        self.lock().reply_delay = delay;
    }

    /// Poll `address` whenever the link is idle, like a bus master would.
    pub fn set_polling(&self, address: Option<u8>) {
        self.lock().poll = address;
    }

    pub fn set(&self, space: Space, index: u16, value: i32) {
        self.lock().set(space, index, value);
    }

    pub fn get(&self, space: Space, index: u16) -> i32 {
        self.lock().get(space, index)
    }

    pub fn force(&self, index: u16) {
        self.lock().forced.insert(index, true);
    }

    /// Queue bytes for the master as if they were left over on the line.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().enqueue(bytes, Duration::from_millis(0));
    }

    /// Number of `send` calls.
    pub fn send_count(&self) -> usize {
        self.lock().sent.len()
    }

    /// Everything sent to the station, one entry per `send`.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    /// Request codes in the order they were received.
    pub fn request_codes(&self) -> Vec<u8> {
        self.lock().codes.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lock().messages.clone()
    }

    /// Requests sent before the previous reply was read.
    pub fn violations(&self) -> usize {
        self.lock().violations
    }

    /// Requests sent without a poll for our address.
    pub fn out_of_turn(&self) -> usize {
        self.lock().out_of_turn
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Make the next `receive` panic, as a caller's thread dying mid-request.
    pub fn panic_on_next_receive(&self) {
        self.lock().panic_on_receive = true;
    }
}

impl Transport for Station {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "station closed"));
        }
        if state.reply_pending && state.poll_in_rx.is_none() {
            state.violations += 1;
        }
        if state.poll.is_some() && !std::mem::replace(&mut state.turn, false) {
            state.out_of_turn += 1;
        }
        state.sent.push(data.to_vec());
        state.requests.push(data);
        while let Ok(Some(frame)) = state.requests.next_frame() {
            if frame.address() == *state.address {
                state.codes.push(frame.code());
                state.reply(&frame);
            }
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        // the guard is dropped before panicking, the station stays usable
        let panic = std::mem::replace(&mut self.lock().panic_on_receive, false);
        if panic {
            panic!("receive interrupted");
        }
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return Ok(0);
                }
                state.enqueue_poll();
                let now = Instant::now();
                if !state.rx.is_empty() && now >= state.ready_at {
                    return Ok(state.deliver(buf));
                }
                if now >= deadline {
                    return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}
