//! Master side of a UNI-TE request/response exchange.
//!
//! [`Transaction`] is the sans-io state machine of one request: it hands out
//! the bytes to send, consumes received bytes through a [`FrameBuffer`] and
//! decides when an attempt has failed and whether to retry. [`io::Master`]
//! drives transactions over a [`io::Transport`].

use log::{debug, trace};

use crate::config::Config;
use crate::error::Error;
use crate::frame::{DecodeError, Frame, FrameBuffer, FrameBytes, Token};
use crate::message::{Request, Response};
use crate::types::Address;

pub mod io;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, nothing sent yet.
    Idle,
    /// The request has been sent, no reply bytes received.
    Sent,
    /// Part of a reply has been received.
    AwaitingResponse,
    Completed,
    /// The last attempt failed, the request must be sent again.
    Retrying,
    Failed,
}

/// Outcome of an attempt.
#[derive(Debug)]
pub enum Step {
    /// Send [`Transaction::request_bytes`] again.
    Retry,
    Done(Result<Response, Error>),
}

/// One request/response exchange with the station, retries included.
#[derive(Debug)]
pub struct Transaction {
    request: Request,
    bytes: FrameBytes,
    address: Address,
    max_attempts: u8,
    attempts: u8,
    state: TransactionState,
    response_received: bool,
}

impl Transaction {
    /// Validate and encode `request` for the station of `config`.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] or [`Error::PayloadTooLarge`].
    pub fn new(request: Request, config: &Config) -> Result<Self, Error> {
        let (code, payload) = request.encode(config.category)?;
        let bytes = Frame::new(config.address, config.xway, code, &payload)?.encode();
        Ok(Self {
            request,
            bytes,
            address: config.address,
            max_attempts: config.max_attempts.max(1),
            attempts: 0,
            state: TransactionState::Idle,
            response_received: false,
        })
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// True once a complete frame addressed to us has been decoded. The link
    /// is in sync after that, whatever the frame said.
    pub fn response_received(&self) -> bool {
        self.response_received
    }

    /// The encoded request frame.
    pub fn request_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Call when [`request_bytes`](Self::request_bytes) have been sent.
    pub fn data_sent(&mut self) {
        self.attempts += 1;
        self.state = TransactionState::Sent;
    }

    /// Extract the reply from received bytes. Returns `None` while the reply
    /// is still incomplete.
    ///
    /// Polls and frames for other stations are skipped.
    pub fn receive_data(&mut self, buffer: &mut FrameBuffer) -> Option<Step> {
        loop {
            match buffer.next_token() {
                Ok(None) => {
                    if !buffer.is_empty() {
                        self.state = TransactionState::AwaitingResponse;
                    }
                    return None;
                }
                Ok(Some(Token::Poll(address))) => trace!("poll of {} during reply", address),
                Ok(Some(Token::Frame(frame))) if frame.address() != *self.address => {
                    debug!("skipping frame for address {}", frame.address());
                }
                Ok(Some(Token::Frame(frame))) => {
                    debug!(
                        "received code {:#04x} payload {}",
                        frame.code(),
                        crate::hex(frame.payload())
                    );
                    return Some(self.complete(Response::decode(&self.request, &frame)));
                }
                Ok(Some(Token::Nak)) => {
                    return Some(self.attempt_failed(Some(DecodeError::NegativeAcknowledge)))
                }
                Err(err) => return Some(self.attempt_failed(Some(err))),
            }
        }
    }

    /// Call when the response timeout of the current attempt expires.
    pub fn timed_out(&mut self, buffer: &FrameBuffer) -> Step {
        if buffer.incomplete() {
            self.attempt_failed(Some(DecodeError::Truncated))
        } else {
            self.attempt_failed(None)
        }
    }

    /// Call when our turn to talk didn't come in time. Counts as a failed
    /// attempt.
    pub fn turn_missed(&mut self) -> Step {
        self.attempts += 1;
        self.attempt_failed(None)
    }

    fn complete(&mut self, result: Result<Response, Error>) -> Step {
        self.response_received = true;
        self.state = match result {
            Ok(_) => TransactionState::Completed,
            Err(_) => TransactionState::Failed,
        };
        Step::Done(result)
    }

    fn attempt_failed(&mut self, cause: Option<DecodeError>) -> Step {
        if self.attempts < self.max_attempts {
            self.state = TransactionState::Retrying;
            return Step::Retry;
        }
        self.state = TransactionState::Failed;
        let attempts = self.attempts;
        Step::Done(Err(match cause {
            None => Error::Timeout { attempts },
            Some(source) => Error::Protocol { attempts, source },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{addr, ObjectKind, ObjectRef, ObjectValue, XwayHeader};

    fn config() -> Config {
        Config::new(1).unwrap()
    }

    fn reply(address: u8, code: u8, payload: &[u8]) -> FrameBytes {
        let address = Address::new(address).unwrap();
        Frame::new(address, XwayHeader::default(), code, payload)
            .unwrap()
            .encode()
    }

    fn read_mw3() -> Request {
        Request::ReadObject(ObjectRef::new(ObjectKind::InternalWord, 3))
    }

    #[test]
    fn test_request_bytes() {
        let tr = Transaction::new(read_mw3(), &config()).unwrap();
        let expected = Frame::new(addr(1), XwayHeader::default(), 0x04, &[0, 3, 0])
            .unwrap()
            .encode();
        assert_eq!(tr.request_bytes(), expected.as_slice());
        assert_eq!(tr.state(), TransactionState::Idle);
        assert!(matches!(
            Transaction::new(
                Request::WriteObject(
                    ObjectRef::new(ObjectKind::ConstantWord, 0),
                    ObjectValue::Word(1)
                ),
                &config()
            ),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_completes_on_split_reply() {
        let mut tr = Transaction::new(read_mw3(), &config()).unwrap();
        tr.data_sent();
        assert_eq!(tr.state(), TransactionState::Sent);

        let mut buffer = FrameBuffer::new();
        let bytes = reply(1, 0x34, &[0x39, 0x30]);
        let (head, tail) = bytes.split_at(5);
        buffer.push(b"\x10\x05\x01");
        buffer.push(head);
        assert!(tr.receive_data(&mut buffer).is_none());
        assert_eq!(tr.state(), TransactionState::AwaitingResponse);
        buffer.push(tail);
        match tr.receive_data(&mut buffer) {
            Some(Step::Done(Ok(Response::Value(ObjectValue::Word(12345))))) => {}
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(tr.state(), TransactionState::Completed);
        assert!(tr.response_received());
        assert_eq!(tr.attempts(), 1);
    }

    #[test]
    fn test_skips_other_stations() {
        let mut tr = Transaction::new(read_mw3(), &config()).unwrap();
        tr.data_sent();
        let mut buffer = FrameBuffer::new();
        buffer.push(&reply(2, 0x34, &[0, 0]));
        assert!(tr.receive_data(&mut buffer).is_none());
        buffer.push(&reply(1, 0x34, &[1, 0]));
        assert!(matches!(
            tr.receive_data(&mut buffer),
            Some(Step::Done(Ok(Response::Value(ObjectValue::Word(1)))))
        ));
    }

    #[test]
    fn test_retries_then_times_out() {
        let config = config().with_max_attempts(2);
        let mut tr = Transaction::new(Request::Status, &config).unwrap();
        let buffer = FrameBuffer::new();
        tr.data_sent();
        assert!(matches!(tr.timed_out(&buffer), Step::Retry));
        assert_eq!(tr.state(), TransactionState::Retrying);
        tr.data_sent();
        assert!(matches!(
            tr.timed_out(&buffer),
            Step::Done(Err(Error::Timeout { attempts: 2 }))
        ));
        assert_eq!(tr.state(), TransactionState::Failed);
        assert!(!tr.response_received());
    }

    #[test]
    fn test_truncated_reply() {
        let config = config().with_max_attempts(1);
        let mut tr = Transaction::new(Request::Status, &config).unwrap();
        tr.data_sent();
        let mut buffer = FrameBuffer::new();
        let bytes = reply(1, 0x61, &[0, 0, 7]);
        buffer.push(&bytes[..bytes.len() - 1]);
        assert!(tr.receive_data(&mut buffer).is_none());
        assert!(matches!(
            tr.timed_out(&buffer),
            Step::Done(Err(Error::Protocol {
                attempts: 1,
                source: DecodeError::Truncated
            }))
        ));
    }

    #[test]
    fn test_corruption_and_nak_are_retried() {
        let mut tr = Transaction::new(Request::Status, &config()).unwrap();
        let mut buffer = FrameBuffer::new();

        tr.data_sent();
        let mut bytes = reply(1, 0x61, &[0, 0, 7]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        buffer.push(&bytes);
        assert!(matches!(tr.receive_data(&mut buffer), Some(Step::Retry)));

        buffer.clear();
        tr.data_sent();
        buffer.push(b"\x15");
        assert!(matches!(tr.receive_data(&mut buffer), Some(Step::Retry)));

        buffer.clear();
        tr.data_sent();
        buffer.push(b"\x15");
        assert!(matches!(
            tr.receive_data(&mut buffer),
            Some(Step::Done(Err(Error::Protocol {
                attempts: 3,
                source: DecodeError::NegativeAcknowledge
            })))
        ));
    }

    #[test]
    fn test_rejection_is_final() {
        let mut tr = Transaction::new(Request::Status, &config()).unwrap();
        tr.data_sent();
        let mut buffer = FrameBuffer::new();
        buffer.push(&reply(1, 0xFD, &[]));
        assert!(matches!(
            tr.receive_data(&mut buffer),
            Some(Step::Done(Err(Error::RejectedByStation { .. })))
        ));
        assert_eq!(tr.state(), TransactionState::Failed);
        assert!(tr.response_received());
    }

    #[test]
    fn test_turn_missed() {
        let config = config().with_max_attempts(1);
        let mut tr = Transaction::new(Request::Status, &config).unwrap();
        assert!(matches!(
            tr.turn_missed(),
            Step::Done(Err(Error::Timeout { attempts: 1 }))
        ));
    }
}
