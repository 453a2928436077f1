//! Settings of a [`Master`](crate::Master), fixed when it is created.

use std::time::Duration;

use crate::error::{invalid_argument, Error};
use crate::types::{self, Address, Category, IntoAddress, XwayHeader};

/// How long to wait for each response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_ATTEMPTS: u8 = 3;
/// How long the link must stay quiet before it counts as drained.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// When the master may start talking.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TurnPolicy {
    /// Send as soon as a request is issued. Right for a link tunnelled
    /// through an adapter that handles the bus itself.
    Immediate,
    /// Wait for the bus master to poll our address, `<DLE> <ENQ> addr`,
    /// before every send.
    AwaitPoll,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        TurnPolicy::Immediate
    }
}

/// ## Example
/// ```
/// use std::time::Duration;
/// use unitelway_proto::{Config, TurnPolicy};
///
/// let config = Config::new(4)
///     .unwrap()
///     .with_timeout(Duration::from_millis(500))
///     .with_turn_policy(TurnPolicy::AwaitPoll);
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Link address of the station.
    pub address: Address,
    pub category: Category,
    pub xway: XwayHeader,
    /// Response timeout of one attempt.
    pub timeout: Duration,
    /// Number of sends before a request fails, at least 1.
    pub max_attempts: u8,
    pub drain_timeout: Duration,
    pub turn: TurnPolicy,
    /// Raw bytes some adapters need before they pass traffic on, sent once
    /// when the [`Master`](crate::Master) is created.
    pub connection_query: Option<Vec<u8>>,
}

impl Config {
    /// Default settings for the station at `address`.
    /// # Errors
    /// Returns [`types::Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: impl IntoAddress) -> Result<Self, types::Error> {
        Ok(Self {
            address: address.into_address()?,
            category: Category::default(),
            xway: XwayHeader::default(),
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            turn: TurnPolicy::default(),
            connection_query: None,
        })
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_xway(mut self, xway: XwayHeader) -> Self {
        self.xway = xway;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u8) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_turn_policy(mut self, turn: TurnPolicy) -> Self {
        self.turn = turn;
        self
    }

    pub fn with_connection_query(mut self, query: impl Into<Vec<u8>>) -> Self {
        self.connection_query = Some(query.into());
        self
    }

    /// # Errors
    /// [`Error::InvalidArgument`] for a zero timeout or attempt count, or an
    /// empty connection query.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_attempts == 0 {
            return Err(invalid_argument("max_attempts must be at least 1"));
        }
        if self.timeout == Duration::from_secs(0) {
            return Err(invalid_argument("timeout must not be zero"));
        }
        if self.drain_timeout == Duration::from_secs(0) {
            return Err(invalid_argument("drain_timeout must not be zero"));
        }
        if matches!(&self.connection_query, Some(query) if query.is_empty()) {
            return Err(invalid_argument("connection query must not be empty"));
        }
        Ok(())
    }
}
