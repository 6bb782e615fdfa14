//! Static route feed parser.
//!
//! The route feed prints one route per line:
//!
//! ```text
//! 10.77.77.2|10.1.1.0/24|false
//! ^gateway   ^dst     ^pfx ^link-local flag
//! ```
//!
//! Each line is scanned by a four-state machine with a single accumulation
//! buffer. No state carries over between lines.

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::warn;

use crate::route::{install_route, RouteChannel, RouteError, RouteRequest};

/// The only supported link-local flag value.
pub const NEXT_HOP_FLAG: &str = "false";

/// Scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    CollectGateway,
    CollectDestination,
    CollectPrefix,
    CollectFlag,
}

impl ScanState {
    /// Delimiter that ends this state, if any.
    fn delimiter(&self) -> Option<char> {
        match self {
            ScanState::CollectGateway | ScanState::CollectPrefix => Some('|'),
            ScanState::CollectDestination => Some('/'),
            ScanState::CollectFlag => None,
        }
    }
}

/// Malformed route line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The line ended while still in `state`.
    #[error("static route '{line}': missing '{delimiter}' after {state:?}")]
    MissingDelimiter {
        line: String,
        state: ScanState,
        delimiter: char,
    },

    /// Gateway is not an IPv4 address.
    #[error("static route '{line}': bad gateway '{value}'")]
    BadGateway { line: String, value: String },

    /// Destination is not an IPv4 address.
    #[error("static route '{line}': bad destination network '{value}'")]
    BadDestination { line: String, value: String },

    /// Prefix length outside 0..=32.
    #[error("static route '{line}': bad prefix length {value}")]
    BadPrefix { line: String, value: i64 },
}

/// A decoded route line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRouteLine {
    pub request: RouteRequest,

    /// Raw link-local flag. Only `"false"` is supported.
    pub link_local: String,
}

impl StaticRouteLine {
    /// Whether the line asks for a next-hop route.
    pub fn is_next_hop(&self) -> bool {
        self.link_local == NEXT_HOP_FLAG
    }
}

/// Errors from handling one feed line.
#[derive(Debug, Error)]
pub enum StaticRouteError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("failed to add route {route}: {source}")]
    Install {
        route: RouteRequest,
        #[source]
        source: RouteError,
    },
}

/// Leading-integer parse: optional whitespace and sign, then digits.
/// Anything unparseable is 0.
fn lenient_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut value: i64 = 0;
    for b in rest.bytes().take_while(u8::is_ascii_digit) {
        value = value.saturating_mul(10).saturating_add(i64::from(b - b'0'));
    }

    if negative {
        -value
    } else {
        value
    }
}

/// Parse one feed line.
pub fn parse_line(line: &str) -> Result<StaticRouteLine, ParseError> {
    let mut state = ScanState::CollectGateway;
    let mut buf = String::new();
    let mut gateway = String::new();
    let mut destination = String::new();
    let mut prefix: i64 = 0;

    for c in line.chars() {
        state = match (state, state.delimiter()) {
            (ScanState::CollectGateway, Some(d)) if c == d => {
                gateway = std::mem::take(&mut buf);
                ScanState::CollectDestination
            }
            (ScanState::CollectDestination, Some(d)) if c == d => {
                destination = std::mem::take(&mut buf);
                ScanState::CollectPrefix
            }
            (ScanState::CollectPrefix, Some(d)) if c == d => {
                prefix = lenient_int(&std::mem::take(&mut buf));
                ScanState::CollectFlag
            }
            // the flag runs to the end of the line
            (state, _) => {
                buf.push(c);
                state
            }
        };
    }

    if let Some(delimiter) = state.delimiter() {
        return Err(ParseError::MissingDelimiter {
            line: line.to_string(),
            state,
            delimiter,
        });
    }

    let gateway: Ipv4Addr = gateway.parse().map_err(|_| ParseError::BadGateway {
        line: line.to_string(),
        value: gateway.clone(),
    })?;
    let network: Ipv4Addr = destination
        .parse()
        .map_err(|_| ParseError::BadDestination {
            line: line.to_string(),
            value: destination.clone(),
        })?;
    let prefix_len = u8::try_from(prefix)
        .ok()
        .filter(|len| *len <= 32)
        .ok_or_else(|| ParseError::BadPrefix {
            line: line.to_string(),
            value: prefix,
        })?;

    Ok(StaticRouteLine {
        request: RouteRequest::network_via(network, prefix_len, gateway),
        link_local: buf,
    })
}

/// Parse `line` and install the route it describes.
///
/// A link-local flag other than `"false"` is only warned about; the route is
/// still installed as a next-hop route.
pub fn apply_line(
    channel: &dyn RouteChannel,
    line: &str,
) -> Result<StaticRouteLine, StaticRouteError> {
    let parsed = parse_line(line)?;

    if !parsed.is_next_hop() {
        warn!(line, flag = %parsed.link_local, "invalid static route: only next-hop routes are supported");
    }

    install_route(channel, &parsed.request).map_err(|source| StaticRouteError::Install {
        route: parsed.request.clone(),
        source,
    })?;

    Ok(parsed)
}
