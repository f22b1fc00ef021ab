//! SRV record extraction from resolver output.
//!
//! `nslookup -type=SRV` prints one line per record of the form:
//!
//! ```text
//! hello.mcs-conformance-1686874467.svc.clusterset.local	service = 0 50 42 hello.mcs-conformance-1686874467.svc.clusterset.local
//! ```
//!
//! The fields after the first `=` are `priority weight port target`. Only the
//! port and target are kept; priority and weight carry no conformance meaning.
//! Everything that does not have this shape (server banners, blank lines,
//! `;; connection timed out`, `** server can't find ...`) is skipped.

use serde::Serialize;
use std::fmt;

/// A single SRV record as reported by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SrvRecord {
    pub port: u16,
    pub domain_name: String,
}

impl SrvRecord {
    pub fn new(port: u16, domain_name: impl Into<String>) -> Self {
        Self {
            port,
            domain_name: domain_name.into(),
        }
    }
}

impl fmt::Display for SrvRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain_name, self.port)
    }
}

/// Parse every SRV record found in `output`, in the order they appear.
///
/// Never fails: empty or unrecognized input yields an empty vector.
pub fn parse_srv_records(output: &str) -> Vec<SrvRecord> {
    output.lines().filter_map(parse_srv_line).collect()
}

/// Parse a single resolver line, returning `None` if it is not a record line.
///
/// A port that is not an integer in `0..=65535` is reported as port 0 rather
/// than rejecting the line. The target is the leading run of domain name
/// characters of the fourth field; if that run is empty the line is skipped.
pub fn parse_srv_line(line: &str) -> Option<SrvRecord> {
    let (_, fields) = line.split_once('=')?;

    let mut tokens = fields.split_whitespace();
    let priority = tokens.next()?;
    let weight = tokens.next()?;
    let port = tokens.next()?;
    let target = tokens.next()?;

    if !is_numeric(priority) || !is_numeric(weight) {
        return None;
    }

    let domain_name = domain_prefix(target);
    if domain_name.is_empty() {
        return None;
    }

    Some(SrvRecord {
        port: port.parse().unwrap_or(0),
        domain_name: domain_name.to_string(),
    })
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn domain_prefix(token: &str) -> &str {
    let end = token
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '.'))
        .unwrap_or(token.len());
    token.get(..end).unwrap_or_default()
}
