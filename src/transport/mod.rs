//! Per-protocol transport client (spec.md §4.2). Polymorphic over
//! {open, read_chunk, close}; `Connection` drives one instance per range.

pub mod ftp;
pub mod http;
mod resolver;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::Result;
use crate::url::{Scheme, Url};

/// Outcome of an `open()` call: whether the peer confirmed range support,
/// and (when known at open time) the remaining length of the body about to
/// be streamed.
#[derive(Debug, Clone, Copy)]
pub struct OpenOutcome {
    pub supported: bool,
}

#[async_trait]
pub trait Transport: Send {
    /// Issue a ranged request for `[range_start, range_end)`. `range_end =
    /// None` means "through end of resource".
    async fn open(&mut self, range_start: u64, range_end: Option<u64>) -> Result<OpenOutcome>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed the
    /// stream (end of the requested range, or end of resource).
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn close(&mut self);
}

/// Result of a probe (no range, just enough to learn size/support) issued
/// once at `Engine::open`.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub total_size: Option<u64>,
    pub supported: bool,
}

pub async fn probe(url: &Url, config: &Config) -> Result<ProbeResult> {
    match url.scheme {
        Scheme::Http | Scheme::Https => http::probe(url, config).await,
        Scheme::Ftp => ftp::probe(url, config).await,
    }
}

pub fn new_transport(url: &Url, config: &Config) -> Box<dyn Transport> {
    match url.scheme {
        Scheme::Http | Scheme::Https => Box::new(http::HttpTransport::new(url.clone(), config)),
        Scheme::Ftp => Box::new(ftp::FtpTransport::new(url.clone(), config)),
    }
}
