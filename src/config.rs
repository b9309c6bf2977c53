//! Engine configuration (spec.md §3). Immutable for the lifetime of an
//! `Engine`; the host builds one from argument parsing (out of this crate's
//! scope) and hands it to `Engine::new`.

use std::time::Duration;

pub const MAX_CONNECTIONS: u32 = 16;
const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Any,
    V4,
    V6,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub num_connections: u32,
    /// bytes/sec, 0 = unlimited.
    pub max_speed: u64,
    pub max_redirect: u32,
    pub ai_family: AddressFamily,
    pub io_timeout: Duration,
    pub connection_timeout: Duration,
    pub insecure: bool,
    pub no_clobber: bool,
    pub http_proxy: Option<String>,
    pub ftp_proxy: Option<String>,
    pub no_proxy_list: Vec<String>,
    pub add_headers: Vec<(String, String)>,
    /// Cosmetic; not consumed by the core, carried for the host's benefit.
    pub alternate_output: bool,
    pub verbose: bool,
    /// Consumed by the external mirror-search collaborator, not the engine.
    pub search_top: u32,
    pub search_amount: u32,
    /// Not in spec.md's option list but needed to drive §4.5's "bounded
    /// wall-clock interval" checkpoint cadence.
    pub checkpoint_interval: Duration,
    /// Implementation cap on per-connection retries before a connection is
    /// disabled and its range redistributed (spec.md §4.7).
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_connections: 4,
            max_speed: 0,
            max_redirect: 5,
            ai_family: AddressFamily::Any,
            io_timeout: Duration::from_secs(45),
            connection_timeout: Duration::from_secs(60),
            insecure: false,
            no_clobber: false,
            http_proxy: None,
            ftp_proxy: None,
            no_proxy_list: Vec::new(),
            add_headers: Vec::new(),
            alternate_output: false,
            verbose: false,
            search_top: 0,
            search_amount: 0,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            max_retries: 3,
        }
    }
}

impl Config {
    /// Clamp out-of-range values into their valid span, returning one
    /// warning string per field that was clamped so the caller can forward
    /// them into the message queue.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.num_connections < 1 {
            warnings.push("num_connections was 0, clamped to 1".to_string());
            self.num_connections = 1;
        } else if self.num_connections > MAX_CONNECTIONS {
            warnings.push(format!(
                "num_connections was {}, clamped to {MAX_CONNECTIONS}",
                self.num_connections
            ));
            self.num_connections = MAX_CONNECTIONS;
        }

        if self.max_retries == 0 {
            warnings.push("max_retries was 0, clamped to 1".to_string());
            self.max_retries = 1;
        }

        warnings
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.add_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.num_connections, 4);
        assert_eq!(cfg.max_speed, 0);
    }

    #[test]
    fn validate_clamps_zero_connections() {
        let mut cfg = Config {
            num_connections: 0,
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert_eq!(cfg.num_connections, 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn validate_clamps_above_cap() {
        let mut cfg = Config {
            num_connections: 999,
            ..Config::default()
        };
        cfg.validate();
        assert_eq!(cfg.num_connections, MAX_CONNECTIONS);
    }

    #[test]
    fn user_agent_extracted_from_headers() {
        let cfg = Config {
            add_headers: vec![("User-Agent".to_string(), "axule/1.0".to_string())],
            ..Config::default()
        };
        assert_eq!(cfg.user_agent(), Some("axule/1.0"));
    }
}
