//! Scheduler / coordinator (spec.md §4.7): the public `Engine` that a host
//! drives through `new → open → start → step* → close`. This module owns
//! engine-wide aggregates (`bytes_done`, `bytes_per_second`, `ready`, the
//! state file) and is the only place that mutates them — per spec.md §5,
//! the coordinator is the sole writer of cross-connection state, which we
//! get for free here since every method that touches it takes `&mut self`.

pub mod scheduler;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use futures_util::future::join_all;

use crate::bandwidth::BandwidthLimiter;
use crate::config::Config;
use crate::connection::{ConnState, Connection};
use crate::error::{EngineError, Result};
use crate::file_backing::FileBacking;
use crate::message::{Message, MessageQueue};
use crate::state_file::{ConnectionRecord, StateFile};
use crate::stop::StopToken;
use crate::url::Url;

/// Bytes read per connection per `step`, before the bandwidth limiter and
/// per-connection remaining-range clamp are applied.
const STEP_CHUNK: u64 = 1 << 20;

/// How much weight the newest sample gets in the `bytes_per_second` EWMA.
/// Low enough that one slow/fast step doesn't whipsaw the ETA.
const RATE_EWMA_ALPHA: f64 = 0.3;

pub struct Engine {
    config: Config,
    urls: Vec<Url>,
    connections: Vec<Connection>,
    file: Option<FileBacking>,
    filename: PathBuf,
    total_size: Option<u64>,
    bytes_done: u64,
    start_byte: u64,
    start_time: SystemTime,
    finish_time: Option<SystemTime>,
    bytes_per_second: f64,
    ready: bool,
    opened: bool,
    started: bool,
    closed: bool,
    stop: StopToken,
    messages: MessageQueue,
    bandwidth: BandwidthLimiter,
    last_step_at: Option<Instant>,
    last_checkpoint_at: Option<Instant>,
    prev_bytes_done: Option<u64>,
}

impl Engine {
    /// Construct an engine from a configuration and a non-empty ordered
    /// list of candidate URL strings (spec.md §6 `engine_new`). URLs are
    /// parsed eagerly: an unparseable URL is a fatal construction error, not
    /// something discovered mid-download.
    pub fn new(mut config: Config, urls: Vec<String>) -> Result<Engine> {
        if urls.is_empty() {
            return Err(EngineError::EmptyUrlPool);
        }
        let messages = MessageQueue::new();
        for warning in config.validate() {
            messages.warn(warning);
        }

        let parsed = urls
            .iter()
            .map(|u| Url::parse(u))
            .collect::<Result<Vec<_>>>()?;

        let bandwidth = BandwidthLimiter::new(config.max_speed);

        Ok(Engine {
            filename: PathBuf::new(),
            urls: parsed,
            total_size: None,
            bytes_done: 0,
            start_byte: 0,
            start_time: SystemTime::now(),
            finish_time: None,
            bytes_per_second: 0.0,
            ready: false,
            opened: false,
            started: false,
            closed: false,
            stop: StopToken::new(),
            connections: Vec::new(),
            file: None,
            config,
            messages,
            bandwidth,
            last_step_at: None,
            last_checkpoint_at: None,
            prev_bytes_done: None,
        })
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Probe the resource, resolve filename collisions, and either create a
    /// fresh output + state file pair or validate/adopt an existing resumable
    /// pair (spec.md §4.4, §4.5, §6 `engine_open`).
    ///
    /// `explicit_filename` mirrors the source's two naming paths (spec.md
    /// §9): `true` when the host was given an explicit `-o NAME` and the
    /// name must be honored verbatim (only the `NoStateCannotResume` check
    /// applies); `false` when the host derived the hint from the URL and
    /// collisions should be resolved by probing `.0`, `.1`, … for a free or
    /// resumable slot.
    pub async fn open(&mut self, target_filename_hint: &Path, explicit_filename: bool) -> Result<()> {
        if self.opened {
            return Ok(());
        }

        let (probed_pos, probe) = self.probe_pool().await?;

        let filename = if explicit_filename {
            target_filename_hint.to_path_buf()
        } else {
            resolve_output_path(target_filename_hint)?
        };
        let output_exists = filename.exists();
        let saved = load_state_discarding_corrupt(&filename, &self.messages)?;

        if self.config.no_clobber && output_exists && saved.is_none() {
            return Err(EngineError::AlreadyComplete);
        }

        let saved = match saved {
            Some(_) if !output_exists => {
                self.messages.warn(
                    "state file found but no downloaded data present; starting from scratch"
                        .to_string(),
                );
                StateFile::delete(&filename)?;
                None
            }
            Some(s) => Some(s),
            None => {
                if explicit_filename && output_exists && probe.supported {
                    return Err(EngineError::NoStateCannotResume);
                }
                None
            }
        };

        let total_size = saved.as_ref().and_then(|s| s.total_size).or(probe.total_size);

        let mut connections = scheduler::assign_ranges(
            total_size,
            probe.supported,
            self.config.num_connections,
            &self.urls,
            probed_pos,
        );

        let mut start_byte = 0u64;
        if let Some(ref state) = saved {
            scheduler::apply_resume(&mut connections, state);
            start_byte = connections.iter().map(|c| c.bytes_fetched).sum();
        }

        self.file = Some(FileBacking::open(&filename, total_size)?);
        self.filename = filename;
        self.total_size = total_size;
        self.connections = connections;
        self.bytes_done = start_byte;
        self.start_byte = start_byte;
        self.start_time = SystemTime::now();
        self.opened = true;

        Ok(())
    }

    /// Try each pool URL in turn until one answers the probe; spec.md §4.1
    /// only describes probing "the resource", but a dead mirror at position
    /// 0 shouldn't sink the whole download before a single connection is
    /// even attempted.
    async fn probe_pool(&self) -> Result<(usize, crate::transport::ProbeResult)> {
        let mut last_err = None;
        for (pos, url) in self.urls.iter().enumerate() {
            match crate::transport::probe(url, &self.config).await {
                Ok(result) => return Ok((pos, result)),
                Err(e) => {
                    self.messages
                        .warn(format!("probe failed for {}: {e}", url.reconstruct()));
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(EngineError::AllConnectionsFailed))
    }

    /// Spawn workers (spec.md §6 `engine_start`). This crate drives every
    /// connection concurrently from within `step` rather than on persistent
    /// background tasks (spec.md §5 explicitly allows either model), so
    /// `start` only marks the engine ready to be stepped; each connection
    /// makes its INIT → CONNECTING transition on its first `step`.
    pub fn start(&mut self) -> Result<()> {
        if !self.opened {
            return Err(EngineError::FileIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                "start called before open",
            )));
        }
        self.started = true;
        self.last_step_at = Some(Instant::now());
        self.last_checkpoint_at = Some(Instant::now());
        Ok(())
    }

    /// Advance every enabled connection by one bounded slice, then update
    /// aggregates, enforce the speed cap, and maybe checkpoint (spec.md
    /// §4.7 "Step").
    pub async fn step(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        if !self.started {
            return Err(EngineError::FileIo(std::io::Error::new(
                std::io::ErrorKind::Other,
                "step called before start",
            )));
        }

        if self.stop.is_stopped() {
            self.shutdown_connections().await;
            self.checkpoint()?;
            return Ok(());
        }

        let now = Instant::now();
        let step_dt = self
            .last_step_at
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::from_millis(1))
            .max(Duration::from_millis(1));
        self.last_step_at = Some(now);

        self.fail_stalled_connections();

        // Step 1: poll each active worker for a bounded slice.
        let file = self.file.as_ref().expect("step called before open");
        let config = &self.config;
        let bandwidth = &self.bandwidth;
        let messages = &self.messages;

        let futures = self
            .connections
            .iter_mut()
            .filter(|c| c.enabled && matches!(c.state, ConnState::Init | ConnState::Connecting | ConnState::Transferring))
            .map(|c| async move {
                let chunk = c.remaining().min(STEP_CHUNK).max(1);
                bandwidth.acquire(chunk).await;
                let report = c.advance(config, file, chunk, messages).await;
                (c.index, report.error)
            });

        let outcomes = join_all(futures).await;
        for (index, error) in outcomes {
            if let Some(e) = error {
                self.messages
                    .warn(format!("connection {index}: {e}"));
            }
        }

        // An open-ended connection (unknown size, or range unsupported)
        // pins its own last_byte once EOF is reached; surface that as the
        // engine's total size once it's known.
        if self.total_size.is_none() {
            if let Some(done) = self
                .connections
                .iter()
                .find(|c| c.enabled && c.state == ConnState::Done)
            {
                self.total_size = Some(done.last_byte);
            }
        }

        // Step 2: rotate or disable FAILED connections.
        self.reconcile_failed_connections();

        if self.connections.iter().all(|c| !c.enabled) {
            return Err(EngineError::AllConnectionsFailed);
        }

        // Step 3: update bytes_done.
        self.bytes_done = self.connections.iter().map(|c| c.bytes_fetched).sum();

        // Step 4: update bytes_per_second (EWMA) and finish_time.
        let instantaneous = if step_dt.as_secs_f64() > 0.0 {
            (self.bytes_done as f64 - self.prev_bytes_done_for_rate()) / step_dt.as_secs_f64()
        } else {
            0.0
        };
        self.bytes_per_second = if self.bytes_per_second == 0.0 {
            instantaneous.max(0.0)
        } else {
            RATE_EWMA_ALPHA * instantaneous.max(0.0) + (1.0 - RATE_EWMA_ALPHA) * self.bytes_per_second
        };
        self.remember_bytes_done_for_rate();

        self.finish_time = match self.total_size {
            Some(total) if self.bytes_per_second > 0.0 => {
                let remaining = total.saturating_sub(self.bytes_done) as f64;
                Some(SystemTime::now() + Duration::from_secs_f64(remaining / self.bytes_per_second))
            }
            _ => None,
        };

        // Step 6: completion check.
        if self.connections.iter().filter(|c| c.enabled).all(|c| c.is_fully_done()) {
            self.shutdown_connections().await;
            StateFile::delete(&self.filename)?;
            self.ready = true;
            return Ok(());
        }

        // Step 7: periodic checkpoint.
        let due = self
            .last_checkpoint_at
            .map(|t| t.elapsed() >= self.config.checkpoint_interval)
            .unwrap_or(true);
        if due {
            self.checkpoint()?;
            self.last_checkpoint_at = Some(Instant::now());
        }

        Ok(())
    }

    fn prev_bytes_done_for_rate(&self) -> f64 {
        self.prev_bytes_done.unwrap_or(self.start_byte) as f64
    }

    fn remember_bytes_done_for_rate(&mut self) {
        self.prev_bytes_done = Some(self.bytes_done);
    }

    /// TRANSFERRING/CONNECTING → FAILED when idle past `connection_timeout`
    /// (spec.md §4.3): a liveness horizon on top of the per-read `io_timeout`
    /// already enforced inside `Connection::advance`.
    fn fail_stalled_connections(&mut self) {
        let horizon = self.config.connection_timeout;
        for c in self.connections.iter_mut() {
            if c.enabled
                && matches!(c.state, ConnState::Connecting | ConnState::Transferring)
                && c.last_transfer_time.elapsed() > horizon
            {
                c.state = ConnState::Failed;
                self.messages
                    .warn(format!("connection {} stalled past connection_timeout", c.index));
            }
        }
    }

    /// Spec.md §4.7 step 2: rotate FAILED connections onto the next
    /// alternate URL, or disable them and redistribute their remaining
    /// range once `max_retries` is exhausted.
    fn reconcile_failed_connections(&mut self) {
        let failed_indices: Vec<usize> = self
            .connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.enabled && c.state == ConnState::Failed)
            .map(|(i, _)| i)
            .collect();

        for index in failed_indices {
            self.connections[index].retry_count += 1;
            if self.connections[index].retry_count > self.config.max_retries {
                let had_target = scheduler::disable_and_redistribute(&mut self.connections, index);
                self.messages.warn(format!(
                    "connection {index} exhausted {} retries, disabling",
                    self.config.max_retries
                ));
                if !had_target {
                    self.messages
                        .error(format!("connection {index} had no peer to absorb its range"));
                }
            } else {
                let failed_pos = self.connections[index].url_pool_pos;
                let (url, pos) = scheduler::next_alternate_url(&self.urls, failed_pos);
                self.messages.info(format!(
                    "connection {index} rotating to alternate URL {}",
                    url.reconstruct()
                ));
                self.connections[index].rotate_to(url, pos);
            }
        }
    }

    async fn shutdown_connections(&mut self) {
        for c in self.connections.iter_mut() {
            c.shutdown().await;
        }
    }

    /// Atomically persist current progress to `<output>.st` (spec.md §4.5).
    fn checkpoint(&self) -> Result<()> {
        let state = StateFile {
            total_size: self.total_size,
            connections: self
                .connections
                .iter()
                .map(|c| ConnectionRecord {
                    current_byte: c.current_byte,
                    last_byte: c.last_byte,
                })
                .collect(),
        };
        state.checkpoint(&self.filename)
    }

    /// Idempotent teardown: join workers (trivial here, since none run in
    /// the background) and either flush a resume checkpoint or unlink the
    /// state file, depending on whether the download finished.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.opened {
            return Ok(());
        }
        self.shutdown_connections().await;
        if self.ready {
            StateFile::delete(&self.filename)
        } else {
            self.checkpoint()
        }
    }

    pub fn drain_messages(&self) -> Vec<Message> {
        self.messages.drain()
    }

    // ---- read-only accessors (spec.md §6) ----

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second
    }

    pub fn size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn finish_time(&self) -> Option<SystemTime> {
        self.finish_time
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }
}

/// Preserve the collision-probe loop exactly (spec.md §9): when no `-o`
/// hint is given and both output and state indicate an incomplete resume,
/// keep the name; otherwise probe successive suffixes starting at `.0`
/// until a free (neither-file-exists) or resumable (both-files-exist) pair
/// is found.
fn resolve_output_path(hint: &Path) -> Result<PathBuf> {
    let f_exists = hint.exists();
    let st_exists = StateFile::path_for(hint).exists();
    if (f_exists && st_exists) || (!f_exists && !st_exists) {
        return Ok(hint.to_path_buf());
    }

    let base = hint.as_os_str().to_os_string();
    for i in 0.. {
        let mut candidate = base.clone();
        candidate.push(format!(".{i}"));
        let candidate = PathBuf::from(candidate);
        let f_exists = candidate.exists();
        let st_exists = StateFile::path_for(&candidate).exists();
        if (f_exists && st_exists) || (!f_exists && !st_exists) {
            return Ok(candidate);
        }
    }
    unreachable!("suffix loop is unbounded")
}

/// State-file read protocol (spec.md §4.5): a magic/version mismatch or
/// truncated record is discarded, not fatal; any other I/O failure (e.g.
/// permission denied) is surfaced to the caller.
fn load_state_discarding_corrupt(output: &Path, messages: &MessageQueue) -> Result<Option<StateFile>> {
    match StateFile::load(output) {
        Ok(state) => Ok(state),
        Err(EngineError::FileIo(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            messages.warn(format!("discarding unreadable state file: {e}"));
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
