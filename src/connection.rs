//! One proxied connection: the accepted local stream, the dialed remote
//! stream and the pipe between them.
//!
//! A connection runs in its own task, in two stages. Until the remote
//! stream exists only the local side is read: handshake bytes, or on the
//! server the encoded header that names the destination. Once both streams
//! are open they are split, and upload and download are pumped
//! concurrently so a full buffer on one side never stalls the other. The
//! pipe sits behind a mutex that is only held for a synchronous feed.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::address::{Endpoint, TargetAddr};
use crate::config::Role;
use crate::context::Context;
use crate::error::Error;
use crate::handshake::{socks5, Handshake, Step};
use crate::middleware::{self, Direction};
use crate::pipe::{Flow, Pipe, Signal};
use crate::track::Track;
use crate::transport::BoxedStream;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Bounds, in seconds, of the delay before a failed connection is closed.
const FALLBACK_CLOSE_MIN_SECS: u64 = 10;
const FALLBACK_CLOSE_MAX_SECS: u64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry notification, invoked once when the connection closes.
pub type OnClose = Box<dyn FnOnce(SessionId) + Send>;

enum Event {
    Local(io::Result<usize>),
    Deadline,
}

/// Why a relaying connection stopped.
enum Ended {
    Eof,
    Error(io::Error),
    Deadline,
}

pub struct Connection {
    id: SessionId,
    ctx: Arc<Context>,
    role: Role,
    local: Option<BoxedStream>,
    remote: Option<BoxedStream>,
    pipe: Option<Pipe>,
    handshake: Handshake,
    handshake_done: bool,
    /// Server only: raw relay to the redirect target, pipe bypassed.
    redirect: bool,
    /// Client only: local bytes are SOCKS5 UDP request messages.
    datagrams: bool,
    close_at: Option<Instant>,
    closed: bool,
    on_close: Option<OnClose>,
    track: Track,
}

impl Connection {
    pub fn new(
        id: SessionId,
        ctx: Arc<Context>,
        local: BoxedStream,
        peer: SocketAddr,
        on_close: OnClose,
    ) -> Result<Self, Error> {
        let role = ctx.config.role();
        // The server learns its destination from the stream itself, so its
        // pipe exists from the start. The client builds one after the local
        // handshake names a target.
        let pipe = match role {
            Role::Server => Some(Self::build_pipe(&ctx, None)?),
            Role::Client => None,
        };

        let mut track = Track::new();
        track.endpoint(peer);
        ctx.stats.connection_opened();

        Ok(Self {
            id,
            ctx,
            role,
            local: Some(local),
            remote: None,
            pipe,
            handshake: Handshake::new(),
            handshake_done: false,
            redirect: false,
            datagrams: false,
            close_at: None,
            closed: false,
            on_close: Some(on_close),
            track,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// Both streams are open and the connection is not a raw relay.
    pub fn is_pipable(&self) -> bool {
        !self.closed && !self.redirect && self.local.is_some() && self.remote.is_some()
    }

    fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    fn build_pipe(ctx: &Context, target: Option<&TargetAddr>) -> Result<Pipe, Error> {
        let stages = middleware::create_stack(&ctx.config, target)?;
        Ok(Pipe::new(stages)?)
    }

    /// Drives the connection until it closes.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        while !self.closed && self.remote.is_none() {
            let event = {
                let Some(local) = self.local.as_mut() else {
                    break;
                };
                let close_at = self.close_at;
                tokio::select! {
                    r = local.read(&mut buf) => Event::Local(r),
                    _ = sleep_optional(close_at) => Event::Deadline,
                }
            };

            match event {
                Event::Local(Ok(0)) => self.close(),
                Event::Local(Ok(n)) => {
                    self.on_forward(Bytes::copy_from_slice(&buf[..n])).await;
                }
                Event::Local(Err(e)) => {
                    self.on_error(&e);
                    self.close();
                }
                Event::Deadline => {
                    debug!("[{}] delayed close fired", self.id);
                    self.close();
                }
            }
        }

        if !self.closed {
            self.relay_both_ways().await;
        }
        self.close();
    }

    /// Bytes read from the local stream before the connection relays.
    async fn on_forward(&mut self, buf: Bytes) {
        if self.close_at.is_some() {
            // Already failed; drain until the delayed close fires.
            return;
        }
        if self.is_client() && !self.handshake_done {
            self.client_handshake(buf).await;
            return;
        }
        let buf = if self.datagrams {
            match unwrap_datagram(self.id, buf) {
                Some(data) => data,
                None => return,
            }
        } else {
            buf
        };
        if self.is_pipable() || (!self.is_client() && !self.handshake_done) {
            let direction = if self.is_client() {
                Direction::Upward
            } else {
                Direction::Downward
            };
            self.feed(direction, buf).await;
        }
    }

    fn on_error(&mut self, err: &io::Error) {
        debug!("[{}] {:?} - {}", self.id, err.kind(), err);
        self.ctx.stats.record_error();
    }

    async fn feed(&mut self, direction: Direction, buf: Bytes) {
        let Some(pipe) = self.pipe.as_mut() else {
            return;
        };
        let len = buf.len();
        let flow = pipe.feed(direction, buf);
        self.ctx.stats.add_in(len);
        self.track.download(len);
        self.drive(direction, flow).await;
    }

    /// Acts on the outcome of a feed. A connect signal may resume the pipe,
    /// producing a further outcome in the same direction.
    async fn drive(&mut self, direction: Direction, mut flow: Flow) {
        loop {
            match flow {
                Flow::Delivered(buf) => {
                    let toward_remote = (direction == Direction::Upward) == self.is_client();
                    self.send(buf, toward_remote).await;
                    return;
                }
                Flow::Buffered | Flow::Dropped => return,
                Flow::Signal(Signal::ConnectToDestination { target }) => {
                    match self.connect_to_destination(target).await {
                        Some(next) => flow = next,
                        None => return,
                    }
                }
                Flow::Signal(Signal::Failed { reason, original }) => {
                    self.on_stage_failed(reason, original).await;
                    return;
                }
            }
        }
    }

    /// Writes pipe output while the connection is being set up. Once both
    /// streams are split, [`Pumps::pump`] takes over.
    async fn send(&mut self, buf: Bytes, toward_remote: bool) {
        if !self.is_pipable() {
            return;
        }
        let stream = if toward_remote {
            self.remote.as_mut()
        } else {
            self.local.as_mut()
        };
        let Some(stream) = stream else {
            return;
        };
        match stream.write_all(&buf).await {
            Ok(()) => {
                self.ctx.stats.add_out(buf.len());
                self.track.upload(buf.len());
            }
            Err(e) => {
                self.on_error(&e);
                self.close();
            }
        }
    }

    /// Writes to a freshly dialed remote without touching the counters.
    async fn write_remote_raw(&mut self, buf: Bytes) {
        let Some(remote) = self.remote.as_mut() else {
            return;
        };
        if let Err(e) = remote.write_all(&buf).await {
            self.on_error(&e);
            self.close();
        }
    }

    /// Writes a handshake reply to the local peer. Not traffic, so not
    /// counted.
    async fn reply_local(&mut self, reply: Bytes) {
        let Some(local) = self.local.as_mut() else {
            return;
        };
        if let Err(e) = local.write_all(&reply).await {
            self.on_error(&e);
            self.close();
        }
    }

    async fn client_handshake(&mut self, buf: Bytes) {
        match self.handshake.feed(&buf) {
            Ok(Step::Continue { reply }) => {
                if let Some(reply) = reply {
                    self.reply_local(reply).await;
                }
            }
            Ok(Step::Done {
                target,
                reply,
                payload,
            }) => {
                if let Some(reply) = reply {
                    self.reply_local(reply).await;
                }
                self.on_handshake_done(target, payload).await;
            }
            Err(e) => {
                warn!("[{}] local handshake failed: {}", self.id, e);
                if let Some(reply) = self.handshake.reject_reply(&e) {
                    self.reply_local(reply).await;
                }
                self.close();
            }
        }
    }

    async fn on_handshake_done(&mut self, target: TargetAddr, payload: Bytes) {
        if self.closed {
            return;
        }
        let Some(balancer) = self.ctx.balancer.clone() else {
            error!("[{}] client connection without a balancer", self.id);
            self.close();
            return;
        };
        let endpoint = balancer.select();
        debug!("[{}] target {} via {}", self.id, target, endpoint);

        if self.connect(&endpoint).await.is_err() {
            if let Some(reply) = self.handshake.failure_reply() {
                self.reply_local(reply).await;
            }
            self.close();
            return;
        }

        match Self::build_pipe(&self.ctx, Some(&target)) {
            Ok(pipe) => self.pipe = Some(pipe),
            Err(e) => {
                error!("[{}] cannot build pipe: {}", self.id, e);
                self.close();
                return;
            }
        }
        self.handshake_done = true;
        self.datagrams = self.handshake.is_udp_associate();
        if let Some(reply) = self.handshake.success_reply() {
            self.reply_local(reply).await;
        }
        let payload = if self.datagrams && !payload.is_empty() {
            unwrap_datagram(self.id, payload).unwrap_or_default()
        } else {
            payload
        };
        if !payload.is_empty() {
            self.feed(Direction::Upward, payload).await;
        }
    }

    /// Server: dial the destination decoded by the protocol stage, then let
    /// the pipe release what it held back.
    async fn connect_to_destination(&mut self, target: TargetAddr) -> Option<Flow> {
        if self.is_client() {
            warn!("[{}] ignoring connect signal on the client", self.id);
            return None;
        }
        if self.connect(&target.to_endpoint()).await.is_err() {
            self.schedule_close("destination unreachable");
            return None;
        }
        self.handshake_done = true;
        self.pipe.as_mut().and_then(Pipe::resume)
    }

    async fn on_stage_failed(&mut self, reason: String, original: Bytes) {
        self.ctx.stats.record_fatal();

        let redirect = self.ctx.config.redirect_target().cloned();
        match redirect {
            Some(target) if !self.is_client() && self.remote.is_none() => {
                error!(
                    "[{}] connection will be redirected to {} due to: {}",
                    self.id, target, reason
                );
                if self.connect(&target).await.is_ok() {
                    self.redirect = true;
                    self.pipe = None;
                    self.write_remote_raw(original).await;
                } else {
                    self.schedule_close(&reason);
                }
            }
            _ => self.schedule_close(&reason),
        }
    }

    /// Arms the delayed close. The deadline is only checked by the event
    /// loop, and closing is idempotent, so an earlier close leaves it inert.
    fn schedule_close(&mut self, reason: &str) {
        if self.close_at.is_none() {
            self.close_at = Some(fallback_deadline(self.id, reason));
        }
    }

    /// Resolves and dials `endpoint` as the remote stream.
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), Error> {
        if endpoint.host.is_empty() || endpoint.port == 0 {
            warn!(
                "[{}] unexpected host={:?} port={}",
                self.id, endpoint.host, endpoint.port
            );
            self.close();
            return Err(Error::EmptyDestination {
                host: endpoint.host.clone(),
                port: endpoint.port,
            });
        }

        info!("[{}] connecting to: {}", self.id, endpoint);
        self.track.endpoint(endpoint);

        let ctx = Arc::clone(&self.ctx);
        match Self::dial(&ctx, endpoint).await {
            Ok(stream) => {
                self.remote = Some(stream);
                Ok(())
            }
            Err(e) => {
                error!("[{}] connect to {} failed due to: {}", self.id, endpoint, e);
                Err(e)
            }
        }
    }

    async fn dial(ctx: &Context, endpoint: &Endpoint) -> Result<BoxedStream, Error> {
        let ip = ctx.dns.get(&endpoint.host).await?;
        ctx.dialer
            .dial(SocketAddr::new(ip, endpoint.port))
            .await
            .map_err(|e| Error::Dial {
                target: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    /// Splits both streams and pumps each direction on its own until one
    /// side ends or the delayed close fires.
    async fn relay_both_ways(&mut self) {
        let (Some(local), Some(remote)) = (self.local.take(), self.remote.take()) else {
            return;
        };
        let pipe = if self.redirect {
            None
        } else {
            match self.pipe.take() {
                Some(pipe) => Some(Mutex::new(pipe)),
                None => return,
            }
        };
        let (local_rd, local_wr) = tokio::io::split(local);
        let (remote_rd, remote_wr) = tokio::io::split(remote);
        let (upload, download) = if self.is_client() {
            (Direction::Upward, Direction::Downward)
        } else {
            (Direction::Downward, Direction::Upward)
        };

        let track = Mutex::new(std::mem::take(&mut self.track));
        let pumps = Pumps {
            id: self.id,
            ctx: Arc::clone(&self.ctx),
            pipe: pipe.as_ref(),
            track: &track,
            datagrams: self.datagrams,
        };
        let close_at = self.close_at;
        let ended = tokio::select! {
            ended = pumps.pump(upload, local_rd, remote_wr) => ended,
            ended = pumps.pump(download, remote_rd, local_wr) => ended,
            _ = sleep_optional(close_at) => Ended::Deadline,
        };
        drop(pumps);
        self.track = track.into_inner().unwrap_or_else(|e| e.into_inner());

        match ended {
            Ended::Eof => debug!("[{}] peer closed", self.id),
            Ended::Error(e) => self.on_error(&e),
            Ended::Deadline => debug!("[{}] delayed close fired", self.id),
        }
    }

    /// Closes both streams once; later calls do nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.local = None;
        self.remote = None;
        self.pipe = None;
        self.close_at = None;
        self.ctx.stats.connection_closed();

        info!("[{}] closed", self.id);
        info!(
            "[{}] summary({} sampled): {}",
            self.id,
            self.track.samples(),
            self.track
        );
        if let Some(on_close) = self.on_close.take() {
            on_close(self.id);
        }
    }
}

/// Shared state for the two directions of a relaying connection. Without a
/// pipe the bytes are relayed raw and not counted.
struct Pumps<'a> {
    id: SessionId,
    ctx: Arc<Context>,
    pipe: Option<&'a Mutex<Pipe>>,
    track: &'a Mutex<Track>,
    /// Upward buffers carry a UDP request header to strip first.
    datagrams: bool,
}

impl Pumps<'_> {
    /// Reads `reader` until it ends, feeding each buffer through the pipe
    /// in `direction` and writing the result to `writer`.
    async fn pump<R, W>(&self, direction: Direction, mut reader: R, mut writer: W) -> Ended
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return Ended::Eof,
                Ok(n) => n,
                Err(e) => return Ended::Error(e),
            };
            let chunk = Bytes::copy_from_slice(&buf[..n]);

            let Some(pipe) = self.pipe else {
                if let Err(e) = writer.write_all(&chunk).await {
                    return Ended::Error(e);
                }
                continue;
            };

            let chunk = if self.datagrams && direction == Direction::Upward {
                match unwrap_datagram(self.id, chunk) {
                    Some(data) => data,
                    None => continue,
                }
            } else {
                chunk
            };
            let flow = pipe.lock().unwrap_or_else(|e| e.into_inner()).feed(direction, chunk);
            self.ctx.stats.add_in(n);
            self.with_track(|track| track.download(n));

            match flow {
                Flow::Delivered(out) => {
                    if let Err(e) = writer.write_all(&out).await {
                        return Ended::Error(e);
                    }
                    self.ctx.stats.add_out(out.len());
                    self.with_track(|track| track.upload(out.len()));
                }
                Flow::Buffered | Flow::Dropped => {}
                Flow::Signal(Signal::ConnectToDestination { target }) => {
                    warn!("[{}] ignoring connect to {} while relaying", self.id, target);
                }
                Flow::Signal(Signal::Failed { reason, .. }) => {
                    self.ctx.stats.record_fatal();
                    let deadline = fallback_deadline(self.id, &reason);
                    return match tokio::time::timeout_at(deadline, discard(&mut reader)).await {
                        Ok(()) => Ended::Eof,
                        Err(_) => Ended::Deadline,
                    };
                }
            }
        }
    }

    fn with_track(&self, f: impl FnOnce(&mut Track)) {
        f(&mut self.track.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// Strips the UDP request header from one local buffer.
fn unwrap_datagram(id: SessionId, buf: Bytes) -> Option<Bytes> {
    match socks5::parse_udp_request(&buf) {
        Some((_, data)) => Some(data),
        None => {
            warn!("[{}] -x-> dropped unidentified packet {} bytes", id, buf.len());
            None
        }
    }
}

/// Picks the randomized close deadline after a failure.
fn fallback_deadline(id: SessionId, reason: &str) -> Instant {
    let secs = rand::thread_rng().gen_range(FALLBACK_CLOSE_MIN_SECS..=FALLBACK_CLOSE_MAX_SECS);
    error!(
        "[{}] connection will be closed in {}s due to: {}",
        id, secs, reason
    );
    Instant::now() + Duration::from_secs(secs)
}

/// Reads and drops everything until the stream ends.
async fn discard<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    while let Ok(n) = reader.read(&mut buf).await {
        if n == 0 {
            return;
        }
    }
}

async fn sleep_optional(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
