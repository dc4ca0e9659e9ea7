//! One authenticated physical connection carrying many streams.
//!
//! The connection task reads frames, routes them to streams and runs each
//! delivery on the blocking pool. A separate writer task owns the sink and
//! drains the bounded outgoing queue that every [`Stream`] handle feeds, so
//! frames from different streams never interleave on the wire.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use muxsql_frame::{
    code, AuthRequest, Frame, FrameCodec, FrameConfig, FrameError, FrameKind, Message,
    CONNECTION_STREAM,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument, Span};
use zeroize::Zeroizing;

use crate::error::{MuxError, Result};
use crate::handler::{HandlerError, StreamHandler, Transition};
use crate::handshake::{self, HandshakeConfig, HandshakeError};
use crate::stream::{lock, Stream, StreamState};

/// Application side of a connection: authentication and per-stream handlers.
pub trait ConnectionService: Send + Sync + 'static {
    /// Per-connection state produced by a successful handshake.
    type Session: Send + Sync + 'static;

    /// Resolve the identity claimed by `request` and return its private key.
    ///
    /// Runs on the blocking pool. The connection verifies the request
    /// signature against the returned key before any stream is served.
    fn authenticate(
        &self,
        request: &AuthRequest,
    ) -> std::result::Result<Grant<Self::Session>, HandshakeError>;

    /// Default handler for a newly opened stream.
    fn open_stream(&self, session: &Arc<Self::Session>, stream: &Stream)
        -> Box<dyn StreamHandler>;
}

/// Result of resolving a claimed identity.
pub struct Grant<S> {
    /// Plaintext private key; zeroed when the grant is dropped.
    pub private_key: Zeroizing<Vec<u8>>,
    pub session: S,
}

impl<S> Grant<S> {
    pub fn new(private_key: Vec<u8>, session: S) -> Self {
        Self {
            private_key: Zeroizing::new(private_key),
            session,
        }
    }
}

/// Runtime knobs for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub handshake: HandshakeConfig,
    /// Frame limits applied after the handshake.
    pub frame: FrameConfig,
    /// How often a PING is sent.
    pub keepalive_interval: Duration,
    /// Close the connection when nothing arrived for this long.
    pub idle_timeout: Duration,
    /// Capacity of the outgoing frame queue shared by all streams.
    pub outgoing_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            frame: FrameConfig::default(),
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            outgoing_queue: 64,
        }
    }
}

type HandlerSlot = Arc<Mutex<Option<Box<dyn StreamHandler>>>>;

#[derive(Clone)]
struct Route {
    stream: Stream,
    handler: HandlerSlot,
}

enum Step {
    Continue,
    Stop(Result<()>),
}

/// A physical connection about to be served.
pub struct Connection<S: ConnectionService> {
    id: String,
    service: Arc<S>,
    config: ConnectionConfig,
}

impl<S: ConnectionService> Connection<S> {
    pub fn new(id: impl Into<String>, service: Arc<S>, config: ConnectionConfig) -> Self {
        Self {
            id: id.into(),
            service,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Serve `io` until the client leaves or the connection fails.
    pub async fn serve<T>(self, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_until(io, CancellationToken::new()).await
    }

    /// Serve `io` until the client leaves, the connection fails or `cancel` fires.
    ///
    /// Returns `Ok(())` on an orderly end (EOF, GOAWAY from the client,
    /// cancellation). Every stream is closed before this returns.
    pub async fn serve_until<T>(self, io: T, cancel: CancellationToken) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let span = info_span!("connection", conn = %self.id);
        self.run(io, cancel).instrument(span).await
    }

    async fn run<T>(self, io: T, cancel: CancellationToken) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let codec = FrameCodec::with_config(FrameConfig {
            max_payload_size: self.config.handshake.max_handshake_payload,
        });
        let mut framed = Framed::new(io, codec);

        let session = self.handshake(&mut framed).await?;
        debug!("handshake complete");

        // The handshake uses a tighter pre-auth payload budget.
        framed
            .codec_mut()
            .set_max_payload_size(self.config.frame.max_payload_size);
        let (sink, mut frames) = framed.split();

        let (outgoing, queue) = mpsc::channel(self.config.outgoing_queue.max(1));
        let writer_stop = CancellationToken::new();
        let writer = tokio::spawn(
            write_loop(
                sink,
                queue,
                self.config.frame.max_payload_size,
                writer_stop.clone(),
            )
            .instrument(Span::current()),
        );

        let period = self.config.keepalive_interval.max(Duration::from_millis(10));
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pings: u64 = 0;
        let mut last_seen = Instant::now();

        let mut routes: HashMap<u32, Route> = HashMap::new();
        let mut highest_id = CONNECTION_STREAM;

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("connection cancelled");
                    break Ok(());
                }
                _ = writer_stop.cancelled() => {
                    break Err(MuxError::Disconnected("connection writer stopped".to_string()));
                }
                next = frames.next() => {
                    last_seen = Instant::now();
                    let frame = match next {
                        None => {
                            debug!("peer closed connection");
                            break Ok(());
                        }
                        Some(Err(FrameError::ConnectionClosed)) => {
                            break Err(MuxError::Disconnected("connection closed mid-frame".to_string()));
                        }
                        Some(Err(FrameError::Io(err))) => break Err(MuxError::Io(err)),
                        Some(Err(err)) => {
                            warn!(error = %err, "malformed frame; closing connection");
                            let _ = outgoing
                                .send(Frame::go_away(code::UNEXPECTED_MESSAGE, &err.to_string()))
                                .await;
                            break Err(MuxError::Frame(err));
                        }
                        Some(Ok(frame)) => frame,
                    };
                    let step = self
                        .route(frame, &session, &outgoing, &mut routes, &mut highest_id)
                        .await;
                    // Time spent in a handler is not client idleness.
                    last_seen = Instant::now();
                    if let Step::Stop(result) = step {
                        break result;
                    }
                }
                _ = keepalive.tick() => {
                    if last_seen.elapsed() >= self.config.idle_timeout {
                        warn!(idle = ?last_seen.elapsed(), "closing idle connection");
                        break Err(MuxError::Timeout(self.config.idle_timeout));
                    }
                    routes.retain(|_, route| !route.stream.is_closed());
                    pings += 1;
                    if outgoing.send(Frame::ping(pings.to_le_bytes().to_vec())).await.is_err() {
                        break Err(MuxError::Disconnected("connection writer stopped".to_string()));
                    }
                }
            }
        };

        for route in routes.values() {
            route.stream.close_local();
        }
        drop(routes);
        drop(outgoing);
        writer_stop.cancel();
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "writer finished with error"),
            Err(err) => error!(error = %err, "writer task failed"),
        }
        debug!("connection closed");
        result
    }

    async fn handshake<T>(&self, framed: &mut Framed<T, FrameCodec>) -> Result<Arc<S::Session>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = &self.config.handshake;
        let first = match time::timeout(config.timeout, framed.next()).await {
            Err(_) => {
                reject(framed, "handshake timed out").await;
                return Err(MuxError::Timeout(config.timeout));
            }
            Ok(None) => {
                return Err(MuxError::Disconnected(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(Some(Err(err))) => return Err(reject(framed, &err.to_string()).await),
            Ok(Some(Ok(frame))) => frame,
        };

        if first.kind != FrameKind::Auth {
            let message = format!("expected AUTH frame, got {}", first.kind.name());
            return Err(reject(framed, &message).await);
        }
        let request = match AuthRequest::decode(first.payload) {
            Ok(request) => request,
            Err(err) => return Err(reject(framed, &err.to_string()).await),
        };
        if let Err(err) = handshake::validate_request(&request) {
            return Err(reject(framed, &err.message).await);
        }
        debug!(
            database = %request.database,
            access_key = %request.access_key,
            "authenticating"
        );

        let service = Arc::clone(&self.service);
        let handshake_config = config.clone();
        let span = Span::current();
        let outcome = tokio::task::spawn_blocking(move || {
            span.in_scope(|| {
                let grant = service.authenticate(&request)?;
                handshake::verify_request(
                    &request,
                    &grant.private_key,
                    handshake::unix_now(),
                    &handshake_config,
                )?;
                Ok::<_, HandshakeError>(grant.session)
            })
        })
        .await;

        match outcome {
            Ok(Ok(session)) => Ok(Arc::new(session)),
            Ok(Err(err)) => Err(reject(framed, &err.message).await),
            Err(err) => {
                error!(error = %err, "authentication task failed");
                Err(reject(framed, "Internal error").await)
            }
        }
    }

    async fn route(
        &self,
        frame: Frame,
        session: &Arc<S::Session>,
        outgoing: &mpsc::Sender<Frame>,
        routes: &mut HashMap<u32, Route>,
        highest_id: &mut u32,
    ) -> Step {
        let id = frame.stream;
        match frame.kind {
            FrameKind::Auth => {
                warn!("ignoring AUTH frame on authenticated connection");
            }
            FrameKind::Ping => {
                if outgoing.send(Frame::pong(frame.payload)).await.is_err() {
                    return Step::Stop(Err(MuxError::Disconnected(
                        "connection writer stopped".to_string(),
                    )));
                }
            }
            FrameKind::Pong => trace!("keepalive answered"),
            FrameKind::GoAway => {
                match frame.error_parts() {
                    Ok((code, message)) => {
                        debug!(code, code_name = code::name(code), %message, "peer sent GOAWAY")
                    }
                    Err(err) => debug!(error = %err, "peer sent malformed GOAWAY"),
                }
                return Step::Stop(Ok(()));
            }
            FrameKind::Close => {
                if let Some(route) = routes.get(&id) {
                    if route.stream.close_local() {
                        trace!(stream = id, "echoing remote close");
                        let _ = outgoing.send(Frame::close(id)).await;
                    }
                }
            }
            FrameKind::Reset => {
                if let Some(route) = routes.get(&id) {
                    if let Ok((code, message)) = frame.error_parts() {
                        debug!(stream = id, code, %message, "peer reset stream");
                    }
                    route.stream.close_local();
                }
            }
            FrameKind::Stream => {
                if id == CONNECTION_STREAM {
                    warn!("ignoring STREAM frame on the connection stream");
                    return Step::Continue;
                }
                let route = match routes.get(&id) {
                    Some(route) => route.clone(),
                    None if id > *highest_id => {
                        *highest_id = id;
                        let route = self.open(id, session, outgoing);
                        routes.insert(id, route.clone());
                        route
                    }
                    None => {
                        trace!(stream = id, "ignoring frame for retired stream");
                        return Step::Continue;
                    }
                };
                deliver(route, frame.payload).await;
            }
        }
        Step::Continue
    }

    fn open(&self, id: u32, session: &Arc<S::Session>, outgoing: &mpsc::Sender<Frame>) -> Route {
        let stream =
            Stream::with_max_payload(id, outgoing.clone(), self.config.frame.max_payload_size);
        let handler: HandlerSlot =
            Arc::new(Mutex::new(Some(self.service.open_stream(session, &stream))));

        let slot = Arc::clone(&handler);
        stream.observe_lifecycle(move |state| {
            if state == StreamState::Closed {
                let installed = lock(&slot).take();
                if let Some(mut handler) = installed {
                    handler.close();
                }
            }
        });
        trace!(stream = id, "stream opened");
        Route { stream, handler }
    }
}

async fn reject<T>(framed: &mut Framed<T, FrameCodec>, message: &str) -> MuxError
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    warn!(%message, "handshake failed");
    if let Err(err) = framed
        .send(Frame::go_away(code::HANDSHAKE_FAILED, message))
        .await
    {
        debug!(error = %err, "could not deliver handshake rejection");
    }
    MuxError::HandshakeFailed {
        code: code::HANDSHAKE_FAILED,
        message: message.to_string(),
    }
}

async fn deliver(route: Route, payload: Bytes) {
    let span = Span::current();
    let delivery = tokio::task::spawn_blocking(move || span.in_scope(|| dispatch(&route, payload)));
    if let Err(err) = delivery.await {
        error!(error = %err, "delivery task failed");
    }
}

fn dispatch(route: &Route, payload: Bytes) {
    let stream = &route.stream;
    if stream.is_closed() {
        trace!(stream = stream.id(), "ignoring message for closed stream");
        return;
    }

    let message = match Message::decode(payload) {
        Ok(message) => message,
        Err(err) => {
            debug!(stream = stream.id(), error = %err, "undecodable message");
            stream.error(code::UNEXPECTED_MESSAGE, "malformed message");
            return;
        }
    };
    if message.is_data() && stream.state() == StreamState::Start {
        stream.error(
            code::UNEXPECTED_MESSAGE,
            "unexpected data on non-established connection",
        );
        return;
    }

    let taken = lock(&route.handler).take();
    let Some(mut handler) = taken else {
        return;
    };
    let name = message.name();
    let is_data = message.is_data();
    trace!(stream = stream.id(), message = name, "dispatching");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.handle_message(message, stream)
    }));
    let next = match outcome {
        Ok(Ok(Transition::Stay)) => Some(handler),
        Ok(Ok(Transition::Replace(next))) => Some(next),
        Ok(Err(err)) => {
            match &err {
                HandlerError::Internal(detail) => {
                    error!(stream = stream.id(), message = name, error = %detail, "handler failed")
                }
                HandlerError::Revealable { code, message } => {
                    debug!(stream = stream.id(), code, %message, "request refused")
                }
            }
            let (code, text) = err.client_view();
            stream.error(code, text);
            handler.close();
            None
        }
        Err(payload) => {
            error!(
                stream = stream.id(),
                message = name,
                panic = panic_text(payload.as_ref()),
                "handler panicked"
            );
            stream.error(code::INTERNAL, "Internal error");
            None
        }
    };

    if let Some(mut handler) = next {
        let mut slot = lock(&route.handler);
        if stream.is_closed() {
            drop(slot);
            handler.close();
        } else {
            *slot = Some(handler);
        }
    }

    if !is_data && !stream.is_closed() {
        stream.establish();
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

async fn write_loop<T>(
    mut sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    mut queue: mpsc::Receiver<Frame>,
    max_payload: usize,
    stop: CancellationToken,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut finished = FinishedStreams::default();

    loop {
        let frame = tokio::select! {
            biased;
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = stop.cancelled() => break,
        };
        if let Err(err) = write_frame(&mut sink, &mut finished, max_payload, frame).await {
            stop.cancel();
            return Err(err);
        }
    }

    queue.close();
    while let Ok(frame) = queue.try_recv() {
        write_frame(&mut sink, &mut finished, max_payload, frame).await?;
    }
    sink.close().await?;
    Ok(())
}

/// Maximum number of finished stream ids the writer remembers.
const FINISHED_WINDOW: usize = 1024;

/// Streams that already sent CLOSE or RESET; later frames for them are
/// dropped. Only the most recent ids are kept: stale frames can only come
/// from a send racing the close.
#[derive(Default)]
struct FinishedStreams {
    ids: HashSet<u32>,
    order: VecDeque<u32>,
}

impl FinishedStreams {
    fn insert(&mut self, id: u32) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > FINISHED_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

async fn write_frame<T>(
    sink: &mut SplitSink<Framed<T, FrameCodec>, Frame>,
    finished: &mut FinishedStreams,
    max_payload: usize,
    frame: Frame,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if frame.payload.len() > max_payload {
        // Unencodable; only the owning stream pays for it.
        error!(
            stream = frame.stream,
            kind = frame.kind.name(),
            size = frame.payload.len(),
            max = max_payload,
            "frame exceeds payload limit"
        );
        if frame.stream != CONNECTION_STREAM && finished.insert(frame.stream) {
            sink.send(Frame::reset(frame.stream, code::INTERNAL, "Internal error"))
                .await?;
        }
        return Ok(());
    }

    let admit = match frame.kind {
        FrameKind::Close | FrameKind::Reset => finished.insert(frame.stream),
        FrameKind::Stream => !finished.contains(frame.stream),
        _ => true,
    };
    if !admit {
        trace!(stream = frame.stream, kind = frame.kind.name(), "dropping frame for finished stream");
        return Ok(());
    }
    sink.send(frame).await?;
    Ok(())
}
