//! Session supervisor: owns the script connection lifecycle.
//!
//! Flow:
//! 1. Bind the endpoint, spawn the script process
//! 2. Accept its connection, exchange Hello/HelloAck
//! 3. Run the receiver loop routing frames to the dispatcher and registry
//! 4. On unexpected disconnect: fail all pending calls, retry with backoff
//!
//! Exactly one receiver loop runs per session. Callers issuing `invoke`
//! suspend on their own pending record and never touch the loop directly,
//! so a fault on the script side is contained to structured failures.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::codec::Decoded;
use crate::bridge::protocol::{
    CallResult, Frame, HelloAck, LIST_CAPABILITIES, Outcome, TrafficRecord,
};
use crate::channel::{BoundListener, Channel, ChannelState, FrameReader, FrameWriter, frame_stream};
use crate::config::BridgeConfig;
use crate::dispatcher::{CallDispatcher, InvocationHandle};
use crate::error::{BridgeError, ErrorKind};
use crate::registry::GatewayRegistry;
use crate::traffic::{PROCESS_TRAFFIC, TrafficSink};

/// Why the receiver loop stopped consuming the channel.
enum CloseReason {
    /// `stop()` interrupted the loop between frames.
    Stopped,
    /// Peer sent the graceful-close signal.
    PeerGoodbye,
    /// Peer closed the stream without a goodbye.
    PeerClosed,
    Transport(std::io::Error),
    ProcessExited(ExitStatus),
}

struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    child: Option<Child>,
}

/// One lifetime of the bridge, from connect through disconnect/retry.
///
/// Registry and dispatcher are owned per session; nothing here is
/// process-global.
pub struct Session {
    config: BridgeConfig,
    session_id: Uuid,
    registry: Arc<GatewayRegistry>,
    dispatcher: Arc<CallDispatcher>,
    state_tx: watch::Sender<ChannelState>,
    channel: tokio::sync::Mutex<Option<Arc<Channel>>>,
    sink: tokio::sync::RwLock<Option<Arc<dyn TrafficSink>>>,
    shutdown: tokio::sync::Mutex<Option<CancellationToken>>,
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let registry = Arc::new(GatewayRegistry::new());

        // Built-in capability discovery. Weak so the registry does not hold
        // itself alive through its own handler.
        let names = Arc::downgrade(&registry);
        registry.register(LIST_CAPABILITIES, move |_args| {
            let names = names.clone();
            async move {
                Ok(names
                    .upgrade()
                    .map(|registry| serde_json::json!(registry.names()))
                    .unwrap_or(serde_json::Value::Null))
            }
        });

        let (state_tx, _) = watch::channel(ChannelState::Disconnected);

        Arc::new(Self {
            config,
            session_id: Uuid::new_v4(),
            registry,
            dispatcher: CallDispatcher::new(),
            state_tx,
            channel: tokio::sync::Mutex::new(None),
            sink: tokio::sync::RwLock::new(None),
            shutdown: tokio::sync::Mutex::new(None),
            run_task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions, e.g. from the hosting UI.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Capabilities this host exposes to the script.
    pub fn registry(&self) -> &GatewayRegistry {
        &self.registry
    }

    /// Install the sink receiving records pushed back by the script.
    pub async fn set_traffic_sink(&self, sink: Arc<dyn TrafficSink>) {
        *self.sink.write().await = Some(sink);
    }

    /// Connect and hand the session to its receiver loop.
    ///
    /// Valid from Disconnected, or from Failed as the explicit restart after
    /// retries were exhausted. Returns once the session is Ready; initial
    /// connect attempts follow the retry policy.
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        let entered = self.state_tx.send_if_modified(|state| {
            if matches!(state, ChannelState::Disconnected | ChannelState::Failed) {
                *state = ChannelState::Connecting;
                true
            } else {
                false
            }
        });
        if !entered {
            return Err(BridgeError::InvalidState(self.state()));
        }
        tracing::info!(endpoint = %self.config.endpoint, "Starting session");

        let mut attempt = 0u32;
        let connection = loop {
            match self.connect_once().await {
                Ok(connection) => break connection,
                Err(e) => {
                    self.enter_failed(&format!("connect failed: {e}"));
                    if attempt >= self.config.retry.max_retries {
                        tracing::error!(error = %e, attempts = attempt + 1, "Giving up on connect");
                        return Err(e);
                    }
                    let delay = self.config.retry.backoff_for(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    self.transition(ChannelState::Connecting);
                }
            }
        };

        self.install(connection).await;
        Ok(())
    }

    /// Graceful shutdown: goodbye to the peer, drain in-flight calls, then
    /// Disconnected. Returns once the receiver loop has exited.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let token = { self.shutdown.lock().await.take() };
        let Some(token) = token else {
            return Ok(());
        };
        token.cancel();

        // Best-effort goodbye so the script can exit cleanly; the receiver
        // loop is already on its way to Draining, so a peer close racing
        // this send can no longer be mistaken for a failure.
        let channel = { self.channel.lock().await.clone() };
        if let Some(channel) = channel
            && let Err(e) = channel.send(Frame::Goodbye).await
        {
            tracing::debug!(error = %e, "Goodbye not delivered");
        }

        let task = { self.run_task.lock().await.take() };
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "Supervisor task ended abnormally");
        }
        Ok(())
    }

    /// Acknowledge a terminal failure, returning the session to
    /// Disconnected so `start()` may be called again.
    pub fn reset(&self) -> Result<(), BridgeError> {
        let reset = self.state_tx.send_if_modified(|state| {
            if *state == ChannelState::Failed {
                *state = ChannelState::Disconnected;
                true
            } else {
                false
            }
        });
        if reset {
            tracing::info!("Session reset");
            Ok(())
        } else {
            Err(BridgeError::InvalidState(self.state()))
        }
    }

    /// Call a script-side capability with the default deadline.
    pub async fn invoke(&self, capability: &str, arguments: Vec<serde_json::Value>) -> Outcome {
        self.invoke_with_deadline(capability, arguments, self.config.invoke_timeout)
            .await
    }

    pub async fn invoke_with_deadline(
        &self,
        capability: &str,
        arguments: Vec<serde_json::Value>,
        deadline: Duration,
    ) -> Outcome {
        match self.begin_invoke(capability, arguments, deadline).await {
            Ok(handle) => handle.wait().await,
            Err(e) => Outcome::failure(ErrorKind::ChannelClosed, e.to_string()),
        }
    }

    /// Issue a call and get a handle for waiting or cancelling it.
    pub async fn begin_invoke(
        &self,
        capability: &str,
        arguments: Vec<serde_json::Value>,
        deadline: Duration,
    ) -> Result<InvocationHandle, BridgeError> {
        if self.state() != ChannelState::Ready {
            return Err(BridgeError::ChannelClosed);
        }
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or(BridgeError::ChannelClosed)?;

        let (handle, invocation) = self.dispatcher.register(capability, arguments, deadline);
        if let Err(e) = channel.send(Frame::Invoke(invocation)).await {
            self.dispatcher.discard(handle.correlation_id());
            return Err(e);
        }
        Ok(handle)
    }

    /// Push one intercepted record to the script and wait for its verdict.
    ///
    /// The script may return a modified record in the result, or push
    /// further records back asynchronously as traffic frames.
    pub async fn deliver_traffic(&self, record: TrafficRecord) -> Outcome {
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => return Outcome::failure(ErrorKind::MalformedMessage, e.to_string()),
        };
        self.invoke(PROCESS_TRAFFIC, vec![value]).await
    }

    async fn connect_once(&self) -> Result<Connection, BridgeError> {
        let listener = self.config.endpoint.bind().await?;
        let bound = listener.local_endpoint()?;
        tracing::info!(endpoint = %bound, "Listening for script connection");

        let mut child = self
            .config
            .spawner
            .spawn(&bound)
            .map_err(|e| BridgeError::Spawn(e.to_string()))?;

        match self.accept_and_handshake(&listener).await {
            Ok((reader, writer)) => Ok(Connection {
                reader,
                writer,
                child,
            }),
            Err(e) => {
                if let Some(child) = child.as_mut()
                    && let Err(kill_err) = child.start_kill()
                {
                    tracing::debug!(error = %kill_err, "Script already gone after failed handshake");
                }
                Err(e)
            }
        }
    }

    async fn accept_and_handshake(
        &self,
        listener: &BoundListener,
    ) -> Result<(FrameReader, FrameWriter), BridgeError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, listener.accept())
            .await
            .map_err(|_| BridgeError::ConnectTimeout)??;

        let (mut reader, mut writer) = frame_stream(stream);

        let hello = tokio::time::timeout(self.config.handshake_timeout, reader.next())
            .await
            .map_err(|_| BridgeError::Handshake("timed out waiting for hello".to_string()))?;

        let hello = match hello {
            Some(Ok(Decoded::Frame(Frame::Hello(hello)))) => hello,
            Some(Ok(Decoded::Frame(frame))) => {
                return Err(BridgeError::Handshake(format!(
                    "expected hello, got {}",
                    frame.kind()
                )));
            }
            Some(Ok(Decoded::Malformed { detail })) => {
                return Err(BridgeError::Handshake(format!("malformed hello: {detail}")));
            }
            Some(Err(e)) => return Err(BridgeError::Io(e)),
            None => return Err(BridgeError::Handshake("peer closed before hello".to_string())),
        };

        if hello.protocol_version != self.config.protocol_version {
            return Err(BridgeError::Handshake(format!(
                "protocol version mismatch: host {}, script {}",
                self.config.protocol_version, hello.protocol_version
            )));
        }
        if let Some(expected) = &self.config.auth_token
            && hello.auth_token.as_deref() != Some(expected.as_str())
        {
            return Err(BridgeError::Handshake("auth token rejected".to_string()));
        }

        writer
            .send(Frame::HelloAck(HelloAck {
                protocol_version: self.config.protocol_version,
                session_id: self.session_id,
            }))
            .await?;

        tracing::info!(script_session = %hello.session_id, "Handshake complete");
        Ok((reader, writer))
    }

    async fn install(self: &Arc<Self>, connection: Connection) {
        let Connection {
            reader,
            writer,
            child,
        } = connection;

        let channel = Arc::new(Channel::new(writer, self.state_tx.subscribe()));
        *self.channel.lock().await = Some(Arc::clone(&channel));

        let token = CancellationToken::new();
        *self.shutdown.lock().await = Some(token.clone());

        self.transition(ChannelState::Ready);

        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            session.run_connection(reader, child, channel, token).await;
        });
        *self.run_task.lock().await = Some(task);
    }

    async fn run_connection(
        self: Arc<Self>,
        mut reader: FrameReader,
        mut child: Option<Child>,
        mut channel: Arc<Channel>,
        token: CancellationToken,
    ) {
        loop {
            let reason = self
                .read_until_closed(&mut reader, &mut child, &channel, &token)
                .await;

            let failure = match reason {
                CloseReason::Stopped | CloseReason::PeerGoodbye => {
                    if matches!(reason, CloseReason::PeerGoodbye) {
                        tracing::info!("Peer requested graceful close");
                    }
                    self.transition(ChannelState::Draining);
                    self.drain(&mut reader).await;
                    self.teardown(&mut child).await;
                    self.transition(ChannelState::Disconnected);
                    return;
                }
                CloseReason::PeerClosed => "peer closed the connection".to_string(),
                CloseReason::Transport(e) => format!("transport error: {e}"),
                CloseReason::ProcessExited(status) => {
                    tracing::error!(%status, "Script process exited");
                    format!("script process exited: {status}")
                }
            };
            // Clear the connection before Failed becomes observable, so a
            // prompt restart cannot race the old channel slot.
            self.teardown(&mut child).await;
            self.enter_failed(&failure);

            // Bounded automatic reconnect.
            let mut attempt = 0u32;
            let reconnected = loop {
                if attempt >= self.config.retry.max_retries {
                    break false;
                }
                let delay = self.config.retry.backoff_for(attempt);
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting after backoff"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        self.transition(ChannelState::Disconnected);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                // Claim Connecting; if someone restarted or reset the
                // session during the backoff, this supervisor retires.
                let claimed = self.state_tx.send_if_modified(|state| {
                    if *state == ChannelState::Failed {
                        *state = ChannelState::Connecting;
                        true
                    } else {
                        false
                    }
                });
                if !claimed {
                    tracing::info!("Session restarted externally, supervisor retiring");
                    return;
                }
                match self.connect_once().await {
                    Ok(connection) => {
                        let Connection {
                            reader: fresh_reader,
                            writer,
                            child: fresh_child,
                        } = connection;
                        let fresh = Arc::new(Channel::new(writer, self.state_tx.subscribe()));
                        *self.channel.lock().await = Some(Arc::clone(&fresh));
                        reader = fresh_reader;
                        child = fresh_child;
                        channel = fresh;
                        self.transition(ChannelState::Ready);
                        break true;
                    }
                    Err(e) => {
                        self.enter_failed(&format!("reconnect failed: {e}"));
                        attempt += 1;
                    }
                }
            };

            if !reconnected {
                tracing::error!("Retries exhausted, session stays failed until restarted");
                return;
            }
        }
    }

    /// Consume frames until the connection ends one way or another.
    ///
    /// Cancellation is only observed between frames, so a frame is either
    /// fully decoded and dispatched or not consumed at all.
    async fn read_until_closed(
        &self,
        reader: &mut FrameReader,
        child: &mut Option<Child>,
        channel: &Arc<Channel>,
        token: &CancellationToken,
    ) -> CloseReason {
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => return CloseReason::Stopped,

                exited = wait_child(child) => {
                    child.take();
                    return match exited {
                        Ok(status) => CloseReason::ProcessExited(status),
                        Err(e) => CloseReason::Transport(e),
                    };
                }

                frame = reader.next() => match frame {
                    Some(Ok(Decoded::Frame(Frame::Goodbye))) => return CloseReason::PeerGoodbye,
                    Some(Ok(Decoded::Frame(frame))) => self.handle_frame(frame, channel).await,
                    Some(Ok(Decoded::Malformed { detail })) => {
                        tracing::warn!(%detail, "Dropping malformed frame");
                    }
                    Some(Err(e)) => return CloseReason::Transport(e),
                    None => return CloseReason::PeerClosed,
                }
            }
        }
    }

    async fn handle_frame(&self, frame: Frame, channel: &Arc<Channel>) {
        match frame {
            Frame::Result(result) => {
                self.dispatcher.complete(result);
            }
            Frame::Invoke(invocation) => {
                let registry = Arc::clone(&self.registry);
                let channel = Arc::clone(channel);
                tokio::spawn(async move {
                    let correlation_id = invocation.correlation_id;
                    let capability = invocation.target_capability.clone();
                    let deadline = invocation.deadline_ms.map(Duration::from_millis);

                    let result = match deadline {
                        Some(limit) => {
                            match tokio::time::timeout(limit, registry.invoke_local(&invocation))
                                .await
                            {
                                Ok(result) => result,
                                Err(_) => CallResult {
                                    correlation_id,
                                    outcome: Outcome::failure(
                                        ErrorKind::Timeout,
                                        format!(
                                            "handler for {capability} exceeded {}ms",
                                            limit.as_millis()
                                        ),
                                    ),
                                },
                            }
                        }
                        None => registry.invoke_local(&invocation).await,
                    };

                    if let Err(e) = channel.send(Frame::Result(result)).await {
                        tracing::warn!(%correlation_id, error = %e, "Failed to answer invocation");
                    }
                });
            }
            Frame::Traffic(record) => {
                let sink = self.sink.read().await.clone();
                match sink {
                    Some(sink) => {
                        tokio::spawn(async move { sink.accept(record).await });
                    }
                    None => tracing::debug!(
                        record_id = %record.id,
                        "No traffic sink registered, dropping record"
                    ),
                }
            }
            Frame::Hello(_) | Frame::HelloAck(_) => {
                tracing::warn!(kind = frame.kind(), "Unexpected handshake frame on ready session");
            }
            // Intercepted by the read loop before dispatch.
            Frame::Goodbye => {}
        }
    }

    /// Keep consuming results until every in-flight call is resolved, the
    /// drain window closes, or the peer goes away.
    async fn drain(&self, reader: &mut FrameReader) {
        if self.dispatcher.is_idle() {
            return;
        }
        tracing::info!(
            pending = self.dispatcher.pending_count(),
            "Draining in-flight calls"
        );
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            tokio::select! {
                _ = self.dispatcher.wait_idle() => return,

                _ = tokio::time::sleep_until(deadline) => {
                    let forced = self
                        .dispatcher
                        .fail_all(ErrorKind::Timeout, "session draining");
                    tracing::warn!(count = forced, "Forcibly timed out in-flight calls during drain");
                    return;
                }

                frame = reader.next() => match frame {
                    Some(Ok(Decoded::Frame(Frame::Result(result)))) => {
                        self.dispatcher.complete(result);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => {
                        let forced = self
                            .dispatcher
                            .fail_all(ErrorKind::Timeout, "session draining");
                        if forced > 0 {
                            tracing::warn!(count = forced, "Peer left during drain");
                        }
                        return;
                    }
                }
            }
        }
    }

    async fn teardown(&self, child: &mut Option<Child>) {
        *self.channel.lock().await = None;
        if let Some(mut child) = child.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Script process already gone");
            }
            match child.wait().await {
                Ok(status) => tracing::debug!(%status, "Script process reaped"),
                Err(e) => tracing::warn!(error = %e, "Failed to reap script process"),
            }
        }
    }

    fn enter_failed(&self, reason: &str) {
        tracing::error!(%reason, "Session failed");
        self.transition(ChannelState::Failed);
        let failed = self.dispatcher.fail_all(ErrorKind::SessionLost, reason);
        if failed > 0 {
            tracing::info!(count = failed, "Resolved pending calls with session_lost");
        }
    }

    fn transition(&self, next: ChannelState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::info!(from = %state, to = %next, "Channel state transition");
            *state = next;
            true
        });
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}
