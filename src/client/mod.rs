//! Reconnecting Client Channel: a dashboard's connection to the hub.
//!
//! One instance per dashboard. It opens a single connection, reconnects after
//! abnormal closes following [`ReconnectPolicy`], pings while open, and hands
//! every application frame (not `connected`/`pong`/`heartbeat`) to the
//! inbound callback.

pub mod backoff;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message as WsMessage,
    },
};

pub use backoff::{ChannelState, CloseKind, Decision, ReconnectMachine, ReconnectPolicy};

use crate::error::ConnectionError;
use crate::frame::Frame;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub policy: ReconnectPolicy,
    pub ping_interval: Duration,
    /// Upper bound on the TCP connect plus WebSocket upgrade.
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            policy: ReconnectPolicy::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

struct Inner {
    config: ChannelConfig,
    machine: Mutex<ReconnectMachine>,
    connected: AtomicBool,
    last_message: Mutex<Option<Frame>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    on_frame: FrameCallback,
    closing: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ReconnectingChannel {
    inner: Arc<Inner>,
}

impl ReconnectingChannel {
    pub fn new(config: ChannelConfig, on_frame: impl Fn(Frame) + Send + Sync + 'static) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(ReconnectMachine::new(config.policy)),
                config,
                connected: AtomicBool::new(false),
                last_message: Mutex::new(None),
                outbound: Mutex::new(None),
                on_frame: Arc::new(on_frame),
                closing,
            }),
        }
    }

    /// Start connecting. Returns `false` without doing anything when an
    /// attempt is already in flight, the channel is open, or it was closed.
    pub fn connect(&self) -> bool {
        if !self.inner.machine.lock().begin_connect() {
            tracing::debug!(url = %self.inner.config.url, "connect skipped, channel busy or closed");
            return false;
        }
        tokio::spawn(drive(Arc::clone(&self.inner)));
        true
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ChannelState {
        self.inner.machine.lock().state()
    }

    /// The most recent application frame received.
    pub fn last_message(&self) -> Option<Frame> {
        self.inner.last_message.lock().clone()
    }

    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        let outbound = self.inner.outbound.lock().clone();
        match outbound {
            Some(tx) if self.is_connected() => tx.send(frame).map_err(|_| ConnectionError::NotOpen),
            _ => {
                tracing::warn!(kind = frame.kind.as_str(), "send on a channel that is not open");
                Err(ConnectionError::NotOpen)
            }
        }
    }

    /// Close with a normal closure code. No reconnect follows.
    pub fn close(&self) {
        self.inner.machine.lock().shutdown();
        self.inner.closing.send_replace(true);
    }
}

async fn drive(inner: Arc<Inner>) {
    let mut closing = inner.closing.subscribe();
    loop {
        let kind = match run_connection(&inner, &mut closing).await {
            Ok(kind) => kind,
            Err(err) => {
                tracing::warn!(url = %inner.config.url, error = %err, "hub channel failed");
                CloseKind::Abnormal
            }
        };
        inner.connected.store(false, Ordering::SeqCst);
        inner.outbound.lock().take();

        let decision = inner.machine.lock().on_close(kind);
        match decision {
            Decision::Reconnect { attempt, delay } => {
                tracing::info!(
                    attempt,
                    max_attempts = inner.config.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling hub reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = closed(&mut closing) => return,
                }
                let claimed = inner.machine.lock().begin_connect();
                if !claimed {
                    return;
                }
            }
            Decision::Stop => {
                tracing::info!(url = %inner.config.url, "hub channel closed normally");
                return;
            }
            Decision::GiveUp => {
                tracing::warn!(
                    url = %inner.config.url,
                    attempts = inner.config.policy.max_attempts,
                    "hub reconnect attempts exhausted"
                );
                return;
            }
        }
    }
}

async fn run_connection(
    inner: &Arc<Inner>,
    closing: &mut watch::Receiver<bool>,
) -> Result<CloseKind, ConnectionError> {
    let timeout = inner.config.connect_timeout;
    let (socket, _) = tokio::time::timeout(timeout, connect_async(inner.config.url.as_str()))
        .await
        .map_err(|_| ConnectionError::Connect(format!("no upgrade within {}ms", timeout.as_millis())))?
        .map_err(|e| ConnectionError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = socket.split();

    let opened = {
        let mut machine = inner.machine.lock();
        machine.on_open();
        machine.state() == ChannelState::Open
    };
    if !opened {
        send_close(&mut sink).await;
        return Ok(CloseKind::Normal);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    *inner.outbound.lock() = Some(tx);
    inner.connected.store(true, Ordering::SeqCst);
    tracing::info!(url = %inner.config.url, "hub channel open");

    let period = inner.config.ping_interval;
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => deliver(inner, text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    tracing::info!(code, "hub closed the channel");
                    return Ok(CloseKind::from_code(code));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(ConnectionError::from(err)),
                None => return Ok(CloseKind::Abnormal),
            },
            _ = ping.tick() => send_frame(&mut sink, &Frame::ping()).await?,
            Some(frame) = rx.recv() => send_frame(&mut sink, &frame).await?,
            _ = closed(closing) => {
                send_close(&mut sink).await;
                return Ok(CloseKind::Normal);
            }
        }
    }
}

/// Resolves once `close()` has been called. The borrowed `watch::Ref` is
/// dropped here so callers can hold this across other awaits.
async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}

fn deliver(inner: &Inner, text: &str) {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring malformed frame from hub");
            return;
        }
    };
    if frame.kind.is_protocol() {
        return;
    }

    tracing::debug!(kind = frame.kind.as_str(), "frame received");
    *inner.last_message.lock() = Some(frame.clone());
    (inner.on_frame)(frame);
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), ConnectionError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let Some(payload) = frame.encode() else {
        return Ok(());
    };
    sink.send(WsMessage::Text(payload.into())).await?;
    Ok(())
}

async fn send_close<S>(sink: &mut S)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let _ = sink
        .send(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client closing".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::spawn_server;
    use crate::frame::FrameKind;
    use crate::hub::Hub;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts,
        }
    }

    fn collecting(url: String, policy: ReconnectPolicy) -> (ReconnectingChannel, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ChannelConfig {
            policy,
            ..ChannelConfig::new(url)
        };
        let channel = ReconnectingChannel::new(config, move |frame| {
            let _ = tx.send(frame);
        });
        (channel, rx)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_for_channels(hub: &Hub, expected: usize) {
        for _ in 0..500 {
            if hub.channel_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hub never reached {expected} channels");
    }

    #[tokio::test]
    async fn delivers_application_frames_and_filters_protocol_ones() {
        let server = spawn_server(Duration::from_millis(30)).await;
        let (channel, mut frames) = collecting(server.ws_url(), fast_policy(5));
        assert!(channel.connect());
        wait_until(|| channel.is_connected()).await;
        wait_for_channels(&server.hub, 1).await;

        // Let a few heartbeats through before the real event.
        tokio::time::sleep(Duration::from_millis(100)).await;
        server
            .hub
            .broadcast(Frame::with_data(FrameKind::Message, serde_json::json!({ "id": "m1" })))
            .await;

        let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.event_id(), Some("m1"));
        assert_eq!(channel.last_message().unwrap().event_id(), Some("m1"));
        channel.close();
    }

    #[tokio::test]
    async fn sent_frames_come_back_through_the_hub() {
        let server = spawn_server(Duration::from_secs(30)).await;
        let (channel, mut frames) = collecting(server.ws_url(), fast_policy(5));
        channel.connect();
        wait_until(|| channel.is_connected()).await;

        channel
            .send(Frame::with_data(FrameKind::Session, serde_json::json!({ "id": "s1" })))
            .unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.kind, FrameKind::Session);
        assert!(echoed.timestamp.is_some());
        channel.close();
    }

    #[tokio::test]
    async fn second_connect_is_refused() {
        let server = spawn_server(Duration::from_secs(30)).await;
        let (channel, _frames) = collecting(server.ws_url(), fast_policy(5));
        assert!(channel.connect());
        assert!(!channel.connect());
        wait_until(|| channel.is_connected()).await;
        assert!(!channel.connect());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.hub.channel_count().await, 1);
        channel.close();
    }

    #[tokio::test]
    async fn reconnects_after_the_hub_drops_it() {
        let server = spawn_server(Duration::from_secs(30)).await;
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(1),
            ..fast_policy(5)
        };
        let (channel, _frames) = collecting(server.ws_url(), policy);
        channel.connect();
        wait_until(|| channel.is_connected()).await;
        wait_for_channels(&server.hub, 1).await;

        server.hub.close_all().await;
        wait_until(|| !channel.is_connected()).await;
        wait_until(|| channel.is_connected()).await;
        wait_for_channels(&server.hub, 1).await;
        assert_eq!(channel.state(), ChannelState::Open);
        channel.close();
    }

    #[tokio::test]
    async fn gives_up_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (channel, _frames) = collecting(format!("ws://127.0.0.1:{port}/ws"), fast_policy(3));
        channel.connect();
        wait_until(|| channel.state() == ChannelState::Exhausted).await;
        assert!(!channel.is_connected());
        assert!(!channel.connect());
    }

    #[tokio::test]
    async fn close_is_normal_and_final() {
        let server = spawn_server(Duration::from_secs(30)).await;
        let (channel, _frames) = collecting(server.ws_url(), fast_policy(5));
        channel.connect();
        wait_until(|| channel.is_connected()).await;
        wait_for_channels(&server.hub, 1).await;

        channel.close();
        wait_for_channels(&server.hub, 0).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.hub.channel_count().await, 0);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.connect());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn connection_driver_can_be_spawned() {
        let channel = ReconnectingChannel::new(ChannelConfig::new("ws://127.0.0.1:9/ws"), |_| {});
        let driver = drive(Arc::clone(&channel.inner));
        assert_send(&driver);
    }

    #[tokio::test]
    async fn stalled_upgrade_times_out_and_counts_as_a_failure() {
        // Accepts TCP but never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let held = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let (tx, _rx) = mpsc::unbounded_channel::<Frame>();
        let config = ChannelConfig {
            policy: fast_policy(2),
            connect_timeout: Duration::from_millis(50),
            ..ChannelConfig::new(format!("ws://127.0.0.1:{port}/ws"))
        };
        let channel = ReconnectingChannel::new(config, move |frame| {
            let _ = tx.send(frame);
        });
        assert!(channel.connect());
        wait_until(|| channel.state() == ChannelState::Exhausted).await;
        assert!(!channel.is_connected());
        held.abort();
    }

    #[tokio::test]
    async fn send_before_open_fails() {
        let (channel, _frames) = collecting("ws://127.0.0.1:9/ws".into(), fast_policy(1));
        assert!(matches!(channel.send(Frame::ping()), Err(ConnectionError::NotOpen)));
    }
}
