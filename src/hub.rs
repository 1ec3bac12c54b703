//! Broadcast Hub: fan-out relay between dashboard channels.
//!
//! Every open channel gets a `connected` frame on open, every non-`ping`
//! frame any channel sends (the sender included), and a `heartbeat` on a
//! fixed period. A `ping` is answered with a `pong` to its sender only.
//! Nothing is buffered for channels that are not open; catch-up happens
//! through the session store.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::frame::{Frame, FrameKind};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const CLOSE_GOING_AWAY: u16 = 1001;

pub type ChannelId = usize;

pub struct Hub {
    channels: Mutex<HashMap<ChannelId, mpsc::UnboundedSender<String>>>,
    next_channel_id: AtomicUsize,
    heartbeat_interval: Duration,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

impl Hub {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_channel_id: AtomicUsize::new(0),
            heartbeat_interval,
        }
    }

    /// Open a channel. Its queue already holds the `connected` frame.
    pub async fn register(&self) -> (ChannelId, mpsc::UnboundedReceiver<String>) {
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        if let Some(payload) = Frame::connected().encode() {
            let _ = tx.send(payload);
        }

        let open = {
            let mut channels = self.channels.lock().await;
            channels.insert(channel_id, tx);
            channels.len()
        };
        tracing::info!(channel_id, open, "hub channel opened");
        (channel_id, rx)
    }

    pub async fn unregister(&self, channel_id: ChannelId) {
        let removed = self.channels.lock().await.remove(&channel_id).is_some();
        if removed {
            tracing::info!(channel_id, "hub channel closed");
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Drop every channel. Their writers see the queue end and close.
    pub async fn close_all(&self) {
        let mut channels = self.channels.lock().await;
        let count = channels.len();
        channels.clear();
        tracing::info!(count, "hub closed all channels");
    }

    pub async fn send_to(&self, channel_id: ChannelId, frame: &Frame) -> bool {
        let Some(payload) = frame.encode() else {
            return false;
        };
        let tx = {
            let channels = self.channels.lock().await;
            channels.get(&channel_id).cloned()
        };
        match tx {
            Some(sender) if sender.send(payload).is_ok() => true,
            Some(_) => {
                self.unregister(channel_id).await;
                false
            }
            None => false,
        }
    }

    /// Stamp `frame` with the server time and deliver it to every open
    /// channel. Returns how many channels accepted it.
    pub async fn broadcast(&self, frame: Frame) -> usize {
        let frame = frame.stamped();
        tracing::debug!(kind = frame.kind.as_str(), "broadcasting frame");
        match frame.encode() {
            Some(payload) => self.fan_out(payload).await,
            None => 0,
        }
    }

    async fn fan_out(&self, payload: String) -> usize {
        let senders = {
            let channels = self.channels.lock().await;
            channels
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect::<Vec<_>>()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (channel_id, sender) in senders {
            if sender.send(payload.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(channel_id);
            }
        }

        if !dead.is_empty() {
            let mut channels = self.channels.lock().await;
            for channel_id in dead {
                channels.remove(&channel_id);
                tracing::warn!(channel_id, "dropped dead hub channel");
            }
        }
        delivered
    }

    /// Apply one text frame received from `channel_id`.
    pub async fn handle_inbound(&self, channel_id: ChannelId, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(channel_id, error = %err, "ignoring malformed frame");
                return;
            }
        };

        if frame.kind == FrameKind::Ping {
            self.send_to(channel_id, &Frame::pong()).await;
            return;
        }

        let delivered = self.broadcast(frame).await;
        tracing::debug!(channel_id, delivered, "relayed frame");
    }

    /// Push a `heartbeat` to every open channel once per interval.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(payload) = Frame::heartbeat().encode() else {
                    continue;
                };
                let delivered = hub.fan_out(payload).await;
                tracing::trace!(delivered, "heartbeat sent");
            }
        })
    }

    /// Drive one upgraded socket until either side goes away.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let (channel_id, mut rx) = self.register().await;
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let mut send_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "hub shutting down".into(),
                })))
                .await;
        });

        let hub = Arc::clone(&self);
        let mut recv_task = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => hub.handle_inbound(channel_id, text.as_str()).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(channel_id, error = %err, "hub channel error");
                        break;
                    }
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        self.unregister(channel_id).await;
    }
}
