//! Reconnecting websocket connection.
//!
//! The channel owns the socket and the retry loop; everything it learns is
//! handed to a [`ChannelHandler`]. Outgoing messages go through an
//! [`Outbox`], which only accepts messages while a connection is up.
//! Anything that must survive a reconnect is replayed by the handler from
//! `on_connected`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use edgecache_config::{log_push_debug, log_push_info, log_push_warn};

use crate::messages::PushMessage;
use crate::{PushError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: Duration::from_millis(250),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff after `current`, capped at `max`.
    pub fn next(&self, current: Duration) -> Duration {
        let next = current.as_millis() as f64 * self.multiplier.max(1.0);
        Duration::from_millis(next as u64).min(self.max)
    }

    /// `base` plus up to `jitter` of noise.
    pub fn jittered(&self, base: Duration) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_nanos(0))
            .subsec_nanos() as u64;
        base.saturating_add(Duration::from_millis(nanos % jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub url: String,
    pub display_id: String,
    pub machine_id: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// Disconnection is reported only after it lasts this long.
    pub offline_grace: Duration,
}

impl PushSettings {
    pub fn from_config(cfg: &edgecache_config::PushConfig) -> Result<Self> {
        let url = cfg.url.clone().ok_or(PushError::NotConfigured("push.url"))?;
        let display_id = cfg
            .display_id
            .clone()
            .ok_or(PushError::NotConfigured("push.display_id"))?;
        Ok(Self {
            url,
            display_id,
            machine_id: cfg.machine_id.clone(),
            reconnect: ReconnectPolicy {
                initial: Duration::from_millis(cfg.initial_backoff_ms),
                max: Duration::from_millis(cfg.max_backoff_ms),
                multiplier: cfg.backoff_multiplier,
                jitter: Duration::from_millis(cfg.jitter_ms),
            },
            offline_grace: Duration::from_millis(cfg.offline_grace_ms),
        })
    }

    /// Service URL with the display and machine identifiers attached.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("displayId", &self.display_id);
            if let Some(machine_id) = &self.machine_id {
                query.append_pair("machineId", machine_id);
            }
        }
        Ok(url)
    }
}

/// Sending half of the current connection, if any.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<PushMessage>>>>,
}

impl Outbox {
    /// Queue `msg` on the live connection. Returns false when disconnected.
    pub fn send(&self, msg: PushMessage) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        match tx.as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn open(&self) -> mpsc::UnboundedReceiver<PushMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        rx
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

/// Receives connection events and inbound messages.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Called on every transition into `Connected`; `reconnect` is false
    /// only for the first connection of the process.
    fn on_connected(&self, reconnect: bool);

    fn on_message(&self, msg: PushMessage);

    fn on_disconnected(&self);
}

pub struct PushChannel {
    settings: PushSettings,
    outbox: Outbox,
    state: watch::Sender<ChannelState>,
}

impl PushChannel {
    pub fn new(settings: PushSettings) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            settings,
            outbox: Outbox::default(),
            state,
        }
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    /// Run the connect/read/reconnect loop until the task is aborted.
    pub fn spawn<H: ChannelHandler>(self: Arc<Self>, handler: Arc<H>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(handler).await })
    }

    async fn run<H: ChannelHandler>(&self, handler: Arc<H>) {
        let endpoint = match self.settings.endpoint() {
            Ok(url) => url,
            Err(e) => {
                log_push_warn!(error = %e, "Push channel disabled");
                return;
            }
        };

        let policy = &self.settings.reconnect;
        let mut backoff = policy.initial;
        let mut connected_before = false;

        loop {
            self.set_state(ChannelState::Connecting);
            log_push_debug!(url = %self.settings.url, "Connecting to push service");

            match tokio_tungstenite::connect_async(endpoint.as_str()).await {
                Ok((socket, _)) => {
                    backoff = policy.initial;
                    let outgoing = self.outbox.open();
                    self.set_state(ChannelState::Connected);
                    log_push_info!(reconnect = connected_before, "Push channel connected");
                    handler.on_connected(connected_before);
                    connected_before = true;

                    if let Err(e) = pump(socket, outgoing, handler.as_ref()).await {
                        log_push_warn!(error = %e, "Push channel dropped");
                    }

                    self.outbox.close();
                    self.set_state(ChannelState::Disconnected);
                    handler.on_disconnected();
                }
                Err(e) => {
                    self.set_state(ChannelState::Disconnected);
                    log_push_debug!(error = %e, "Push channel connect failed");
                }
            }

            let delay = policy.jittered(backoff);
            tokio::time::sleep(delay).await;
            backoff = policy.next(backoff);
        }
    }
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Shuttle frames both ways until the connection ends.
async fn pump<H: ChannelHandler + ?Sized>(
    socket: Socket,
    mut outgoing: mpsc::UnboundedReceiver<PushMessage>,
    handler: &H,
) -> Result<()> {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            Some(msg) = outgoing.recv() => {
                sink.send(Message::Text(msg.to_json()?)).await?;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match PushMessage::parse(&text) {
                    Ok(msg) => handler.on_message(msg),
                    Err(e) => log_push_debug!(error = %e, "Ignoring malformed push message"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(PushError::WebSocket(e)),
            },
        }
    }
}
