//! Socket worker: evaluate each message of a WebSocket feed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

use super::{Monitor, PollOutcome, TriggerNotification, WorkerContext, record_check};
use crate::error::{Error, Result};
use crate::model::{ConditionType, SocketSpec, TriggerDetail};
use crate::worker::value::extract_value;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SocketMonitor {
    spec: SocketSpec,
    condition: ConditionType,
    socket: Option<Socket>,
    pending: Option<String>,
    /// Wakes the supervisor for expiry checks on a quiet feed.
    idle_tick: Interval,
}

impl SocketMonitor {
    pub fn new(spec: SocketSpec, idle_check: Duration) -> Result<Self> {
        let condition = spec.condition_type()?;
        let mut idle_tick = tokio::time::interval(idle_check);
        idle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Self {
            spec,
            condition,
            socket: None,
            pending: None,
            idle_tick,
        })
    }

    async fn connect(&mut self) -> Result<()> {
        let (mut socket, _response) = tokio_tungstenite::connect_async(&self.spec.socket_url)
            .await
            .map_err(|e| Error::Rpc(format!("websocket connect to {} failed: {e}", self.spec.socket_url)))?;
        if let Some(subscribe) = &self.spec.subscribe_message {
            socket
                .send(Message::Text(subscribe.clone().into()))
                .await
                .map_err(|e| Error::Rpc(format!("websocket subscribe failed: {e}")))?;
        }
        info!(url = %self.spec.socket_url, "websocket connected");
        self.socket = Some(socket);
        Ok(())
    }
}

#[async_trait]
impl Monitor for SocketMonitor {
    fn source(&self) -> &'static str {
        "socket"
    }

    async fn wait(&mut self, _ctx: &WorkerContext) -> Result<()> {
        if self.socket.is_none() {
            self.connect().await?;
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(Error::Rpc("websocket not connected".into()));
        };

        loop {
            let next = tokio::select! {
                _ = self.idle_tick.tick() => return Ok(()),
                msg = socket.next() => msg,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    self.pending = Some(text.to_string());
                    return Ok(());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                        self.pending = Some(text);
                        return Ok(());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(Error::Rpc(format!("websocket closed: {frame:?}")));
                }
                Some(Ok(other)) => trace!(?other, "websocket control frame"),
                Some(Err(e)) => return Err(Error::Rpc(format!("websocket read failed: {e}"))),
                None => return Err(Error::Rpc("websocket stream ended".into())),
            }
        }
    }

    async fn check(&mut self, ctx: &WorkerContext) -> Result<PollOutcome> {
        let Some(message) = self.pending.take() else {
            return Ok(PollOutcome::Continue);
        };
        let value = extract_value(&message, self.spec.selected_key_route.as_deref())?;
        let now = Utc::now();
        {
            let mut state = ctx.state.write().await;
            state.last_value = Some(value);
            state.last_check = Some(now);
        }

        let satisfied =
            self.condition
                .is_satisfied(value, self.spec.lower_limit, self.spec.upper_limit);
        record_check("socket", satisfied);
        if !satisfied {
            debug!(job_id = %ctx.job.job_id, value, "socket condition not satisfied");
            ctx.record_unsatisfied().await;
            return Ok(PollOutcome::Continue);
        }

        Ok(ctx
            .fire(TriggerNotification {
                job_id: ctx.job.job_id,
                triggered_at: now,
                detail: TriggerDetail::Socket {
                    satisfied_value: value,
                    condition_type: self.condition.as_str().to_string(),
                    socket_url: self.spec.socket_url.clone(),
                },
            })
            .await)
    }
}
