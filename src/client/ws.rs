//! WebSocket subscription to the backend event stream.
//!
//! One subscription is bound to one client id. Frames are handed to the sink
//! one at a time, in stream order, so a slow consumer back-pressures the read
//! loop instead of reordering events. Unexpected disconnects reconnect with a
//! fixed one-second backoff until the subscription is closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::error::{Error, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Consumer of WebSocket frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn on_text(&self, text: &str);
    async fn on_binary(&self, frame: &[u8]);
}

/// Handle to a running subscription.
pub struct WsSubscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl WsSubscription {
    /// Open a subscription for `client_id` against `base_url`.
    pub fn open(base_url: &Url, client_id: &str, sink: Arc<dyn FrameSink>) -> Result<Self> {
        let url = ws_url(base_url, client_id)?;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let client_id = client_id.to_string();

        let handle = tokio::spawn(async move {
            run_subscription(url, client_id, sink, task_token).await;
        });

        Ok(Self { token, handle })
    }

    /// Close gracefully: send a close frame and give the read loop a few
    /// seconds to drain before the task is joined.
    pub async fn close(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!("ws task join: {e}");
        }
    }
}

fn ws_url(base_url: &Url, client_id: &str) -> Result<Url> {
    let mut url = base_url.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::WebSocket(format!("cannot derive ws scheme from {base_url}")))?;
    url.set_path("/ws");
    url.set_query(None);
    url.query_pairs_mut().append_pair("clientId", client_id);
    Ok(url)
}

async fn run_subscription(
    url: Url,
    client_id: String,
    sink: Arc<dyn FrameSink>,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => return,
            connected = connect_async(url.as_str()) => match connected {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(client_id, "ws connect: {e}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            },
        };
        debug!(client_id, "ws connected");

        let (mut writer, mut reader) = stream.split();
        let mut closed_by_peer = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    // keep consuming until the peer acknowledges the close
                    let drain = async {
                        while let Some(frame) = reader.next().await {
                            match frame {
                                Ok(Message::Text(text)) => sink.on_text(&text).await,
                                Ok(Message::Binary(data)) => sink.on_binary(&data).await,
                                Ok(Message::Close(_)) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                    };
                    if tokio::time::timeout(CLOSE_GRACE, drain).await.is_err() {
                        warn!(client_id, "ws close grace elapsed");
                    }
                    debug!(client_id, "ws closing");
                    return;
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => sink.on_text(&text).await,
                    Some(Ok(Message::Binary(data))) => sink.on_binary(&data).await,
                    Some(Ok(Message::Close(_))) | None => {
                        closed_by_peer = true;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(client_id, "ws read: {e}");
                        break;
                    }
                },
            }
        }

        if closed_by_peer && token.is_cancelled() {
            return;
        }
        warn!(client_id, "ws reconnecting...");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
