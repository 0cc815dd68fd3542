//! Wire types for the Deriv v3 WebSocket tick protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-provider requests.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestMessage {
    Authorize { authorize: String },
    SubscribeTicks { ticks: String, subscribe: u8 },
    Forget { forget: String },
}

impl RequestMessage {
    pub fn subscribe_ticks(symbol: &str) -> Self {
        Self::SubscribeTicks {
            ticks: symbol.to_string(),
            subscribe: 1,
        }
    }
}

/// Tick payload inside a server message.
#[derive(Debug, Clone, Deserialize)]
pub struct TickPayload {
    pub symbol: String,
    pub quote: f64,
    pub epoch: i64,
    /// Subscription id, used for `forget`.
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Envelope for everything the provider sends. Fields are optional because
/// every response shares one shape; `echo_req` carries the request the
/// response answers, which is how errors are correlated to subscriptions.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerMessage {
    pub msg_type: Option<String>,
    pub tick: Option<TickPayload>,
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub echo_req: Option<Value>,
}

impl ServerMessage {
    /// Symbol of the `ticks` request this message answers, if any.
    pub fn echoed_symbol(&self) -> Option<&str> {
        self.echo_req
            .as_ref()
            .and_then(|req| req.get("ticks"))
            .and_then(|v| v.as_str())
    }
}
