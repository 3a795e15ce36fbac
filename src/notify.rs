// =============================================================================
// Notifier — Telegram sink for trade events
// =============================================================================
//
// Strictly a sink: it subscribes to bus topics, formats a short message, and
// fires the HTTP call on the runtime without ever propagating failure into
// the trading loop. The bot token is never logged; errors are reported with
// the token redacted.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{EventBus, TOPIC_TRADE_CLOSED, TOPIC_TRADE_OPEN};

#[derive(Clone)]
pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    /// Returns None when the notifier is unconfigured (missing token or chat
    /// id); callers simply skip wiring it.
    pub fn from_config(token: &str, chat_id: &str) -> Option<Self> {
        if token.trim().is_empty() || chat_id.trim().is_empty() {
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .ok()?;
        Some(Self {
            token: token.trim().to_string(),
            chat_id: chat_id.trim().to_string(),
            client,
        })
    }

    /// Send a plain-text message. Best-effort: failures are logged (token
    /// redacted) and swallowed.
    pub async fn send(&self, text: String) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = serde_json::json!({ "chat_id": self.chat_id, "text": text });
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("telegram notification sent");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram send rejected");
            }
            Err(e) => {
                let msg = e.to_string().replace(&self.token, "<token>");
                warn!(error = %msg, "telegram send failed");
            }
        }
    }

    /// Wire the notifier onto the bus. Sends are spawned so a slow Telegram
    /// API can never stall a trading cycle.
    pub fn attach(self: Arc<Self>, bus: &EventBus) {
        let on_open = self.clone();
        bus.subscribe(TOPIC_TRADE_OPEN, move |_, payload| {
            let text = format!(
                "OPEN {} {} entry={} tp={} sl={}",
                payload["symbol"].as_str().unwrap_or("?"),
                payload["decision"]["direction"].as_str().unwrap_or("?"),
                payload["decision"]["entry_price"].as_f64().unwrap_or(0.0),
                payload["decision"]["tp_price"].as_f64().unwrap_or(0.0),
                payload["decision"]["sl_price"].as_f64().unwrap_or(0.0),
            );
            let notifier = on_open.clone();
            tokio::spawn(async move { notifier.send(text).await });
        });

        let on_closed = self.clone();
        bus.subscribe(TOPIC_TRADE_CLOSED, move |_, payload| {
            let text = format!(
                "CLOSED {} {} pnl_r={:.3} exit={}",
                payload["symbol"].as_str().unwrap_or("?"),
                payload["trade_id"].as_str().unwrap_or("?"),
                payload["reward_state"]["pnl_r"].as_f64().unwrap_or(0.0),
                payload["execution_state"]["exit_type"].as_str().unwrap_or("?"),
            );
            let notifier = on_closed.clone();
            tokio::spawn(async move { notifier.send(text).await });
        });
    }
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}
