//! Notification sink and outbox.
//!
//! Notifications are published to an outbox after the trade has committed.
//! Delivery happens on a background task; failures are logged and dropped.

use crate::error::{EngineError, Result};
use crate::types::{Notification, RiskAlert, Trade, TradeSummary};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_trade_executed(&self, user_id: &str, summary: &TradeSummary) -> Result<()>;

    async fn notify_risk_alert(&self, user_id: &str, alert: &RiskAlert) -> Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_trade_executed(&self, user_id: &str, summary: &TradeSummary) -> Result<()> {
        info!(
            "Trade confirmation for {}: {} {} {} @ {} (fees {}, total {})",
            user_id,
            summary.action,
            summary.quantity,
            summary.symbol,
            summary.price,
            summary.fees,
            summary.total
        );
        Ok(())
    }

    async fn notify_risk_alert(&self, user_id: &str, alert: &RiskAlert) -> Result<()> {
        warn!("Risk alert for {}: {}", user_id, alert.message);
        Ok(())
    }
}

/// POSTs notifications as JSON to a webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Notification(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn post(&self, body: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Notification(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_trade_executed(&self, user_id: &str, summary: &TradeSummary) -> Result<()> {
        self.post(json!({
            "type": "trade_executed",
            "userId": user_id,
            "trade": summary,
        }))
        .await
    }

    async fn notify_risk_alert(&self, user_id: &str, alert: &RiskAlert) -> Result<()> {
        self.post(json!({
            "type": "risk_alert",
            "userId": user_id,
            "alert": alert,
        }))
        .await
    }
}

/// Keeps every notification in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, notification: Notification) -> Result<()> {
        if self.fail {
            return Err(EngineError::Notification("delivery refused".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_trade_executed(&self, user_id: &str, summary: &TradeSummary) -> Result<()> {
        self.record(Notification::TradeExecuted {
            user_id: user_id.to_string(),
            summary: summary.clone(),
        })
    }

    async fn notify_risk_alert(&self, user_id: &str, alert: &RiskAlert) -> Result<()> {
        self.record(Notification::RiskAlert {
            user_id: user_id.to_string(),
            alert: alert.clone(),
        })
    }
}

enum Envelope {
    Deliver(Notification),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget notification queue drained by a background task.
#[derive(Clone)]
pub struct NotificationOutbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl NotificationOutbox {
    /// Start the delivery task. It stops once every outbox handle is dropped.
    pub fn spawn(notifier: Arc<dyn Notifier>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Deliver(notification) => {
                        deliver(notifier.as_ref(), notification).await;
                    }
                    Envelope::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Notification outbox closed");
        });

        (Self { tx }, handle)
    }

    /// Queue a notification. Never blocks and never fails the caller.
    pub fn publish(&self, notification: Notification) {
        if self.tx.send(Envelope::Deliver(notification)).is_err() {
            warn!("Notification outbox is closed, dropping notification");
        }
    }

    pub fn trade_executed(&self, trade: &Trade) {
        self.publish(Notification::TradeExecuted {
            user_id: trade.user_id.clone(),
            summary: trade.summary(),
        });
    }

    pub fn risk_alert(&self, user_id: &str, alert: RiskAlert) {
        self.publish(Notification::RiskAlert {
            user_id: user_id.to_string(),
            alert,
        });
    }

    /// Wait until everything published so far has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn deliver(notifier: &dyn Notifier, notification: Notification) {
    let result = match &notification {
        Notification::TradeExecuted { user_id, summary } => {
            notifier.notify_trade_executed(user_id, summary).await
        }
        Notification::RiskAlert { user_id, alert } => {
            notifier.notify_risk_alert(user_id, alert).await
        }
    };

    if let Err(e) = result {
        warn!(
            "Discarding notification for {}: {}",
            notification.user_id(),
            e
        );
    }
}
