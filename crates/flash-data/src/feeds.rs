//! Auto-reconnecting `eth_subscribe` websocket feeds.
//!
//! Each feed is an infinite loop: connect, subscribe, forward parsed
//! notifications to a channel, and on any transport failure (including a
//! read that exceeds the configured timeout) mark the feed not-live, back
//! off and reconnect. Every connection starts a new generation in the
//! [`PoolStore`] so records from a dropped connection can be fenced off.
//!
//! A feed only becomes live once the node acknowledges the subscription.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use eyre::{eyre, Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::pipeline::Health;
use crate::pools::PoolStore;
use crate::registry::Settings;
use crate::rpc::{decode_sync_data, parse_hex_u64, RawHeader};
use crate::types::{log_sequence, ChainHead, FeedKind, ReserveUpdate};

/// `keccak256("Sync(uint112,uint112)")`
pub const SYNC_TOPIC0: &str = "0x1c411e9a96e071241c2f21f7726b17ae89e3cab4c78be50e062b03a9fffbbad1";

const SUBSCRIBE_REQUEST_ID: u64 = 1;

/// Connection parameters shared by all three feeds.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub read_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl FeedConfig {
    pub fn from_settings(ws_url: &str, settings: &Settings) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            read_timeout: Duration::from_secs(settings.read_timeout_secs.max(1)),
            backoff_initial: Duration::from_millis(settings.reconnect_backoff_initial_ms.max(1)),
            backoff_max: Duration::from_secs(settings.reconnect_backoff_max_secs.max(1)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    data: String,
    topics: Vec<String>,
    block_number: Option<String>,
    transaction_index: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

enum SessionEnd {
    Shutdown,
    Disconnected { subscribed: bool },
}

/// `eth_subscribe` parameters for the block header feed.
pub fn new_heads_params() -> Value {
    json!(["newHeads"])
}

/// `eth_subscribe` parameters for `Sync` logs emitted by `pools`.
pub fn sync_logs_params(pools: &[Address]) -> Value {
    let addresses: Vec<String> = pools.iter().map(|pool| format!("{pool:#x}")).collect();
    json!(["logs", { "address": addresses, "topics": [SYNC_TOPIC0] }])
}

/// `eth_subscribe` parameters for pending transaction hashes.
pub fn pending_params() -> Value {
    json!(["newPendingTransactions"])
}

/// Parses a `newHeads` notification payload.
pub fn parse_head(result: &Value, _generation: u64) -> Option<ChainHead> {
    match serde_json::from_value::<RawHeader>(result.clone()) {
        Ok(header) => Some(header.to_head()),
        Err(error) => {
            tracing::debug!(error = %error, "dropping malformed block header");
            None
        }
    }
}

/// Parses a `Sync` log notification into a reserve update stamped with `generation`.
pub fn parse_sync_log(result: &Value, generation: u64) -> Option<ReserveUpdate> {
    let log: RawLog = match serde_json::from_value(result.clone()) {
        Ok(log) => log,
        Err(error) => {
            tracing::debug!(error = %error, "dropping malformed log");
            return None;
        }
    };

    if log.removed {
        tracing::debug!(pool = %log.address, "ignoring removed (reorged) sync log");
        return None;
    }
    if log.topics.first().map(|topic| topic.to_lowercase()).as_deref() != Some(SYNC_TOPIC0) {
        return None;
    }

    let decoded = (|| -> Result<ReserveUpdate> {
        let (reserve_a, reserve_b) = decode_sync_data(&log.data)?;
        let block = parse_hex_u64(log.block_number.as_deref().ok_or_else(|| eyre!("missing blockNumber"))?)?;
        let tx_index = parse_hex_u64(
            log.transaction_index
                .as_deref()
                .ok_or_else(|| eyre!("missing transactionIndex"))?,
        )?;
        let log_index = parse_hex_u64(log.log_index.as_deref().ok_or_else(|| eyre!("missing logIndex"))?)?;
        Ok(ReserveUpdate {
            pool: log.address,
            reserve_a,
            reserve_b,
            block,
            sequence: log_sequence(tx_index, log_index),
            generation,
        })
    })();

    match decoded {
        Ok(update) => Some(update),
        Err(error) => {
            tracing::debug!(pool = %log.address, error = %error, "dropping undecodable sync log");
            None
        }
    }
}

/// Parses a pending transaction hash notification.
pub fn parse_pending_hash(result: &Value, _generation: u64) -> Option<B256> {
    result.as_str().and_then(|hash| hash.parse::<B256>().ok())
}

/// Extracts `params.result` from an `eth_subscription` notification for `subscription`.
fn notification_result<'a>(message: &'a Value, subscription: &str) -> Option<&'a Value> {
    if message.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return None;
    }
    let params = message.get("params")?;
    if params.get("subscription").and_then(Value::as_str) != Some(subscription) {
        return None;
    }
    params.get("result")
}

/// Runs one feed until shutdown, reconnecting forever.
///
/// `parse` turns each notification payload into a channel item; returning
/// `None` drops the record.
#[tracing::instrument(skip_all, fields(feed = %feed))]
#[allow(clippy::too_many_arguments)]
pub async fn run_feed<T, F>(
    feed: FeedKind,
    config: FeedConfig,
    params: Value,
    health: Arc<Health>,
    store: Arc<PoolStore>,
    tx: mpsc::Sender<T>,
    mut shutdown: watch::Receiver<bool>,
    mut parse: F,
) where
    T: Send,
    F: FnMut(&Value, u64) -> Option<T> + Send,
{
    let mut backoff = config.backoff_initial;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let generation = store.begin_generation(feed);
        let outcome = session(
            feed,
            &config,
            &params,
            &health,
            generation,
            &tx,
            &mut shutdown,
            &mut parse,
        )
        .await;
        health.set_live(feed, false);

        match outcome {
            Ok(SessionEnd::Shutdown) => return,
            Ok(SessionEnd::Disconnected { subscribed }) => {
                tracing::warn!(generation, "feed disconnected");
                if subscribed {
                    backoff = config.backoff_initial;
                }
            }
            Err(error) => {
                tracing::warn!(generation, error = %error, "feed failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        backoff = (backoff * 2).min(config.backoff_max);
    }
}

#[allow(clippy::too_many_arguments)]
async fn session<T, F>(
    feed: FeedKind,
    config: &FeedConfig,
    params: &Value,
    health: &Health,
    generation: u64,
    tx: &mpsc::Sender<T>,
    shutdown: &mut watch::Receiver<bool>,
    parse: &mut F,
) -> Result<SessionEnd>
where
    F: FnMut(&Value, u64) -> Option<T>,
{
    let (stream, _) = tokio::time::timeout(config.read_timeout, connect_async(config.ws_url.as_str()))
        .await
        .map_err(|_| eyre!("websocket connect timed out"))?
        .wrap_err("websocket connect failed")?;
    let (mut sink, mut stream) = stream.split();

    let request = json!({
        "jsonrpc": "2.0",
        "id": SUBSCRIBE_REQUEST_ID,
        "method": "eth_subscribe",
        "params": params,
    });
    sink.send(Message::Text(request.to_string()))
        .await
        .wrap_err("failed to send eth_subscribe")?;

    let mut subscription: Option<String> = None;
    let mut keepalive = tokio::time::interval(config.read_timeout / 2);
    keepalive.tick().await;
    // Pings do not extend the deadline; only data or a pong does.
    let mut last_frame = Instant::now();

    loop {
        let frame = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                continue;
            }
            _ = keepalive.tick() => {
                sink.send(Message::Ping(Vec::new()))
                    .await
                    .wrap_err("keep-alive ping failed")?;
                continue;
            }
            _ = tokio::time::sleep_until(last_frame + config.read_timeout) => {
                return Err(eyre!("no frame within {:?}", config.read_timeout));
            }
            frame = stream.next() => frame,
        };

        let message = match frame {
            None => {
                return Ok(SessionEnd::Disconnected {
                    subscribed: subscription.is_some(),
                })
            }
            Some(Err(error)) => return Err(error).wrap_err("websocket read failed"),
            Some(Ok(message)) => message,
        };

        let text = match message {
            Message::Text(text) => {
                last_frame = Instant::now();
                text
            }
            Message::Pong(_) => {
                last_frame = Instant::now();
                continue;
            }
            Message::Close(_) => {
                return Ok(SessionEnd::Disconnected {
                    subscribed: subscription.is_some(),
                })
            }
            _ => continue,
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(error) => {
                tracing::debug!(error = %error, "dropping non-JSON frame");
                continue;
            }
        };

        let Some(subscription_id) = subscription.as_deref() else {
            if value.get("id").and_then(Value::as_u64) != Some(SUBSCRIBE_REQUEST_ID) {
                continue;
            }
            if let Some(error) = value.get("error") {
                return Err(eyre!("eth_subscribe rejected: {}", error));
            }
            let id = value
                .get("result")
                .and_then(Value::as_str)
                .ok_or_else(|| eyre!("eth_subscribe response missing subscription id"))?;
            subscription = Some(id.to_string());
            health.set_live(feed, true);
            tracing::info!(generation, subscription = id, "feed subscribed");
            continue;
        };

        let Some(result) = notification_result(&value, subscription_id) else {
            continue;
        };
        if let Some(item) = parse(result, generation) {
            if tx.send(item).await.is_err() {
                tracing::debug!("feed consumer dropped");
                return Ok(SessionEnd::Shutdown);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, U256};

    fn sync_log(removed: bool) -> Value {
        json!({
            "address": "0x0000000000000000000000000000000000000101",
            "topics": [SYNC_TOPIC0],
            "data": format!("0x{:064x}{:064x}", 500u64, 700u64),
            "blockNumber": "0x64",
            "transactionIndex": "0x2",
            "logIndex": "0x5",
            "removed": removed
        })
    }

    #[test]
    fn parses_sync_log_with_provenance() {
        let update = parse_sync_log(&sync_log(false), 3).expect("log should parse");
        assert_eq!(update.pool, address!("0000000000000000000000000000000000000101"));
        assert_eq!(update.reserve_a, U256::from(500u64));
        assert_eq!(update.reserve_b, U256::from(700u64));
        assert_eq!(update.block, 100);
        assert_eq!(update.sequence, log_sequence(2, 5));
        assert_eq!(update.generation, 3);
    }

    #[test]
    fn drops_removed_and_foreign_logs() {
        assert!(parse_sync_log(&sync_log(true), 0).is_none());

        let mut foreign = sync_log(false);
        foreign["topics"] = json!(["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"]);
        assert!(parse_sync_log(&foreign, 0).is_none());

        let mut truncated = sync_log(false);
        truncated["data"] = json!("0x01");
        assert!(parse_sync_log(&truncated, 0).is_none());
    }

    #[test]
    fn extracts_notification_for_own_subscription() {
        let message = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": { "subscription": "0xabc", "result": "0x01" }
        });
        assert_eq!(notification_result(&message, "0xabc"), Some(&json!("0x01")));
        assert_eq!(notification_result(&message, "0xdef"), None);
    }

    #[test]
    fn pending_hash_parses() {
        let hash = format!("0x{}", "11".repeat(32));
        assert!(parse_pending_hash(&json!(hash), 0).is_some());
        assert!(parse_pending_hash(&json!(12), 0).is_none());
    }

    #[tokio::test]
    async fn silent_subscription_times_out_and_drops_liveness() {
        use crate::registry::CycleDefinition;
        use tokio_tungstenite::accept_async;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local address");
        let server = tokio::spawn(async move {
            let mut open = Vec::new();
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let mut socket = accept_async(tcp).await.expect("handshake");
                let _ = socket.next().await;
                let ack = json!({ "jsonrpc": "2.0", "id": 1, "result": "0xfeed" });
                socket
                    .send(Message::Text(ack.to_string()))
                    .await
                    .expect("ack should send");
                // Keep the socket open but never read or write again.
                open.push(socket);
            }
        });

        let read_timeout = Duration::from_millis(400);
        let config = FeedConfig {
            ws_url: format!("ws://{addr}"),
            read_timeout,
            backoff_initial: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
        };
        let health = Arc::new(Health::new(12, 3));
        let store = Arc::new(PoolStore::new(Vec::new(), &Vec::<CycleDefinition>::new()));
        let (tx, _rx) = mpsc::channel::<B256>(8);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let feed = tokio::spawn(run_feed(
            FeedKind::PendingTransactions,
            config,
            pending_params(),
            Arc::clone(&health),
            store,
            tx,
            shutdown_rx,
            parse_pending_hash,
        ));

        let live = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !health.is_live(FeedKind::PendingTransactions) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("feed should subscribe");

        tokio::time::timeout(read_timeout * 3, async {
            while health.is_live(FeedKind::PendingTransactions) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stalled feed should go down");
        assert!(live.elapsed() >= read_timeout);

        shutdown.send_replace(true);
        feed.await.expect("feed task should stop");
        server.abort();
    }

    #[test]
    fn logs_params_filter_on_sync_topic() {
        let params = sync_logs_params(&[address!("0000000000000000000000000000000000000101")]);
        assert_eq!(params[0], json!("logs"));
        assert_eq!(params[1]["topics"][0], json!(SYNC_TOPIC0));
        assert_eq!(
            params[1]["address"][0],
            json!("0x0000000000000000000000000000000000000101")
        );
    }
}
