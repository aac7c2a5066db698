//! 시뮬레이션 피드 데모.
//!
//! 실행: `cargo run -p feed-client --example simulated_feed`
//!
//! 랜덤 워크 티커가 흘리는 가격을 구독하고, 코얼레싱된 업데이트와
//! push 응답을 로그로 확인합니다.

use anyhow::Result;
use feed_client::{
    simulated::spawn_random_ticker, FeedClient, HandlerSet, Identity, SimulatedTransport,
    StaticCredentials,
};
use feed_core::init_logging_from_env;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging_from_env().map_err(|e| anyhow::anyhow!("logging init failed: {e}"))?;

    let transport = Arc::new(SimulatedTransport::new());
    let credentials = Arc::new(StaticCredentials::new(Identity::new("demo-user")));
    let client = Arc::new(FeedClient::new(
        Arc::clone(&transport) as Arc<dyn feed_client::Transport>,
        credentials,
        feed_core::FeedConfig::default(),
    ));

    let handlers = HandlerSet::new()
        .on_join(|snapshot| info!(stocks = snapshot.stocks.len(), "Joined"))
        .on_new_price(|update| {
            info!(symbol = %update.symbol, price = %update.price, change = %update.change, "Price")
        });

    let sub = client.subscribe("stock:AAPL", handlers).await?;
    info!(topic = sub.topic(), "Subscribed");

    let ticker_token = CancellationToken::new();
    let channel = transport
        .channel_handle("stock:AAPL")
        .expect("channel exists after subscribe");
    spawn_random_ticker(
        channel,
        "AAPL".to_string(),
        Decimal::new(18_500, 2),
        Duration::from_millis(10),
        ticker_token.clone(),
    );

    tokio::time::sleep(Duration::from_secs(2)).await;

    let receipt = client.push("stock:AAPL", "buy", json!({"qty": 10})).await?;
    let reply = receipt.ack().await?;
    info!(%reply, "Push acknowledged");

    if let Some(quote) = client.quote("AAPL") {
        info!(price = %quote.price, change = %quote.change, "Final quote");
    }

    ticker_token.cancel();
    client.teardown().await;
    Ok(())
}
