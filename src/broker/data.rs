// =============================================================================
// Free market data client + historical simulation broker
// =============================================================================
//
// Daily bars come from Stooq's free CSV endpoint; no API key, no account.
// Bars fetched this way are tagged TIER_1_VALIDATION / delayed quality: good
// enough for paper signals, never pretending to be a realtime feed.
//
// The SimulationBroker pairs the free data source with the paper broker and
// a frozen account fixture so the whole stack runs with zero credentials.
// =============================================================================

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use tracing::{debug, warn};

use crate::types::{Bar, BarQuality, DataTier, Side};

use super::{
    Account, BrokerGateway, BrokerOrder, BrokerPosition, Clock, OrderStatusFilter, PaperBroker,
};

/// Free daily-bar data client (Stooq CSV).
#[derive(Clone)]
pub struct FreeDataClient {
    client: reqwest::Client,
    base_url: String,
}

impl FreeDataClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: "https://stooq.com".to_string(),
        }
    }

    /// Fetch up to `limit` most recent daily bars for `symbol`.
    ///
    /// US equities on Stooq carry a `.us` suffix; the symbol is lowercased
    /// and suffixed automatically.
    pub async fn get_daily_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
        let stooq_symbol = format!("{}.us", symbol.to_lowercase());
        let url = format!("{}/q/d/l/?s={}&i=d", self.base_url, stooq_symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("daily bar request failed for {symbol}"))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .context("failed to read daily bar response")?;

        if !status.is_success() {
            bail!("daily bar endpoint returned {status} for {symbol}");
        }

        let mut bars = parse_daily_csv(symbol, &body);
        if bars.len() > limit {
            let excess = bars.len() - limit;
            bars.drain(..excess);
        }

        debug!(symbol, count = bars.len(), "daily bars fetched");
        Ok(bars)
    }
}

impl Default for FreeDataClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse Stooq's `Date,Open,High,Low,Close,Volume` CSV into bars, oldest
/// first. Malformed rows are skipped with a warning, never a failure.
fn parse_daily_csv(symbol: &str, csv: &str) -> Vec<Bar> {
    let mut bars = Vec::new();

    for line in csv.lines().skip(1) {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() < 6 {
            continue;
        }

        let parsed = (|| -> Option<Bar> {
            let date = NaiveDate::parse_from_str(fields[0], "%Y-%m-%d").ok()?;
            let timestamp = Utc
                .from_utc_datetime(&date.and_hms_opt(21, 0, 0)?);
            Some(Bar {
                symbol: symbol.to_string(),
                timestamp,
                timeframe: "1Day".to_string(),
                open: fields[1].parse().ok()?,
                high: fields[2].parse().ok()?,
                low: fields[3].parse().ok()?,
                close: fields[4].parse().ok()?,
                volume: fields[5].parse().unwrap_or(0.0),
                tier: DataTier::Tier1Validation,
                estimated_spread_bps: None,
                quality: BarQuality::Delayed,
            })
        })();

        match parsed {
            Some(bar) if bar.is_valid() => bars.push(bar),
            Some(_) => warn!(symbol, line, "dropping bar violating OHLC invariants"),
            None => warn!(symbol, line, "skipping malformed csv row"),
        }
    }

    bars
}

// =============================================================================
// SimulationBroker
// =============================================================================

/// Paper broker + free historical data + a frozen account fixture.
///
/// The frozen account decouples simulation runs from live balances: equity
/// and last-equity always read the same, while fills still mutate the
/// underlying paper book for order-protocol testing.
pub struct SimulationBroker {
    paper: PaperBroker,
    data: FreeDataClient,
    frozen_account: Account,
}

impl SimulationBroker {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            paper: PaperBroker::new(initial_cash, 10.0, 5.0),
            data: FreeDataClient::new(),
            frozen_account: Account {
                equity: initial_cash,
                last_equity: initial_cash,
                cash: initial_cash,
            },
        }
    }

    pub fn paper(&self) -> &PaperBroker {
        &self.paper
    }

    /// Fetch historical daily bars from the free data source.
    pub async fn get_historical_bars(&self, symbol: &str, limit: usize) -> Result<Vec<Bar>> {
        self.data.get_daily_bars(symbol, limit).await
    }
}

#[async_trait]
impl BrokerGateway for SimulationBroker {
    async fn get_account(&self) -> Result<Account> {
        // Frozen fixture: simulation runs are deterministic in equity.
        Ok(self.frozen_account.clone())
    }

    async fn get_clock(&self) -> Result<Clock> {
        self.paper.get_clock().await
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        self.paper.list_positions().await
    }

    async fn list_orders(
        &self,
        status: OrderStatusFilter,
        limit: usize,
    ) -> Result<Vec<BrokerOrder>> {
        self.paper.list_orders(status, limit).await
    }

    async fn submit_limit_order(
        &self,
        symbol: &str,
        qty: f64,
        side: Side,
        limit_price: f64,
        client_id: &str,
    ) -> Result<BrokerOrder> {
        self.paper
            .submit_limit_order(symbol, qty, side, limit_price, client_id)
            .await
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: Side,
        client_id: &str,
    ) -> Result<BrokerOrder> {
        self.paper
            .submit_market_order(symbol, qty, side, client_id)
            .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.paper.cancel_order(order_id).await
    }

    async fn cancel_all_orders(&self) -> Result<usize> {
        self.paper.cancel_all_orders().await
    }

    async fn close_position(&self, symbol: &str) -> Result<()> {
        self.paper.close_position(symbol).await
    }

    async fn close_all_positions(&self) -> Result<usize> {
        self.paper.close_all_positions().await
    }

    async fn get_order_by_client_id(&self, client_id: &str) -> Result<Option<BrokerOrder>> {
        self.paper.get_order_by_client_id(client_id).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CSV: &str = "\
Date,Open,High,Low,Close,Volume
2025-01-02,100.0,102.0,99.0,101.0,1000000
2025-01-03,101.0,103.0,100.0,102.5,900000
2025-01-06,102.5,104.0,101.0,103.0,1100000
";

    #[test]
    fn parse_valid_csv() {
        let bars = parse_daily_csv("AAPL", SAMPLE_CSV);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].symbol, "AAPL");
        assert_eq!(bars[0].timeframe, "1Day");
        assert_eq!(bars[0].tier, DataTier::Tier1Validation);
        assert!((bars[2].close - 103.0).abs() < 1e-9);
        // Oldest first.
        assert!(bars[0].timestamp < bars[2].timestamp);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let csv = "\
Date,Open,High,Low,Close,Volume
not-a-date,1,2,0.5,1.5,100
2025-01-03,101.0,103.0,100.0,102.5,900000
2025-01-04,abc,103.0,100.0,102.5,900000
";
        let bars = parse_daily_csv("SPY", csv);
        assert_eq!(bars.len(), 1);
        assert!((bars[0].close - 102.5).abs() < 1e-9);
    }

    #[test]
    fn invariant_violating_rows_are_dropped() {
        // High below close.
        let csv = "\
Date,Open,High,Low,Close,Volume
2025-01-02,100.0,100.1,99.0,101.0,1000
";
        let bars = parse_daily_csv("SPY", csv);
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn frozen_account_survives_fills() {
        let sim = SimulationBroker::new(50_000.0);

        sim.submit_limit_order("AAPL", 10.0, Side::Buy, 100.0, "c1")
            .await
            .unwrap();

        let account = sim.get_account().await.unwrap();
        assert!((account.equity - 50_000.0).abs() < 1e-9);
        assert!((account.cash - 50_000.0).abs() < 1e-9);

        // The underlying paper book still moved.
        let positions = sim.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
    }
}
