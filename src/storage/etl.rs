// =============================================================================
// ETL pipeline — batch drain of the append log into the column store
// =============================================================================
//
// Exactly-once delivery is NOT guaranteed and does not need to be: every
// column-store write is an upsert keyed by a natural key, so replaying a
// batch after a crash is idempotent.
//
// The event -> row mapping is a closed dispatch table by event kind. Kinds
// with no table mapping are skipped with a counter increment, never an error.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{debug, error, info};

use crate::events::{Event, EventKind};
use crate::storage::column_store::{ColumnStore, SentimentRow, TradeRow};
use crate::storage::AppendLog;
use crate::types::{Bar, BarQuality, DataTier};

/// Summary of one ETL batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EtlSummary {
    pub events_processed: usize,
    pub bars_inserted: usize,
    pub sentiment_inserted: usize,
    pub trades_inserted: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Batch pipeline from the append log into the column store.
pub struct EtlPipeline {
    log: Arc<AppendLog>,
    store: Arc<ColumnStore>,
    batch_interval: Duration,
    max_batch_size: usize,
    /// Byte offset of the next unread line in the active log file.
    cursor: AtomicU64,
}

impl EtlPipeline {
    pub fn new(
        log: Arc<AppendLog>,
        store: Arc<ColumnStore>,
        batch_interval_secs: u64,
        max_batch_size: usize,
    ) -> Self {
        info!(
            batch_interval_secs,
            max_batch_size, "etl pipeline initialised"
        );
        Self {
            log,
            store,
            batch_interval: Duration::from_secs(batch_interval_secs),
            max_batch_size,
            cursor: AtomicU64::new(0),
        }
    }

    /// Drain one batch of new events. Errors on individual events are
    /// counted, logged, and never abort the batch.
    pub fn run_once(&self) -> Result<EtlSummary> {
        let mut summary = EtlSummary::default();

        let offset = self.cursor.load(Ordering::Acquire);
        let (events, new_offset) = self.log.read_from(offset, self.max_batch_size)?;
        self.cursor.store(new_offset, Ordering::Release);

        if events.is_empty() {
            return Ok(summary);
        }

        let mut bars: Vec<Bar> = Vec::new();
        let mut sentiment: Vec<SentimentRow> = Vec::new();
        let mut trades: Vec<TradeRow> = Vec::new();

        for event in &events {
            match event.event_type {
                EventKind::Bar => match Self::event_to_bar(event) {
                    Some(bar) => {
                        bars.push(bar);
                        summary.events_processed += 1;
                    }
                    None => summary.errors += 1,
                },
                EventKind::Sentiment => match Self::event_to_sentiment(event) {
                    Some(row) => {
                        sentiment.push(row);
                        summary.events_processed += 1;
                    }
                    None => summary.errors += 1,
                },
                EventKind::OrderFilled => match Self::event_to_trade(event) {
                    Some(row) => {
                        trades.push(row);
                        summary.events_processed += 1;
                    }
                    None => summary.errors += 1,
                },
                // Everything else is audit-only: no analytical table.
                _ => summary.skipped += 1,
            }
        }

        if !bars.is_empty() {
            match self.store.insert_bars(&bars) {
                Ok(count) => summary.bars_inserted = count,
                Err(e) => {
                    error!(error = %e, "bar insert failed");
                    summary.errors += bars.len();
                }
            }
        }
        if !sentiment.is_empty() {
            match self.store.insert_sentiment(&sentiment) {
                Ok(count) => summary.sentiment_inserted = count,
                Err(e) => {
                    error!(error = %e, "sentiment insert failed");
                    summary.errors += sentiment.len();
                }
            }
        }
        for trade in &trades {
            match self.store.insert_trade(trade) {
                Ok(()) => summary.trades_inserted += 1,
                Err(e) => {
                    error!(error = %e, trade_id = %trade.trade_id, "trade insert failed");
                    summary.errors += 1;
                }
            }
        }

        debug!(
            events = summary.events_processed,
            bars = summary.bars_inserted,
            sentiment = summary.sentiment_inserted,
            trades = summary.trades_inserted,
            skipped = summary.skipped,
            errors = summary.errors,
            "etl batch complete"
        );

        Ok(summary)
    }

    /// Run forever, sleeping the configured interval between batches.
    /// Errors log and back off; the next batch repairs state.
    pub async fn run_continuously(self: Arc<Self>) {
        info!("etl pipeline running continuously");
        loop {
            if let Err(e) = self.run_once() {
                error!(error = %e, "etl batch error");
            }
            tokio::time::sleep(self.batch_interval).await;
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch table rows
    // -------------------------------------------------------------------------

    fn event_to_bar(event: &Event) -> Option<Bar> {
        let data = &event.data;
        Some(Bar {
            symbol: event.symbol.clone()?,
            timestamp: event.timestamp,
            timeframe: data
                .get("timeframe")
                .and_then(|v| v.as_str())
                .unwrap_or("1Day")
                .to_string(),
            tier: data
                .get("tier")
                .and_then(|v| v.as_str())
                .and_then(DataTier::parse)
                .unwrap_or(DataTier::Tier1Validation),
            open: data.get("open")?.as_f64()?,
            high: data.get("high")?.as_f64()?,
            low: data.get("low")?.as_f64()?,
            close: data.get("close")?.as_f64()?,
            volume: data.get("volume")?.as_f64()?,
            estimated_spread_bps: data.get("estimated_spread_bps").and_then(|v| v.as_f64()),
            quality: BarQuality::Delayed,
        })
    }

    fn event_to_sentiment(event: &Event) -> Option<SentimentRow> {
        let data = &event.data;
        Some(SentimentRow {
            symbol: event.symbol.clone()?,
            timestamp: event.timestamp,
            source: event.source.clone(),
            score: data.get("score")?.as_f64()?,
            volume: data.get("volume").and_then(|v| v.as_i64()),
        })
    }

    fn event_to_trade(event: &Event) -> Option<TradeRow> {
        let data = &event.data;
        Some(TradeRow {
            trade_id: event.event_id.clone(),
            order_id: data
                .get("order_id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            client_order_id: event.correlation_id.clone(),
            symbol: event.symbol.clone()?,
            timestamp: event.timestamp,
            side: data.get("side")?.as_str()?.to_string(),
            qty: data.get("filled_qty")?.as_f64()?,
            price: data.get("filled_price")?.as_f64()?,
            strategy_id: data
                .get("strategy_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            signal_id: data
                .get("signal_id")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }
}
