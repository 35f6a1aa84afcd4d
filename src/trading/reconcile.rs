//! Reconciliation: diff local intent against the exchange's open-order set
//!
//! Any order of ours that is absent from the open set has reached a terminal
//! state; a status query tells us which one. Only this code flips
//! `entry_filled` or closes a position off an exit fill.

use crate::exchange::{ExchangeApi, ExchangeError};
use crate::models::OrderStatus;
use crate::trading::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitLeg {
    TakeProfit,
    StopLoss,
}

/// What one reconciliation pass concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Nothing in flight for this position.
    Idle,
    /// Entry order still resting on the exchange.
    AwaitingEntry,
    /// Entry order filled; position is now open.
    EntryFilled,
    /// Entry order expired or was cancelled before filling.
    EntryExpired,
    /// Exit orders still resting.
    AwaitingExit,
    /// One exit leg filled; position is closed.
    ExitFilled { leg: ExitLeg },
    /// Exit orders vanished without a fill; handles cleared for a retry.
    ExitOrdersLost,
}

pub async fn reconcile(
    exchange: &dyn ExchangeApi,
    symbol: &str,
    position: &mut Position,
) -> Result<Reconciliation, ExchangeError> {
    if position.closed || position.expired {
        return Ok(Reconciliation::Idle);
    }
    let entry_id = match position.entry_order_id {
        Some(id) => id,
        None => return Ok(Reconciliation::Idle),
    };
    if position.entry_filled && position.tp_order_id.is_none() && position.sl_order_id.is_none() {
        return Ok(Reconciliation::Idle);
    }

    let open = exchange.open_orders(symbol).await?;

    if !position.entry_filled {
        if open.contains(&entry_id) {
            return Ok(Reconciliation::AwaitingEntry);
        }
        // entry left the open set; ask what happened to it
        let report = exchange.order_status(symbol, entry_id).await?;
        return Ok(match report.status {
            OrderStatus::Filled => {
                position.record_entry_fill(report.avg_price, report.update_time);
                Reconciliation::EntryFilled
            }
            OrderStatus::Expired | OrderStatus::Cancelled => {
                position.mark_expired();
                Reconciliation::EntryExpired
            }
            OrderStatus::New | OrderStatus::PartiallyFilled => Reconciliation::AwaitingEntry,
        });
    }

    let tp_gone = position
        .tp_order_id
        .map(|id| !open.contains(&id))
        .unwrap_or(false);
    let sl_gone = position
        .sl_order_id
        .map(|id| !open.contains(&id))
        .unwrap_or(false);

    if !tp_gone && !sl_gone {
        return Ok(Reconciliation::AwaitingExit);
    }

    if tp_gone {
        if let Some(id) = position.tp_order_id {
            let report = exchange.order_status(symbol, id).await?;
            if report.status == OrderStatus::Filled {
                position.record_exit(report.avg_price, report.update_time);
                return Ok(Reconciliation::ExitFilled {
                    leg: ExitLeg::TakeProfit,
                });
            }
        }
    }
    if sl_gone {
        if let Some(id) = position.sl_order_id {
            let report = exchange.order_status(symbol, id).await?;
            if report.status == OrderStatus::Filled {
                position.record_exit(report.avg_price, report.update_time);
                return Ok(Reconciliation::ExitFilled {
                    leg: ExitLeg::StopLoss,
                });
            }
        }
    }

    // exit orders died without filling; clear the handles so the closing
    // engine can place a fresh bracket
    position.clear_exit_orders();
    Ok(Reconciliation::ExitOrdersLost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::models::{OrderSide, SymbolInfo};
    use crate::signal::PositionDraft;
    use chrono::Utc;

    fn btc_info() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            margin_asset: "USDT".to_string(),
            price_precision: 2,
            quantity_precision: 3,
        }
    }

    fn pending_position(side: OrderSide) -> Position {
        Position::from_draft(
            &PositionDraft {
                side,
                volume: 2.0,
                reference_price: 100.0,
                time: Utc::now(),
                trigger_offset: 2.0,
                leverage: 5,
            },
            2,
        )
    }

    #[tokio::test]
    async fn test_idle_without_entry_order() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        let mut pos = pending_position(OrderSide::Long);
        let outcome = reconcile(&paper, "BTCUSDT", &mut pos).await.unwrap();
        assert_eq!(outcome, Reconciliation::Idle);
    }

    #[tokio::test]
    async fn test_entry_fill_recorded_from_exchange_report() {
        let paper = PaperExchange::new(btc_info(), 100.0, 100.0);
        paper.hold_entry_fills(true);
        let ack = paper
            .submit_market_order("BTCUSDT", OrderSide::Long, 2.0)
            .await
            .unwrap();

        let mut pos = pending_position(OrderSide::Long);
        pos.entry_order_id = Some(ack.order_id);
        pos.entry_client_order_id = Some(ack.client_order_id);

        let outcome = reconcile(&paper, "BTCUSDT", &mut pos).await.unwrap();
        assert_eq!(outcome, Reconciliation::AwaitingEntry);
        assert!(!pos.entry_filled);

        // fills at 101, not the requested 100
        paper.tick(101.0);
        paper.fill_order(ack.order_id);

        let outcome = reconcile(&paper, "BTCUSDT", &mut pos).await.unwrap();
        assert_eq!(outcome, Reconciliation::EntryFilled);
        assert!(pos.entry_filled);
        assert_eq!(pos.entry_price, 101.0);
        assert_eq!(pos.take_profit, 103.0);
        assert_eq!(pos.stop_loss, 99.0);
    }

    #[tokio::test]
    async fn test_expired_entry_marks_position_expired() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        paper.hold_entry_fills(true);
        let ack = paper
            .submit_market_order("BTCUSDT", OrderSide::Long, 2.0)
            .await
            .unwrap();

        let mut pos = pending_position(OrderSide::Long);
        pos.entry_order_id = Some(ack.order_id);
        paper.expire_order(ack.order_id);

        let outcome = reconcile(&paper, "BTCUSDT", &mut pos).await.unwrap();
        assert_eq!(outcome, Reconciliation::EntryExpired);
        assert!(pos.expired);
    }

    #[tokio::test]
    async fn test_stop_loss_fill_closes_with_signed_profit() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        let entry = paper
            .submit_market_order("BTCUSDT", OrderSide::Long, 2.0)
            .await
            .unwrap();
        let tp = paper
            .submit_take_profit_market("BTCUSDT", OrderSide::Short, 2.0, 102.0)
            .await
            .unwrap();
        let sl = paper
            .submit_stop_market("BTCUSDT", OrderSide::Short, 2.0, 98.0)
            .await
            .unwrap();

        let mut pos = pending_position(OrderSide::Long);
        pos.entry_order_id = Some(entry.order_id);
        pos.record_entry_fill(100.0, Utc::now());
        pos.tp_order_id = Some(tp.order_id);
        pos.sl_order_id = Some(sl.order_id);

        let outcome = reconcile(&paper, "BTCUSDT", &mut pos).await.unwrap();
        assert_eq!(outcome, Reconciliation::AwaitingExit);

        paper.tick(97.0);
        let outcome = reconcile(&paper, "BTCUSDT", &mut pos).await.unwrap();
        assert_eq!(
            outcome,
            Reconciliation::ExitFilled {
                leg: ExitLeg::StopLoss
            }
        );
        assert!(pos.closed);
        assert_eq!(pos.exit_price, Some(98.0));
        assert_eq!(pos.profit, Some(-4.0)); // (98 - 100) * 2
    }

    #[tokio::test]
    async fn test_lost_exit_orders_reset_to_open() {
        let paper = PaperExchange::new(btc_info(), 1000.0, 100.0);
        let entry = paper
            .submit_market_order("BTCUSDT", OrderSide::Long, 2.0)
            .await
            .unwrap();
        let tp = paper
            .submit_take_profit_market("BTCUSDT", OrderSide::Short, 2.0, 102.0)
            .await
            .unwrap();
        let sl = paper
            .submit_stop_market("BTCUSDT", OrderSide::Short, 2.0, 98.0)
            .await
            .unwrap();

        let mut pos = pending_position(OrderSide::Long);
        pos.entry_order_id = Some(entry.order_id);
        pos.record_entry_fill(100.0, Utc::now());
        pos.tp_order_id = Some(tp.order_id);
        pos.sl_order_id = Some(sl.order_id);

        // both legs cancelled externally, neither filled
        paper.cancel_order(tp.order_id);
        paper.cancel_order(sl.order_id);

        let outcome = reconcile(&paper, "BTCUSDT", &mut pos).await.unwrap();
        assert_eq!(outcome, Reconciliation::ExitOrdersLost);
        assert!(!pos.closed);
        assert!(pos.tp_order_id.is_none());
        assert!(pos.sl_order_id.is_none());
        assert_eq!(
            pos.state(),
            crate::trading::position::PositionState::Open
        );
    }
}
