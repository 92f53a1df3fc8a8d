use crate::trade::{TradeRecord, TradeStatus};
use broker_trait::{BrokerAdapter, Direction};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Smart-exit settings, part of the bot's per-account configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SmartExitConfig {
    pub enabled: bool,
    pub min_rr: Decimal,
    pub drawdown_percent: Decimal,
}

/// One notable thing that happened to a trade this supervision pass. The
/// bot turns these into log-ring entries and, where noted, notifications;
/// this crate has no opinion on how they're surfaced.
#[derive(Debug, Clone)]
pub enum SupervisionEvent {
    ReconciledClosed {
        symbol: String,
        exit_price: Option<Decimal>,
        profit_loss: Option<Decimal>,
    },
    BreakEvenPromoted {
        symbol: String,
        new_stop_loss: Decimal,
    },
    TrailingStopUpdated {
        symbol: String,
        new_stop_loss: Decimal,
    },
    SmartExitClosed {
        symbol: String,
        exit_price: Option<Decimal>,
        profit_loss: Option<Decimal>,
    },
    Error {
        symbol: String,
        message: String,
    },
}

fn signed_pnl(trade: &TradeRecord, exit_price: Decimal) -> Decimal {
    let diff = match trade.direction {
        Direction::Long => exit_price - trade.entry_price,
        Direction::Short => trade.entry_price - exit_price,
    };
    diff * trade.units
}

/// Exit prices come from a best-effort `current_price` call made after the
/// broker already reports the position gone, so they never land exactly on
/// `take_profit`/`stop_loss`. A close within this fraction of the initial
/// risk distance of a level counts as having hit that level.
const CLOSE_PROXIMITY_RATIO: Decimal = Decimal::from_parts(10, 0, 0, false, 2);

/// Classifies a broker-side close the bot didn't request itself: did price
/// land near the take-profit, near the (possibly trailed/break-even) stop,
/// or neither. Falls back to `ClosedManual` when the exit price is unknown
/// or doesn't sit near either level.
fn classify_close(trade: &TradeRecord, exit_price: Option<Decimal>) -> TradeStatus {
    let Some(price) = exit_price else {
        return TradeStatus::ClosedManual;
    };

    let tolerance = trade.initial_risk_distance() * CLOSE_PROXIMITY_RATIO;
    if tolerance.is_zero() {
        return TradeStatus::ClosedManual;
    }

    let hit_take_profit = match trade.direction {
        Direction::Long => price >= trade.take_profit - tolerance,
        Direction::Short => price <= trade.take_profit + tolerance,
    };
    if hit_take_profit {
        return TradeStatus::ClosedTp;
    }

    let hit_stop = match trade.direction {
        Direction::Long => price <= trade.stop_loss + tolerance,
        Direction::Short => price >= trade.stop_loss - tolerance,
    };
    if hit_stop {
        return if trade.is_break_even {
            TradeStatus::ClosedBe
        } else {
            TradeStatus::ClosedSl
        };
    }

    TradeStatus::ClosedManual
}

/// Drops any trade whose canonical symbol the broker no longer reports as
/// an open position, marking it closed with a best-effort exit price and
/// moving it out of `trades`. Returns the closed records alongside the
/// events describing them.
pub async fn reconcile(
    broker: &dyn BrokerAdapter,
    trades: &mut Vec<TradeRecord>,
) -> (Vec<TradeRecord>, Vec<SupervisionEvent>) {
    let mut events = Vec::new();
    let mut closed = Vec::new();

    let broker_positions = match broker.positions().await {
        Ok(positions) => positions,
        Err(err) => {
            events.push(SupervisionEvent::Error {
                symbol: "*".to_string(),
                message: format!("reconciliation: positions() failed: {err}"),
            });
            return (closed, events);
        }
    };
    let broker_symbols: HashSet<&str> = broker_positions.iter().map(|p| p.symbol.as_str()).collect();

    let mut remaining = Vec::with_capacity(trades.len());
    for mut trade in trades.drain(..) {
        if !trade.status.is_open() || broker_symbols.contains(trade.symbol.as_str()) {
            remaining.push(trade);
            continue;
        }

        let exit_price = match broker.current_price(&trade.symbol).await {
            Ok(tick) => Some(tick.mid()),
            Err(_) => None,
        };
        let profit_loss = exit_price.map(|p| signed_pnl(&trade, p));

        trade.status = classify_close(&trade, exit_price);
        trade.exit_timestamp = Some(Utc::now());
        trade.exit_price = exit_price;
        trade.profit_loss = profit_loss;

        events.push(SupervisionEvent::ReconciledClosed {
            symbol: trade.symbol.clone(),
            exit_price,
            profit_loss,
        });
        closed.push(trade);
    }
    *trades = remaining;
    (closed, events)
}

/// Runs break-even promotion, trailing stop and smart exit for a single
/// open trade against its current price. Updates `trade` in place
/// and returns any events plus whether the trade was closed by smart
/// exit (callers should drop it from the open set when true).
pub async fn manage_one(
    broker: &dyn BrokerAdapter,
    trade: &mut TradeRecord,
    current: Decimal,
    pip_size: Decimal,
    smart_exit: &SmartExitConfig,
) -> (Vec<SupervisionEvent>, bool) {
    let mut events = Vec::new();

    trade.update_extreme_price(current);
    trade.update_max_favorable_rr();

    if !trade.is_break_even && trade.crosses_break_even(current) {
        match broker
            .modify_position(&trade.symbol, Some(trade.entry_price), None)
            .await
        {
            Ok(true) => {
                trade.stop_loss = trade.entry_price;
                trade.is_break_even = true;
                events.push(SupervisionEvent::BreakEvenPromoted {
                    symbol: trade.symbol.clone(),
                    new_stop_loss: trade.stop_loss,
                });
            }
            Ok(false) => events.push(SupervisionEvent::Error {
                symbol: trade.symbol.clone(),
                message: "break-even modify_position declined".to_string(),
            }),
            Err(err) => events.push(SupervisionEvent::Error {
                symbol: trade.symbol.clone(),
                message: format!("break-even modify_position failed: {err}"),
            }),
        }
    }

    if trade.is_break_even {
        if let Some(candidate) = trade.trailing_candidate(current, pip_size) {
            match broker
                .modify_position(&trade.symbol, Some(candidate), None)
                .await
            {
                Ok(true) => {
                    trade.stop_loss = candidate;
                    events.push(SupervisionEvent::TrailingStopUpdated {
                        symbol: trade.symbol.clone(),
                        new_stop_loss: candidate,
                    });
                }
                Ok(false) => {}
                Err(err) => events.push(SupervisionEvent::Error {
                    symbol: trade.symbol.clone(),
                    message: format!("trailing modify_position failed: {err}"),
                }),
            }
        }
    }

    let mut closed = false;
    if smart_exit.enabled && trade.is_break_even && trade.max_favorable_rr >= smart_exit.min_rr {
        let risk = trade.initial_risk_distance();
        let best_favorable_move = trade.favorable_move(trade.extreme_price);
        let favorable_move_now = trade.favorable_move(current);
        if !risk.is_zero() && favorable_move_now > Decimal::ZERO && best_favorable_move > Decimal::ZERO {
            let drawdown_ratio = (best_favorable_move - favorable_move_now) / best_favorable_move;
            let threshold = smart_exit.drawdown_percent / Decimal::from(100);
            if drawdown_ratio >= threshold {
                let mut result = broker.close_position(&trade.symbol, None).await;
                if !matches!(
                    result.status,
                    broker_trait::OrderStatus::Filled | broker_trait::OrderStatus::PartiallyFilled
                ) {
                    // Retry once without an explicit size,
                    result = broker.close_position(&trade.symbol, None).await;
                }
                if matches!(
                    result.status,
                    broker_trait::OrderStatus::Filled | broker_trait::OrderStatus::PartiallyFilled
                ) {
                    let exit_price = result.filled_price.or(Some(current));
                    let profit_loss = exit_price.map(|p| signed_pnl(trade, p));
                    trade.status = TradeStatus::ClosedSmartExit;
                    trade.exit_timestamp = Some(Utc::now());
                    trade.exit_price = exit_price;
                    trade.profit_loss = profit_loss;
                    closed = true;
                    events.push(SupervisionEvent::SmartExitClosed {
                        symbol: trade.symbol.clone(),
                        exit_price,
                        profit_loss,
                    });
                } else {
                    events.push(SupervisionEvent::Error {
                        symbol: trade.symbol.clone(),
                        message: result
                            .error_message
                            .unwrap_or_else(|| "smart exit close_position failed".to_string()),
                    });
                }
            }
        }
    }

    (events, closed)
}

/// Runs a full supervision pass: reconcile first, then manage every
/// surviving open trade against its current price. Best-effort end to
/// end — a per-trade failure is logged as an [`SupervisionEvent::Error`]
/// and never aborts the pass for the rest of the set.
pub async fn supervise(
    broker: &dyn BrokerAdapter,
    trades: &mut Vec<TradeRecord>,
    pip_size_of: impl Fn(&str) -> Decimal,
    smart_exit: &SmartExitConfig,
) -> (Vec<TradeRecord>, Vec<SupervisionEvent>) {
    let (mut closed, mut events) = reconcile(broker, trades).await;

    let mut still_open = Vec::with_capacity(trades.len());
    for mut trade in trades.drain(..) {
        if !trade.status.is_open() {
            still_open.push(trade);
            continue;
        }
        let current = match broker.current_price(&trade.symbol).await {
            Ok(tick) => tick.mid(),
            Err(err) => {
                events.push(SupervisionEvent::Error {
                    symbol: trade.symbol.clone(),
                    message: format!("current_price failed: {err}"),
                });
                still_open.push(trade);
                continue;
            }
        };
        let pip_size = pip_size_of(&trade.symbol);
        let (trade_events, was_closed) =
        manage_one(broker, &mut trade, current, pip_size, smart_exit).await;
        events.extend(trade_events);
        if was_closed {
            closed.push(trade);
        } else {
            still_open.push(trade);
        }
    }
    *trades = still_open;
    (closed, events)
}
