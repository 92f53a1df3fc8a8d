use crate::defaults::{default_margin_per_lot, default_pip_value_per_lot};
use crate::exposure::ExposureState;
use broker_trait::{BrokerAdapter, Direction, OrderRequest, OrderStatus, RejectKind, Side};
use instrument_identity::{decimals, pip_size, PriceGuard, PriceSample};
use position_supervisor::{TradeRecord, TradeStatus};
use risk_evaluator::RiskEvaluator;
use rust_decimal::Decimal;

const MAX_SUBMIT_ATTEMPTS: u32 = 6;

/// Per-bot risk/geometry settings the pipeline needs on every call.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub min_risk_reward: Decimal,
    pub max_risk_reward: Decimal,
    pub risk_per_trade_percent: Decimal,
}

/// A candidate trade handed down from the consensus aggregator, still
/// unvalidated against broker reality.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub canonical_symbol: String,
    pub direction: Direction,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub break_even_trigger: Option<Decimal>,
    pub trailing_stop_pips: Option<Decimal>,
    pub confidence: f64,
    pub timeframes_analyzed: u32,
    pub models_agreed: u32,
    pub total_models: u32,
}

/// Account figures the sizing/hard-cap stages need; refreshed by the
/// caller from the broker's `account_info()` before each submission.
#[derive(Debug, Clone, Copy)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub margin_available: Decimal,
    pub leverage: Decimal,
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Filled(Box<TradeRecord>),
    Rejected { stage: &'static str, reason: String },
}

fn reject(stage: &'static str, reason: impl Into<String>) -> PipelineOutcome {
    let reason = reason.into();
    tracing::info!(stage, %reason, "order pipeline rejected");
    PipelineOutcome::Rejected { stage, reason }
}

/// Runs the full ordered pipeline for one proposal: exposure gate,
/// tradability, tick plausibility, geometry fix, R:R clamp, broker spec
/// fetch, broker-minimum enforcement, position sizing, hard caps, submit
/// with adaptive retry, and the post-fill protection check.
pub async fn submit_trade(
    broker: &dyn BrokerAdapter,
    price_guard: &PriceGuard,
    risk: &RiskEvaluator,
    exposure: &ExposureState,
    account: AccountSnapshot,
    cfg: &PipelineConfig,
    proposal: TradeProposal,
) -> PipelineOutcome {
    // 1. Exposure gate.
    if let Err(reason) = exposure.allows(&proposal.canonical_symbol) {
        return reject("exposure_gate", reason);
    }

    // 2. Tradability gate.
    let side: Side = proposal.direction.into();
    let tradability = broker.can_trade_symbol(&proposal.canonical_symbol, side).await;
    if !tradability.tradable {
        return reject("tradability_gate", tradability.reason);
    }
    let resolved_symbol = tradability.resolved_symbol;

    // 3. Tick fetch + price plausibility.
    let tick = match broker.current_price(&proposal.canonical_symbol).await {
        Ok(tick) => tick,
        Err(err) => return reject("tick_fetch", err.to_string()),
    };
    let sample = PriceSample {
        bid: tick.bid,
        ask: tick.ask,
        at: tick.ts,
    };
    if let Err(err) = price_guard.check(&proposal.canonical_symbol, sample) {
        return reject("tick_plausibility", err.to_string());
    }
    let entry = tick.mid();

    // 4. Geometry fix.
    let (mut sl, mut tp) = risk.fix_geometry(
        proposal.direction,
        entry,
        proposal.stop_loss,
        proposal.take_profit,
        cfg.min_risk_reward,
    );

    // 5. Risk-reward clamp.
    tp = risk.clamp_risk_reward(
        proposal.direction,
        entry,
        sl,
        tp,
        cfg.min_risk_reward,
        cfg.max_risk_reward,
    );

    // 6. Broker spec fetch.
    let spec = broker
        .symbol_spec(&proposal.canonical_symbol)
        .await
        .unwrap_or_default();
    let point_size = spec
        .point_size
        .unwrap_or_else(|| pip_size(&proposal.canonical_symbol) / Decimal::from(10));

    // 7. Broker-minimum enforcement.
    let spread = (tick.ask - tick.bid).abs();
    let min_distance = risk.min_stop_distance(
        spec.stops_level.unwrap_or(Decimal::ZERO),
        spec.freeze_level.unwrap_or(Decimal::ZERO),
        spread,
        point_size,
        Decimal::from(1),
    );
    let reference_price = match proposal.direction {
        Direction::Long => tick.bid,
        Direction::Short => tick.ask,
    };
    let (new_sl, new_tp, adjusted) =
    risk.enforce_broker_minimum(proposal.direction, reference_price, sl, tp, min_distance, point_size);
    if adjusted {
        tracing::debug!(symbol = %proposal.canonical_symbol, "broker minimum stop distance enforced");
    }
    sl = new_sl;
    tp = new_tp;

    // 8. Position sizing.
    let pip_size_value = pip_size(&proposal.canonical_symbol);
    let pip_value_per_lot = match (spec.tick_value, spec.tick_size) {
        (Some(tick_value), Some(tick_size)) if !tick_size.is_zero() => {
            tick_value * pip_size_value / tick_size
        }
        _ => default_pip_value_per_lot(&proposal.canonical_symbol),
    };
    let min_lot = spec.min_volume.unwrap_or_else(|| Decimal::new(1, 2));
    let volume_step = spec.volume_step.unwrap_or_else(|| Decimal::new(1, 2));

    let sl_distance = (entry - sl).abs();
    let sizing = risk.calculate_position_size(
        account.balance,
        cfg.risk_per_trade_percent,
        sl_distance,
        pip_size_value,
        pip_value_per_lot,
        min_lot,
        volume_step,
    );
    if sizing.stop_tightened {
        let new_sl_distance = sizing.sl_pips * pip_size_value;
        let original_rr = if sl_distance.is_zero() {
            Decimal::ZERO
        } else {
            (tp - entry).abs() / sl_distance
        };
        sl = match proposal.direction {
            Direction::Long => entry - new_sl_distance,
            Direction::Short => entry + new_sl_distance,
        };
        tp = match proposal.direction {
            Direction::Long => entry + new_sl_distance * original_rr,
            Direction::Short => entry - new_sl_distance * original_rr,
        };
    }

    // 9. Hard caps.
    let margin_per_lot = spec
        .contract_size
        .filter(|_| !account.leverage.is_zero())
        .map(|contract_size| contract_size * entry / account.leverage)
        .unwrap_or_else(|| default_margin_per_lot(&proposal.canonical_symbol));
    let mut lot = match risk.apply_hard_caps(sizing.lot_size, account.margin_available, margin_per_lot, min_lot) {
        Ok(lot) => lot,
        Err(err) => return reject("hard_caps", err.to_string()),
    };

    // 10. Submit with adaptive retry.
    let mut retry_multiplier = Decimal::from(1);
    let mut transient_retry_used = false;
    let decimals_for_symbol = decimals(&proposal.canonical_symbol);

    for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
        let request = OrderRequest {
            symbol: resolved_symbol.clone(),
            side,
            volume: lot,
            stop_loss: Some(sl.round_dp(decimals_for_symbol)),
            take_profit: Some(tp.round_dp(decimals_for_symbol)),
            client_order_id: None,
        };
        let result = broker.place_order(request).await;
        tracing::debug!(
            attempt,
            symbol = %proposal.canonical_symbol,
            status = ?result.status,
            "order pipeline submit attempt"
        );

        match result.status {
            OrderStatus::Filled | OrderStatus::PartiallyFilled => {
                if result.reject_kind == Some(RejectKind::ProtectionNotSet) {
                    // 11. Post-fill protection check.
                    match broker
                        .modify_position(&proposal.canonical_symbol, Some(sl), Some(tp))
                        .await
                    {
                        Ok(true) => {}
                        _ => {
                            tracing::error!(
                                symbol = %proposal.canonical_symbol,
                                "protection not set after fill and modify_position failed; closing for safety"
                            );
                            let _ = broker.close_position(&proposal.canonical_symbol, None).await;
                            return reject(
                                "post_fill_protection",
                                "protection could not be set; position closed for safety",
                            );
                        }
                    }
                }

                let filled_volume = result.filled_volume.unwrap_or(lot);
                let filled_price = result.filled_price.unwrap_or(entry);
                let trade = TradeRecord {
                    id: result.order_id.unwrap_or_default(),
                    symbol: proposal.canonical_symbol.clone(),
                    direction: proposal.direction,
                    entry_price: filled_price,
                    initial_stop_loss: sl,
                    stop_loss: sl,
                    take_profit: tp,
                    units: filled_volume,
                    opened_at: chrono::Utc::now(),
                    confidence: proposal.confidence,
                    timeframes_analyzed: proposal.timeframes_analyzed,
                    models_agreed: proposal.models_agreed,
                    total_models: proposal.total_models,
                    status: TradeStatus::Open,
                    exit_price: None,
                    exit_timestamp: None,
                    profit_loss: None,
                    break_even_trigger: proposal.break_even_trigger,
                    trailing_stop_pips: proposal.trailing_stop_pips,
                    partial_tp_percent: None,
                    is_break_even: false,
                    extreme_price: filled_price,
                    max_favorable_rr: Decimal::ZERO,
                };
                return PipelineOutcome::Filled(Box::new(trade));
            }
            OrderStatus::Rejected => match result.reject_kind {
                Some(RejectKind::NoMoney) => {
                    lot = (lot * Decimal::new(75, 2)).round_dp(2);
                    if lot < min_lot {
                        return reject("submit", "lot reduced below minimum after NO_MONEY");
                    }
                }
                Some(RejectKind::InvalidStops) => {
                    retry_multiplier = Decimal::from(1) + Decimal::new(35, 2) * Decimal::from(attempt);
                    let widened = risk.min_stop_distance(
                        spec.stops_level.unwrap_or(Decimal::ZERO),
                        spec.freeze_level.unwrap_or(Decimal::ZERO),
                        spread,
                        point_size,
                        retry_multiplier,
                    );
                    let (widened_sl, widened_tp, changed) = risk.enforce_broker_minimum(
                        proposal.direction,
                        reference_price,
                        sl,
                        tp,
                        widened,
                        point_size,
                    );
                    if changed {
                        sl = widened_sl;
                        tp = widened_tp;
                    } else {
                        let ramp = Decimal::new(15, 4) + Decimal::new(7, 4) * Decimal::from(attempt);
                        let price_term = entry * ramp.min(Decimal::new(8, 3));
                        let fallback_floor = (pip_size_value * Decimal::from(12)).max(price_term);
                        sl = match proposal.direction {
                            Direction::Long => reference_price - fallback_floor,
                            Direction::Short => reference_price + fallback_floor,
                        };
                    }
                    let new_sl_distance = (entry - sl).abs();
                    tp = risk.clamp_risk_reward(
                        proposal.direction,
                        entry,
                        sl,
                        match proposal.direction {
                            Direction::Long => entry + new_sl_distance * cfg.min_risk_reward,
                            Direction::Short => entry - new_sl_distance * cfg.min_risk_reward,
                        },
                        cfg.min_risk_reward,
                        cfg.max_risk_reward,
                    );
                }
                Some(RejectKind::InvalidFilling)
                | Some(RejectKind::Connection)
                | Some(RejectKind::Timeout)
                | Some(RejectKind::Unknown)
                if !transient_retry_used =>
                {
                    transient_retry_used = true;
                }
                _ => {
                    return reject(
                        "submit",
                        result
                            .error_message
                            .unwrap_or_else(|| "order rejected".to_string()),
                    );
                }
            },
            OrderStatus::Pending | OrderStatus::Cancelled => {
                return reject(
                    "submit",
                    result
                        .error_message
                        .unwrap_or_else(|| format!("unexpected order status {:?}", result.status)),
                );
            }
        }
    }

    reject("submit", "exhausted adaptive retry attempts")
}
