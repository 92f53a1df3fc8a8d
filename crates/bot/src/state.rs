use chrono::{DateTime, Utc};
use position_supervisor::TradeRecord;
use risk_evaluator::DailyCounters;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const MAX_LOG_ENTRIES: usize = 500;
const MAX_ERROR_ENTRIES: usize = 16;
const STATUS_LOG_TAIL: usize = 30;
const STATUS_ERROR_TAIL: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Stopped,
    Starting,
    Running,
    Paused,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    Info,
    Analysis,
    Trade,
    Skip,
    Error,
    News,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub symbol: Option<String>,
    pub kind: LogKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// A ring that only ever appends and evicts the oldest entry past capacity
/// — nothing is ever rewritten after it lands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRing {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogRing {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn last(&self, n: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trade/analysis counters reset at UTC midnight by the caller; the bot
/// itself never schedules the reset, `reset()` and day-boundary detection
/// are the manager's/orchestrator's job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TodayCounters {
    pub analyses: u32,
    pub trades: u32,
    pub realized_pnl_percent: Decimal,
    pub consecutive_losses: u32,
    pub drawdown_from_peak_percent: Decimal,
}

impl TodayCounters {
    pub fn to_daily_counters(self, manually_halted: bool) -> DailyCounters {
        DailyCounters {
            trades_today: self.trades,
            realized_pnl_percent_today: self.realized_pnl_percent,
            consecutive_losses: self.consecutive_losses,
            drawdown_from_peak_percent: self.drawdown_from_peak_percent,
            manually_halted,
        }
    }

    pub fn record_closed_trade(&mut self, profit_loss: Decimal, account_balance: Decimal) {
        self.trades += 1;
        if !account_balance.is_zero() {
            self.realized_pnl_percent += profit_loss / account_balance * Decimal::from(100);
        }
        if profit_loss.is_sign_negative() {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
        if self.realized_pnl_percent.is_sign_negative() {
            let drawdown = -self.realized_pnl_percent;
            if drawdown > self.drawdown_from_peak_percent {
                self.drawdown_from_peak_percent = drawdown;
            }
        }
    }
}

/// The whole in-memory state of one running bot. Never persisted here
/// directly — the manager/orchestrator layer is responsible for any
/// durable snapshotting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub status: LifecycleStatus,
    pub manually_halted: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub today: TodayCounters,
    pub open_trades: Vec<TradeRecord>,
    pub completed_trades: VecDeque<TradeRecord>,
    pub logs: LogRing,
    pub errors: LogRing,
    pub last_error: Option<String>,
    /// Completed ticks since the current `start()`, used to gate heartbeat
    /// notifications. Reset to zero on every `start()`.
    pub cycles_completed: u32,
}

const MAX_COMPLETED_TRADES: usize = 200;

impl Default for BotState {
    fn default() -> Self {
        Self {
            status: LifecycleStatus::Stopped,
            manually_halted: false,
            started_at: None,
            last_analysis_at: None,
            today: TodayCounters::default(),
            open_trades: Vec::new(),
            completed_trades: VecDeque::new(),
            logs: LogRing::bounded(MAX_LOG_ENTRIES),
            errors: LogRing::bounded(MAX_ERROR_ENTRIES),
            last_error: None,
            cycles_completed: 0,
        }
    }
}

impl BotState {
    pub fn log(&mut self, kind: LogKind, symbol: Option<String>, message: impl Into<String>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            symbol,
            kind,
            message: message.into(),
            details: None,
        });
    }

    pub fn log_error(&mut self, symbol: Option<String>, message: impl Into<String>) {
        let message = message.into();
        self.last_error = Some(message.clone());
        self.errors.push(LogEntry {
            timestamp: Utc::now(),
            symbol,
            kind: LogKind::Error,
            message,
            details: None,
        });
    }

    pub fn retire_trade(&mut self, trade: TradeRecord, account_balance: Decimal) {
        self.open_trades.retain(|t| t.id != trade.id);
        if let Some(pnl) = trade.profit_loss {
            self.today.record_closed_trade(pnl, account_balance);
        }
        self.completed_trades.push_back(trade);
        while self.completed_trades.len() > MAX_COMPLETED_TRADES {
            self.completed_trades.pop_front();
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            started_at: self.started_at,
            last_analysis_at: self.last_analysis_at,
            today: self.today,
            open_positions: self.open_trades.len(),
            recent_logs: self.logs.last(STATUS_LOG_TAIL),
            recent_errors: self.errors.last(STATUS_ERROR_TAIL),
        }
    }
}

/// The read-only view handed back by `Bot::status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: LifecycleStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub today: TodayCounters,
    pub open_positions: usize,
    pub recent_logs: Vec<LogEntry>,
    pub recent_errors: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_ring_evicts_oldest_past_capacity() {
        let mut ring = LogRing::bounded(3);
        for i in 0..5 {
            ring.push(LogEntry {
                timestamp: Utc::now(),
                symbol: None,
                kind: LogKind::Info,
                message: format!("m{i}"),
                details: None,
            });
        }
        assert_eq!(ring.len(), 3);
        let tail: Vec<String> = ring.last(3).into_iter().map(|e| e.message).collect();
        assert_eq!(tail, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn consecutive_losses_reset_on_a_winning_trade() {
        let mut counters = TodayCounters::default();
        counters.record_closed_trade(Decimal::from(-10), Decimal::from(1000));
        counters.record_closed_trade(Decimal::from(-10), Decimal::from(1000));
        assert_eq!(counters.consecutive_losses, 2);
        counters.record_closed_trade(Decimal::from(20), Decimal::from(1000));
        assert_eq!(counters.consecutive_losses, 0);
        assert_eq!(counters.trades, 3);
    }

    #[test]
    fn status_snapshot_caps_log_tail_at_thirty() {
        let mut state = BotState::default();
        for i in 0..50 {
            state.log(LogKind::Info, None, format!("entry {i}"));
        }
        assert_eq!(state.snapshot().recent_logs.len(), 30);
    }
}
