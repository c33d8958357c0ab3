use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Smallest unit of the settlement currency (SOL)
pub type Lamports = u64;

/// Lifecycle of a position
///
/// `Open -> Closing` when an exit is dispatched, `Closing -> Closed` when the sell
/// fills, `Closing -> Open` when the sell fails and should be retried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

/// Trailing configuration resolved for a position when it was created
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrailingRule {
    pub percent: f64,
    pub activation_percent: f64,
}

/// Armed trailing stop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrailingStop {
    pub percent: f64,
    pub highest_price_seen: f64,
    pub stop_price: f64,
}

impl TrailingStop {
    pub fn new(percent: f64, price: f64) -> Self {
        Self {
            percent,
            highest_price_seen: price,
            stop_price: price * (1.0 - percent / 100.0),
        }
    }

    /// Feed a new price; returns true when the high (and so the stop) moved up
    pub fn observe(&mut self, price: f64) -> bool {
        if price > self.highest_price_seen {
            self.highest_price_seen = price;
            self.stop_price = price * (1.0 - self.percent / 100.0);
            true
        } else {
            false
        }
    }
}

/// One open trading position
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub token_address: String,
    pub token_symbol: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Token amount in the token's smallest unit
    pub quantity: u64,
    pub current_price: f64,
    pub last_update: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_rule: Option<TrailingRule>,
    pub trailing_stop: Option<TrailingStop>,
    pub initial_cost_basis: Lamports,
    pub pattern_tag: Option<String>,
    pub status: PositionStatus,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Unrealized P&L in percent of entry price
    pub fn pnl_percent(&self) -> f64 {
        pnl_percent(self.entry_price, self.current_price)
    }

    /// Sale value implied by the current quote, scaled from the cost basis
    pub fn estimated_proceeds(&self) -> Lamports {
        if self.entry_price <= 0.0 {
            return self.initial_cost_basis;
        }
        let value = self.initial_cost_basis as f64 * (self.current_price / self.entry_price);
        value.max(0.0).round() as Lamports
    }
}

pub fn pnl_percent(entry_price: f64, current_price: f64) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    (current_price - entry_price) / entry_price * 100.0
}

/// Realized P&L in lamports, saturating at the `i64` range
pub fn realized_pnl(proceeds: Lamports, cost_basis: Lamports) -> i64 {
    let delta = proceeds as i128 - cost_basis as i128;
    delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Why a position has to be closed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ExitReason {
    TakeProfit { level: f64 },
    StopLoss { level: f64 },
    TrailingStop { stop_price: f64 },
    MaxHoldingTime { held_minutes: i64 },
    Volatility { last_return_pct: f64, threshold_pct: f64 },
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit { level } => write!(f, "take profit hit at price {:.6}", level),
            ExitReason::StopLoss { level } => write!(f, "stop loss hit at price {:.6}", level),
            ExitReason::TrailingStop { stop_price } => {
                write!(f, "trailing stop hit at price {:.6}", stop_price)
            }
            ExitReason::MaxHoldingTime { held_minutes } => {
                write!(f, "max holding time reached ({} minutes)", held_minutes)
            }
            ExitReason::Volatility {
                last_return_pct,
                threshold_pct,
            } => write!(
                f,
                "volatility spike: return {:.4}% exceeds threshold {:.4}%",
                last_return_pct, threshold_pct
            ),
        }
    }
}

/// Instruction handed to the order sink to close a position
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SellInstruction {
    pub position_id: Uuid,
    pub token_address: String,
    pub quantity: u64,
    pub price: f64,
    /// Proceeds implied by the current quote
    pub expected_proceeds: Lamports,
}

/// Outcome reported by the order sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrderResult {
    pub success: bool,
    pub filled_quantity: Option<u64>,
    pub proceeds: Option<Lamports>,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn filled(quantity: u64, proceeds: Lamports) -> Self {
        Self {
            success: true,
            filled_quantity: Some(quantity),
            proceeds: Some(proceeds),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A completed trade as seen by the account guard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub pnl: i64,
    pub balance_after: i64,
    pub timestamp: DateTime<Utc>,
}
