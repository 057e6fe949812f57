//! Trading Types
//!
//! Types for the order lifecycle: order requests, trades, portfolios and positions.

use crate::error::{EngineError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Fee charged on every fill, as a fraction of notional.
pub const FEE_RATE: Decimal = dec!(0.001);

/// Fees may never exceed this fraction of the trade value.
pub const FEE_CAP_RATIO: Decimal = dec!(0.1);

/// Maximum number of fractional digits accepted for quantities and prices.
pub const MAX_SCALE: u32 = 8;

/// Maximum number of distinct positions a portfolio may hold.
pub const MAX_POSITIONS: usize = 50;

/// Largest quantity an order may carry.
pub const MAX_QUANTITY: Decimal = dec!(1000000000);

/// Largest limit or stop price an order may carry.
pub const MAX_PRICE: Decimal = dec!(1000000000);

/// Compute the fee for a fill with the given notional.
pub fn fee_for(notional: Decimal) -> Decimal {
    (notional * FEE_RATE).round_dp(MAX_SCALE)
}

/// Value of `quantity` units at `price`.
///
/// Fails instead of overflowing when the product cannot be represented.
pub fn notional(quantity: Decimal, price: Decimal) -> Result<Decimal> {
    quantity.checked_mul(price).ok_or_else(|| {
        EngineError::Validation(format!("{} at {} is out of range", quantity, price))
    })
}

fn checked_add(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| EngineError::Validation(format!("{} + {} is out of range", a, b)))
}

/// Truncate a quantity to the supported precision.
pub fn truncate_quantity(quantity: Decimal) -> Decimal {
    quantity.round_dp_with_strategy(MAX_SCALE, RoundingStrategy::ToZero)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Enums
// =============================================================================

/// Order action (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderAction::Buy => write!(f, "BUY"),
            OrderAction::Sell => write!(f, "SELL"),
        }
    }
}

/// Where an order came from and the trigger it carries.
///
/// Market orders fill immediately; every other source is deferred to the
/// pending order monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum OrderSource {
    /// Fill immediately at the live price
    Market,
    /// Fill at the limit price once the market crosses it
    Limit {
        #[serde(rename = "limitPrice")]
        limit_price: Decimal,
    },
    /// Sell at market once the price falls to the stop
    StopLoss {
        #[serde(rename = "stopPrice")]
        stop_price: Decimal,
    },
    /// Sell at market once the price rises to the target
    TakeProfit {
        #[serde(rename = "stopPrice")]
        stop_price: Decimal,
    },
}

impl OrderSource {
    /// Whether this order waits for a trigger instead of filling on submission.
    pub fn is_deferred(&self) -> bool {
        !matches!(self, OrderSource::Market)
    }

    pub fn limit_price(&self) -> Option<Decimal> {
        match self {
            OrderSource::Limit { limit_price } => Some(*limit_price),
            _ => None,
        }
    }

    pub fn stop_price(&self) -> Option<Decimal> {
        match self {
            OrderSource::StopLoss { stop_price } | OrderSource::TakeProfit { stop_price } => {
                Some(*stop_price)
            }
            _ => None,
        }
    }

    /// Evaluate the trigger against a fresh price.
    ///
    /// Returns the fill price when the order should execute now. Limit orders
    /// fill at their limit price; stop-loss and take-profit fill at the market.
    pub fn trigger(&self, action: OrderAction, current_price: Decimal) -> Option<Decimal> {
        match (self, action) {
            (OrderSource::Market, _) => Some(current_price),
            (OrderSource::Limit { limit_price }, OrderAction::Buy) => {
                (current_price <= *limit_price).then_some(*limit_price)
            }
            (OrderSource::Limit { limit_price }, OrderAction::Sell) => {
                (current_price >= *limit_price).then_some(*limit_price)
            }
            (OrderSource::StopLoss { stop_price }, OrderAction::Sell) => {
                (current_price <= *stop_price).then_some(current_price)
            }
            (OrderSource::TakeProfit { stop_price }, OrderAction::Sell) => {
                (current_price >= *stop_price).then_some(current_price)
            }
            // Protective orders only exist on the sell side.
            (OrderSource::StopLoss { .. } | OrderSource::TakeProfit { .. }, OrderAction::Buy) => {
                None
            }
        }
    }
}

impl std::fmt::Display for OrderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSource::Market => write!(f, "market"),
            OrderSource::Limit { .. } => write!(f, "limit"),
            OrderSource::StopLoss { .. } => write!(f, "stop_loss"),
            OrderSource::TakeProfit { .. } => write!(f, "take_profit"),
        }
    }
}

/// Trade status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    /// Waiting for a trigger
    Pending,
    /// Filled and applied to the portfolio
    Executed,
    /// Dropped at fill time after failing re-validation
    Cancelled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Pending)
    }

    /// Only `pending -> executed` and `pending -> cancelled` are legal.
    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        matches!(
            (self, next),
            (TradeStatus::Pending, TradeStatus::Executed)
                | (TradeStatus::Pending, TradeStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Executed => "executed",
            TradeStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Market Data
// =============================================================================

/// OHLCV snapshot captured when an order is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Quote time (ms)
    pub timestamp: i64,
}

impl MarketData {
    /// A flat bar built from a single quote.
    pub fn from_price(price: Decimal) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ZERO,
            timestamp: now_ms(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.high < self.low {
            return Err(EngineError::Validation(format!(
                "market data high {} is below low {}",
                self.high, self.low
            )));
        }
        if self.open.is_sign_negative() || self.close.is_sign_negative() {
            return Err(EngineError::Validation(
                "market data open/close must be non-negative".to_string(),
            ));
        }
        if self.volume.is_sign_negative() {
            return Err(EngineError::Validation(
                "market data volume must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Request to buy or sell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub user_id: String,
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: Decimal,
    #[serde(flatten)]
    pub source: OrderSource,
    /// Strategy that generated this request, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
}

impl TradeRequest {
    pub fn market(user_id: &str, symbol: &str, action: OrderAction, quantity: Decimal) -> Self {
        Self {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            action,
            quantity,
            source: OrderSource::Market,
            strategy_id: None,
        }
    }

    pub fn with_source(mut self, source: OrderSource) -> Self {
        self.source = source;
        self
    }

    /// Validate the request and normalize the symbol to upper case.
    pub fn validate(&mut self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(EngineError::Validation("user id is required".to_string()));
        }

        self.symbol = normalize_symbol(&self.symbol)?;
        validate_quantity(self.quantity)?;

        match self.source {
            OrderSource::Market => {}
            OrderSource::Limit { limit_price } => validate_price("limitPrice", limit_price)?,
            OrderSource::StopLoss { stop_price } | OrderSource::TakeProfit { stop_price } => {
                validate_price("stopPrice", stop_price)?;
                if self.action != OrderAction::Sell {
                    return Err(EngineError::Validation(format!(
                        "{} orders must be SELL",
                        self.source
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Upper-case a symbol and reject anything that is not a plausible ticker.
pub fn normalize_symbol(symbol: &str) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= 15
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '/'));

    if valid {
        Ok(symbol)
    } else {
        Err(EngineError::Validation(format!("invalid symbol: {:?}", symbol)))
    }
}

/// Quantities must be positive, bounded, with at most eight decimal places.
pub fn validate_quantity(quantity: Decimal) -> Result<()> {
    if quantity <= Decimal::ZERO {
        return Err(EngineError::Validation("quantity must be positive".to_string()));
    }
    if quantity > MAX_QUANTITY {
        return Err(EngineError::Validation(format!(
            "quantity {} exceeds {}",
            quantity, MAX_QUANTITY
        )));
    }
    if quantity.normalize().scale() > MAX_SCALE {
        return Err(EngineError::Validation(format!(
            "quantity {} has more than {} decimal places",
            quantity, MAX_SCALE
        )));
    }
    Ok(())
}

fn validate_price(field: &str, price: Decimal) -> Result<()> {
    if price <= Decimal::ZERO {
        return Err(EngineError::Validation(format!("{} must be positive", field)));
    }
    if price > MAX_PRICE {
        return Err(EngineError::Validation(format!(
            "{} {} exceeds {}",
            field, price, MAX_PRICE
        )));
    }
    Ok(())
}

// =============================================================================
// Trade Types
// =============================================================================

/// One order attempt and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    /// Unique trade ID
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Symbol traded
    pub symbol: String,
    /// Buy or sell
    pub action: OrderAction,
    /// Quantity ordered
    pub quantity: Decimal,
    /// Order source and its trigger
    #[serde(flatten)]
    pub source: OrderSource,
    /// Live price at submission, used for sizing
    pub trigger_price: Decimal,
    /// Fill price (set on execution)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Fee charged (estimated while pending)
    pub fees: Decimal,
    /// Notional plus fees
    pub total: Decimal,
    /// Lifecycle status
    pub status: TradeStatus,
    /// Realized P&L, SELL fills only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
    /// Why the trade was cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Strategy that generated this trade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    /// Market snapshot at submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_data: Option<MarketData>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<i64>,
}

impl Trade {
    /// Create a pending trade from a validated request.
    pub fn from_request(
        request: &TradeRequest,
        trigger_price: Decimal,
        market_data: Option<MarketData>,
    ) -> Result<Self> {
        let now = now_ms();
        let notional = notional(request.quantity, trigger_price)?;
        let fees = fee_for(notional);
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            symbol: request.symbol.clone(),
            action: request.action,
            quantity: request.quantity,
            source: request.source,
            trigger_price,
            price: None,
            fees,
            total: checked_add(notional, fees)?,
            status: TradeStatus::Pending,
            realized_pnl: None,
            error_message: None,
            strategy_id: request.strategy_id.clone(),
            market_data,
            created_at: now,
            updated_at: now,
            executed_at: None,
        })
    }

    /// Notional at the given price.
    pub fn notional_at(&self, price: Decimal) -> Result<Decimal> {
        notional(self.quantity, price)
    }

    /// Transition to executed at the fill price.
    pub fn mark_executed(&mut self, price: Decimal, realized_pnl: Option<Decimal>) -> Result<()> {
        let notional = self.notional_at(price)?;
        let fees = fee_for(notional);
        let total = checked_add(notional, fees)?;
        self.transition(TradeStatus::Executed)?;
        self.price = Some(price);
        self.fees = fees;
        self.total = total;
        self.realized_pnl = match self.action {
            OrderAction::Sell => realized_pnl,
            OrderAction::Buy => None,
        };
        self.executed_at = Some(self.updated_at);
        Ok(())
    }

    /// Transition to cancelled with a reason.
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TradeStatus::Cancelled)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, next: TradeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::TradeFinalized(format!(
                "trade {} is {}, cannot become {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now_ms();
        Ok(())
    }

    /// Check record-level invariants before persisting.
    pub fn validate(&self) -> Result<()> {
        validate_quantity(self.quantity)?;

        let value = self.total - self.fees;
        if self.fees.is_sign_negative() || self.fees > value * FEE_CAP_RATIO {
            return Err(EngineError::Validation(format!(
                "fees {} exceed {} of trade value {}",
                self.fees, FEE_CAP_RATIO, value
            )));
        }
        if self.action == OrderAction::Buy && self.realized_pnl.is_some() {
            return Err(EngineError::Validation(
                "only SELL trades may carry realized P&L".to_string(),
            ));
        }
        if let Some(market_data) = &self.market_data {
            market_data.validate()?;
        }
        Ok(())
    }

    pub fn summary(&self) -> TradeSummary {
        TradeSummary {
            trade_id: self.id.clone(),
            symbol: self.symbol.clone(),
            action: self.action,
            quantity: self.quantity,
            price: self.price.unwrap_or(self.trigger_price),
            fees: self.fees,
            total: self.total,
            source: self.source.to_string(),
            executed_at: self.executed_at,
        }
    }
}

/// Compact view of an executed trade for notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSummary {
    pub trade_id: String,
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fees: Decimal,
    pub total: Decimal,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<i64>,
}

/// Result of the execution decision for a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDecision {
    pub execute: bool,
    pub execution_price: Option<Decimal>,
    pub status: TradeStatus,
}

// =============================================================================
// Portfolio Types
// =============================================================================

/// A holding inside a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    /// Weighted average cost
    pub avg_buy_price: Decimal,
    /// Cost basis of the remaining quantity
    pub total_invested: Decimal,
    pub opened_at: i64,
    pub updated_at: i64,
}

impl Position {
    fn open(symbol: &str, quantity: Decimal, price: Decimal, cost: Decimal) -> Self {
        let now = now_ms();
        Self {
            symbol: symbol.to_string(),
            quantity,
            avg_buy_price: price,
            total_invested: cost,
            opened_at: now,
            updated_at: now,
        }
    }
}

/// A user's cash and holdings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub user_id: String,
    pub cash: Decimal,
    pub positions: Vec<Position>,
    /// Bumped by the store on every committed write
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Portfolio {
    pub fn new(user_id: impl Into<String>, cash: Decimal) -> Self {
        let now = now_ms();
        Self {
            user_id: user_id.into(),
            cash,
            positions: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    /// Quantity held for a symbol (zero when absent).
    pub fn holding(&self, symbol: &str) -> Decimal {
        self.position(symbol).map(|p| p.quantity).unwrap_or_default()
    }

    /// Add quantity at a price, averaging into an existing position.
    pub fn add_position(&mut self, symbol: &str, quantity: Decimal, price: Decimal) -> Result<()> {
        let now = now_ms();
        let added = notional(quantity, price)?;
        if let Some(position) = self.positions.iter_mut().find(|p| p.symbol == symbol) {
            let new_quantity = checked_add(position.quantity, quantity)?;
            let total_invested = checked_add(position.total_invested, added)?;
            position.avg_buy_price = total_invested / new_quantity;
            position.total_invested = total_invested;
            position.quantity = new_quantity;
            position.updated_at = now;
        } else {
            if self.positions.len() >= MAX_POSITIONS {
                return Err(EngineError::PositionLimitExceeded { max: MAX_POSITIONS });
            }
            self.positions.push(Position::open(symbol, quantity, price, added));
        }
        self.updated_at = now;
        Ok(())
    }

    /// Remove quantity from a position.
    ///
    /// Returns false without touching anything when the position is missing or
    /// smaller than `quantity`. Cost basis shrinks in proportion to the
    /// fraction sold.
    pub fn remove_position(&mut self, symbol: &str, quantity: Decimal) -> bool {
        let Some(index) = self.positions.iter().position(|p| p.symbol == symbol) else {
            return false;
        };

        let position = &mut self.positions[index];
        if quantity > position.quantity {
            return false;
        }

        if quantity == position.quantity {
            self.positions.remove(index);
        } else {
            let fraction = quantity / position.quantity;
            position.total_invested -= fraction * position.total_invested;
            position.quantity -= quantity;
            position.updated_at = now_ms();
        }
        self.updated_at = now_ms();
        true
    }

    /// Cost basis of `quantity` units of a held symbol.
    fn cost_basis_of(&self, symbol: &str, quantity: Decimal) -> Decimal {
        match self.position(symbol) {
            Some(p) if !p.quantity.is_zero() => quantity / p.quantity * p.total_invested,
            _ => Decimal::ZERO,
        }
    }

    /// Check that a BUY can be paid for.
    pub fn ensure_cash(&self, required: Decimal) -> Result<()> {
        if self.cash < required {
            return Err(EngineError::InsufficientCash {
                needed: required,
                available: self.cash,
            });
        }
        Ok(())
    }

    /// Check that a SELL is covered by holdings.
    pub fn ensure_holdings(&self, symbol: &str, quantity: Decimal) -> Result<()> {
        let held = self.holding(symbol);
        if held < quantity {
            return Err(EngineError::InsufficientHoldings {
                symbol: symbol.to_string(),
                requested: quantity,
                held,
            });
        }
        Ok(())
    }

    /// Apply a BUY fill: debit cash for notional plus fees, then add the position.
    pub fn apply_buy(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<()> {
        let cost = checked_add(notional(quantity, price)?, fees)?;
        self.ensure_cash(cost)?;
        if self.position(symbol).is_none() && self.positions.len() >= MAX_POSITIONS {
            return Err(EngineError::PositionLimitExceeded { max: MAX_POSITIONS });
        }

        self.cash -= cost;
        self.add_position(symbol, quantity, price)
    }

    /// Apply a SELL fill: remove the position, then credit proceeds less fees.
    ///
    /// Returns the realized P&L against the average cost.
    pub fn apply_sell(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        fees: Decimal,
    ) -> Result<Decimal> {
        self.ensure_holdings(symbol, quantity)?;
        let cost_basis = self.cost_basis_of(symbol, quantity);
        let proceeds = notional(quantity, price)? - fees;
        let cash = checked_add(self.cash, proceeds)?;

        if !self.remove_position(symbol, quantity) {
            return Err(EngineError::InsufficientHoldings {
                symbol: symbol.to_string(),
                requested: quantity,
                held: self.holding(symbol),
            });
        }

        self.cash = cash;
        Ok(proceeds - cost_basis)
    }
}
