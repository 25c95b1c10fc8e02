//! Order intents
//!
//! Strategies never touch the order book directly; they emit `OrderRequest`s
//! and the engine decides what survives the risk gate and becomes an `Order`.

use chrono::{DateTime, Utc};

use super::types::{next_order_id, Order, OrderState, OrderType};
use crate::{Money, Side, Symbol};

/// A strategy's wish to trade, before risk approval
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Money,
    pub limit_price: Option<Money>,
    pub stop_price: Option<Money>,
    pub maker_only: bool,
    pub reduce_only: bool,
    /// Protective stop for the position this entry opens
    pub protective_stop: Option<Money>,
    pub is_addon: bool,
    /// Free-form tag, ends up in the trade log
    pub reason: String,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: Side, quantity: Money, reason: impl Into<String>) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
            maker_only: false,
            reduce_only: false,
            protective_stop: None,
            is_addon: false,
            reason: reason.into(),
        }
    }

    pub fn limit(
        symbol: Symbol,
        side: Side,
        quantity: Money,
        limit_price: Money,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(limit_price),
            stop_price: None,
            maker_only: false,
            reduce_only: false,
            protective_stop: None,
            is_addon: false,
            reason: reason.into(),
        }
    }

    pub fn stop(
        symbol: Symbol,
        side: Side,
        quantity: Money,
        stop_price: Money,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Stop,
            quantity,
            limit_price: None,
            stop_price: Some(stop_price),
            maker_only: false,
            reduce_only: false,
            protective_stop: None,
            is_addon: false,
            reason: reason.into(),
        }
    }

    pub fn maker_only(mut self) -> Self {
        self.maker_only = true;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn with_protective_stop(mut self, stop: Money) -> Self {
        self.protective_stop = Some(stop);
        self
    }

    pub fn as_addon(mut self) -> Self {
        self.is_addon = true;
        self
    }

    /// Notional value of the request at a reference price
    pub fn notional(&self, reference_price: f64) -> f64 {
        let price = self
            .limit_price
            .or(self.stop_price)
            .unwrap_or(Money::from_f64(reference_price));
        (self.quantity * price).to_f64()
    }

    /// Capital at risk if the protective stop is hit; notional when no stop
    pub fn risk_amount(&self, reference_price: f64) -> f64 {
        match self.protective_stop {
            Some(stop) => {
                let entry = self
                    .limit_price
                    .or(self.stop_price)
                    .unwrap_or(Money::from_f64(reference_price));
                ((entry - stop).abs() * self.quantity).to_f64()
            }
            None => self.notional(reference_price),
        }
    }

    pub fn into_order(self, timestamp: DateTime<Utc>, bar_idx: usize) -> Order {
        let quantity = self.quantity;
        Order {
            id: next_order_id(),
            symbol: self.symbol,
            side: self.side,
            order_type: self.order_type,
            limit_price: self.limit_price,
            stop_price: self.stop_price,
            quantity,
            filled_quantity: Money::ZERO,
            remaining_quantity: quantity,
            average_fill_price: Money::ZERO,
            state: OrderState::Pending,
            maker_only: self.maker_only,
            reduce_only: self.reduce_only,
            protective_stop: self.protective_stop,
            is_addon: self.is_addon,
            created_at: timestamp,
            updated_at: timestamp,
            client_id: Some(self.reason),
            created_bar_idx: Some(bar_idx),
        }
    }
}
