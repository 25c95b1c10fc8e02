//! Order management
//!
//! Strategies emit `OrderRequest` intents; the backtest engine turns approved
//! intents into `Order`s, asks the `ExecutionEngine` whether each bar fills
//! them, and feeds the resulting `Fill`s into the `PositionBook`.

pub mod execution;
pub mod intent;
pub mod position_book;
pub mod types;

pub use execution::{ExecutionEngine, FillQuote};
pub use intent::OrderRequest;
pub use position_book::PositionBook;
pub use types::{next_fill_id, next_order_id, Fill, FillId, Order, OrderId, OrderState, OrderType, Position};
