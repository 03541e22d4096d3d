pub mod order;

pub use order::{OrderDto, OrderItemDto, OrderStatusSummary};
