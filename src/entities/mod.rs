pub mod credit_balance;
pub mod merchant;
pub mod order;
pub mod order_item;
pub mod processed_webhook_event;
pub mod product;
pub mod stripe_payment;

pub use order::{OrderStatus, PaymentMethod};
pub use stripe_payment::PaymentStatus;
