//! Business services for the voucher pipeline.

pub mod amilon;
pub mod balance;
pub mod purchase;
pub mod recovery;
pub mod stripe_webhooks;

#[cfg(test)]
pub(crate) mod test_support;
