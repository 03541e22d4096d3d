pub mod catalog;
pub mod health;
pub mod notifications;
pub mod orders;
pub mod webhooks;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::notifications::NotificationHub;
use crate::services::{
    amilon::{
        AmilonAuthService, AmilonCatalogService, AmilonClient, AmilonOrderService,
        VoucherOrderGateway,
    },
    balance::BalancePaymentService,
    purchase::PurchaseVoucherService,
    recovery::VoucherRecoveryService,
    stripe_webhooks::StripeWebhookService,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub amilon_orders: Arc<AmilonOrderService>,
    pub catalog: Arc<AmilonCatalogService>,
    pub purchase: Arc<PurchaseVoucherService>,
    pub recovery: Arc<VoucherRecoveryService>,
    pub stripe_webhooks: Arc<StripeWebhookService>,
}

impl AppServices {
    /// Wires every service against one pool, one event channel and one notification hub.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        event_sender: EventSender,
        notifications: NotificationHub,
    ) -> Self {
        let amilon_auth = Arc::new(AmilonAuthService::new(config.amilon.clone()));
        let client = AmilonClient::new(amilon_auth, config.amilon.clone());
        let catalog = Arc::new(AmilonCatalogService::new(client.clone(), db_pool.clone()));
        let amilon_orders = Arc::new(AmilonOrderService::new(
            client,
            db_pool.clone(),
            notifications.clone(),
            event_sender.clone(),
        ));
        let gateway: Arc<dyn VoucherOrderGateway> = amilon_orders.clone();

        let balance = BalancePaymentService::new(db_pool.clone(), event_sender.clone());
        let purchase = Arc::new(PurchaseVoucherService::new(
            db_pool.clone(),
            balance.clone(),
            gateway.clone(),
            notifications.clone(),
        ));
        let recovery = Arc::new(VoucherRecoveryService::new(
            db_pool.clone(),
            gateway,
            balance,
            event_sender.clone(),
        ));
        let stripe_webhooks = Arc::new(StripeWebhookService::new(
            db_pool,
            config.stripe.clone(),
            notifications,
            event_sender,
        ));

        Self {
            amilon_orders,
            catalog,
            purchase,
            recovery,
            stripe_webhooks,
        }
    }
}
