use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_merchants_table::Migration),
            Box::new(m20250101_000002_create_products_table::Migration),
            Box::new(m20250101_000003_create_orders_table::Migration),
            Box::new(m20250101_000004_create_order_items_table::Migration),
            Box::new(m20250101_000005_create_stripe_payments_table::Migration),
            Box::new(m20250101_000006_create_processed_webhook_events_table::Migration),
            Box::new(m20250101_000007_create_credit_balances_table::Migration),
        ]
    }
}

mod m20250101_000001_create_merchants_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_merchants_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Merchants::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Merchants::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Merchants::MerchantId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Merchants::Name).string().not_null())
                        .col(ColumnDef::new(Merchants::Country).string().null())
                        .col(
                            ColumnDef::new(Merchants::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Merchants::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Merchants::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Merchants {
        Table,
        Id,
        MerchantId,
        Name,
        Country,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000002_create_products_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Products::ProductCode).string().null())
                        .col(ColumnDef::new(Products::MerchantId).uuid().null())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(
                            ColumnDef::new(Products::Price)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::NetPrice)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::Currency)
                                .string_len(3)
                                .not_null()
                                .default("EUR"),
                        )
                        .col(
                            ColumnDef::new(Products::IsAvailable)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_product_code")
                        .table(Products::Table)
                        .col(Products::ProductCode)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        ProductCode,
        MerchantId,
        Name,
        Price,
        NetPrice,
        Currency,
        IsAvailable,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000003_create_orders_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Orders::ExternalOrderId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::OrderId).string().null())
                        .col(ColumnDef::new(Orders::UserId).uuid().null())
                        .col(ColumnDef::new(Orders::ProductId).uuid().null())
                        .col(ColumnDef::new(Orders::MerchantId).uuid().null())
                        .col(
                            ColumnDef::new(Orders::Amount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::TotalAmount).big_integer().null())
                        .col(ColumnDef::new(Orders::PricePaid).big_integer().null())
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Orders::OrderStatus).string().null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string_len(20).null())
                        .col(ColumnDef::new(Orders::PaymentId).string().null())
                        .col(ColumnDef::new(Orders::StripePaymentId).string().null())
                        .col(
                            ColumnDef::new(Orders::BalanceAmountUsed)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::ProductName).string().null())
                        .col(ColumnDef::new(Orders::VoucherCode).string().null())
                        .col(ColumnDef::new(Orders::VoucherPin).string().null())
                        .col(ColumnDef::new(Orders::VoucherUrl).text().null())
                        .col(
                            ColumnDef::new(Orders::OrderDate)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Orders::GrossAmount).big_integer().null())
                        .col(ColumnDef::new(Orders::NetAmount).big_integer().null())
                        .col(ColumnDef::new(Orders::TotalRequestedCodes).integer().null())
                        .col(
                            ColumnDef::new(Orders::Currency)
                                .string_len(3)
                                .not_null()
                                .default("EUR"),
                        )
                        .col(
                            ColumnDef::new(Orders::RecoveryAttempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::LastError).text().null())
                        .col(
                            ColumnDef::new(Orders::LastRecoveryAttempt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Orders::OrderRecoveredId).uuid().null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status_recovery")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .col(Orders::RecoveryAttempts)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_amilon_order_id")
                        .table(Orders::Table)
                        .col(Orders::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        ExternalOrderId,
        OrderId,
        UserId,
        ProductId,
        MerchantId,
        Amount,
        TotalAmount,
        PricePaid,
        Status,
        OrderStatus,
        PaymentMethod,
        PaymentId,
        StripePaymentId,
        BalanceAmountUsed,
        ProductName,
        VoucherCode,
        VoucherPin,
        VoucherUrl,
        OrderDate,
        GrossAmount,
        NetAmount,
        TotalRequestedCodes,
        Currency,
        RecoveryAttempts,
        LastError,
        LastRecoveryAttempt,
        OrderRecoveredId,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000004_create_order_items_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_order_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().null())
                        .col(ColumnDef::new(OrderItems::ProductCode).string().null())
                        .col(
                            ColumnDef::new(OrderItems::Quantity)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(ColumnDef::new(OrderItems::Price).big_integer().null())
                        .col(ColumnDef::new(OrderItems::Vouchers).json().null())
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        ProductCode,
        Quantity,
        Price,
        Vouchers,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
    }
}

mod m20250101_000005_create_stripe_payments_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000005_create_stripe_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StripePayments::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StripePayments::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StripePayments::UserId).uuid().not_null())
                        .col(
                            ColumnDef::new(StripePayments::StripePaymentId)
                                .string()
                                .null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(StripePayments::StripeCheckoutId)
                                .string()
                                .null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(StripePayments::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StripePayments::Amount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StripePayments::Currency)
                                .string_len(3)
                                .not_null()
                                .default("EUR"),
                        )
                        .col(
                            ColumnDef::new(StripePayments::CreditAmount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(StripePayments::CreditType)
                                .string_len(20)
                                .not_null()
                                .default("cash"),
                        )
                        .col(ColumnDef::new(StripePayments::ErrorMessage).text().null())
                        .col(ColumnDef::new(StripePayments::Metadata).json().null())
                        .col(
                            ColumnDef::new(StripePayments::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(StripePayments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StripePayments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StripePayments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum StripePayments {
        Table,
        Id,
        UserId,
        StripePaymentId,
        StripeCheckoutId,
        Status,
        Amount,
        Currency,
        CreditAmount,
        CreditType,
        ErrorMessage,
        Metadata,
        ProcessedAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000006_create_processed_webhook_events_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000006_create_processed_webhook_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProcessedWebhookEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProcessedWebhookEvents::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProcessedWebhookEvents::EventId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(
                            ColumnDef::new(ProcessedWebhookEvents::EventType)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProcessedWebhookEvents::ProcessedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProcessedWebhookEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum ProcessedWebhookEvents {
        Table,
        Id,
        EventId,
        EventType,
        ProcessedAt,
    }
}

mod m20250101_000007_create_credit_balances_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000007_create_credit_balances_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CreditBalances::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CreditBalances::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CreditBalances::OwnerId).uuid().not_null())
                        .col(
                            ColumnDef::new(CreditBalances::CreditType)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CreditBalances::Balance)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CreditBalances::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CreditBalances::UpdatedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_credit_balances_owner_type")
                        .table(CreditBalances::Table)
                        .col(CreditBalances::OwnerId)
                        .col(CreditBalances::CreditType)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CreditBalances::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CreditBalances {
        Table,
        Id,
        OwnerId,
        CreditType,
        Balance,
        CreatedAt,
        UpdatedAt,
    }
}
