use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_products_table::Migration),
            Box::new(m20240101_000002_create_orders_table::Migration),
            Box::new(m20240101_000003_create_order_items_table::Migration),
            Box::new(m20240101_000004_create_customer_addresses_table::Migration),
            Box::new(m20240101_000005_create_refunds_table::Migration),
            Box::new(m20240101_000006_create_stock_operations_table::Migration),
            Box::new(m20240101_000007_create_order_audits_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240101_000001_create_products_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_products_table"
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
                        .col(ColumnDef::new(Products::SellerId).uuid().not_null())
                        .col(ColumnDef::new(Products::SellerName).string().not_null())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Image).string().null())
                        .col(
                            ColumnDef::new(Products::Price)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::Quantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Products::CreatedAt).timestamp().not_null())
                        .col(ColumnDef::new(Products::UpdatedAt).timestamp().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_products_seller_id")
                        .table(Products::Table)
                        .col(Products::SellerId)
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

    #[derive(Iden)]
    enum Products {
        Table,
        Id,
        SellerId,
        SellerName,
        Name,
        Image,
        Price,
        Quantity,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000002_create_orders_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_orders_table"
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
                        .col(ColumnDef::new(Orders::CustomerId).uuid().null())
                        .col(ColumnDef::new(Orders::SellerId).uuid().not_null())
                        .col(ColumnDef::new(Orders::SellerName).string().not_null())
                        .col(ColumnDef::new(Orders::Status).string().not_null())
                        .col(
                            ColumnDef::new(Orders::TotalAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Orders::RefundedAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::ShippingAddress).text().not_null())
                        .col(ColumnDef::new(Orders::PaymentMethod).string().null())
                        .col(ColumnDef::new(Orders::StripeSessionId).string().null())
                        .col(ColumnDef::new(Orders::PaymentIntentId).string().null())
                        .col(ColumnDef::new(Orders::TrackingNumber).string().null())
                        .col(ColumnDef::new(Orders::GuestEmail).string().null())
                        .col(ColumnDef::new(Orders::GuestName).string().null())
                        .col(ColumnDef::new(Orders::GuestPhone).string().null())
                        .col(ColumnDef::new(Orders::OrderDate).timestamp().not_null())
                        .col(ColumnDef::new(Orders::ShippedAt).timestamp().null())
                        .col(ColumnDef::new(Orders::DeliveredAt).timestamp().null())
                        .col(ColumnDef::new(Orders::CreatedAt).timestamp().not_null())
                        .col(ColumnDef::new(Orders::UpdatedAt).timestamp().null())
                        .col(
                            ColumnDef::new(Orders::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .to_owned(),
                )
                .await?;

            // One order per seller per payment session; NULL session ids
            // (orders detached from any session) are exempt.
            manager
                .create_index(
                    Index::create()
                        .name("uq_orders_session_seller")
                        .table(Orders::Table)
                        .col(Orders::StripeSessionId)
                        .col(Orders::SellerId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_orders_status_order_date")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .col(Orders::OrderDate)
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

    #[derive(Iden)]
    enum Orders {
        Table,
        Id,
        CustomerId,
        SellerId,
        SellerName,
        Status,
        TotalAmount,
        RefundedAmount,
        ShippingAddress,
        PaymentMethod,
        StripeSessionId,
        PaymentIntentId,
        TrackingNumber,
        GuestEmail,
        GuestName,
        GuestPhone,
        OrderDate,
        ShippedAt,
        DeliveredAt,
        CreatedAt,
        UpdatedAt,
        Version,
    }
}

mod m20240101_000003_create_order_items_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_order_items_table"
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
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductName).string().not_null())
                        .col(ColumnDef::new(OrderItems::ProductImage).string().null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(ColumnDef::new(OrderItems::Price).decimal().not_null())
                        .col(ColumnDef::new(OrderItems::Subtotal).decimal().not_null())
                        .col(
                            ColumnDef::new(OrderItems::IsReservation)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(OrderItems::ReservationDate).string().null())
                        .col(ColumnDef::new(OrderItems::ReservationTime).string().null())
                        .col(ColumnDef::new(OrderItems::ReservationNote).string().null())
                        .col(ColumnDef::new(OrderItems::CreatedAt).timestamp().not_null())
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
                        .name("idx_order_items_order_id")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .to_owned(),
                )
                .await?;

            // Reservation conflict lookups key on (product, date, time).
            manager
                .create_index(
                    Index::create()
                        .name("idx_order_items_reservation_slot")
                        .table(OrderItems::Table)
                        .col(OrderItems::ProductId)
                        .col(OrderItems::ReservationDate)
                        .col(OrderItems::ReservationTime)
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

    #[derive(Iden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        ProductName,
        ProductImage,
        Quantity,
        Price,
        Subtotal,
        IsReservation,
        ReservationDate,
        ReservationTime,
        ReservationNote,
        CreatedAt,
    }

    #[derive(Iden)]
    enum Orders {
        Table,
        Id,
    }
}

mod m20240101_000004_create_customer_addresses_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_customer_addresses_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CustomerAddresses::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CustomerAddresses::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CustomerAddresses::CustomerId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CustomerAddresses::RecipientName)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CustomerAddresses::Phone).string().not_null())
                        .col(ColumnDef::new(CustomerAddresses::Line1).string().not_null())
                        .col(ColumnDef::new(CustomerAddresses::Line2).string().null())
                        .col(ColumnDef::new(CustomerAddresses::City).string().not_null())
                        .col(ColumnDef::new(CustomerAddresses::State).string().not_null())
                        .col(
                            ColumnDef::new(CustomerAddresses::PostalCode)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CustomerAddresses::Country)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CustomerAddresses::CreatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_customer_addresses_customer_id")
                        .table(CustomerAddresses::Table)
                        .col(CustomerAddresses::CustomerId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CustomerAddresses::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum CustomerAddresses {
        Table,
        Id,
        CustomerId,
        RecipientName,
        Phone,
        Line1,
        Line2,
        City,
        State,
        PostalCode,
        Country,
        CreatedAt,
    }
}

mod m20240101_000005_create_refunds_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_refunds_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Refunds::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Refunds::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Refunds::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(Refunds::PaymentIntentId)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Refunds::RefundId).string().not_null())
                        .col(ColumnDef::new(Refunds::Amount).decimal().not_null())
                        .col(ColumnDef::new(Refunds::Currency).string().not_null())
                        .col(ColumnDef::new(Refunds::Reason).string().null())
                        .col(ColumnDef::new(Refunds::Status).string().not_null())
                        .col(ColumnDef::new(Refunds::IssuedBy).uuid().null())
                        .col(ColumnDef::new(Refunds::CreatedAt).timestamp().not_null())
                        .col(ColumnDef::new(Refunds::UpdatedAt).timestamp().null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_refunds_order_id")
                                .from(Refunds::Table, Refunds::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_refunds_order_id")
                        .table(Refunds::Table)
                        .col(Refunds::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Refunds::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum Refunds {
        Table,
        Id,
        OrderId,
        PaymentIntentId,
        RefundId,
        Amount,
        Currency,
        Reason,
        Status,
        IssuedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(Iden)]
    enum Orders {
        Table,
        Id,
    }
}

mod m20240101_000006_create_stock_operations_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000006_create_stock_operations_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockOperations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockOperations::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockOperations::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(StockOperations::Direction)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockOperations::Quantity)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockOperations::Reason).string().null())
                        .col(ColumnDef::new(StockOperations::OrderId).uuid().null())
                        .col(
                            ColumnDef::new(StockOperations::PreviousQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockOperations::NewQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockOperations::PerformedBy)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockOperations::CreatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_operations_product_id")
                                .from(StockOperations::Table, StockOperations::ProductId)
                                .to(Products::Table, Products::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_stock_operations_product_id")
                        .table(StockOperations::Table)
                        .col(StockOperations::ProductId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_stock_operations_order_id")
                        .table(StockOperations::Table)
                        .col(StockOperations::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockOperations::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum StockOperations {
        Table,
        Id,
        ProductId,
        Direction,
        Quantity,
        Reason,
        OrderId,
        PreviousQuantity,
        NewQuantity,
        PerformedBy,
        CreatedAt,
    }

    #[derive(Iden)]
    enum Products {
        Table,
        Id,
    }
}

mod m20240101_000007_create_order_audits_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000007_create_order_audits_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderAudits::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderAudits::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderAudits::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderAudits::Action).string().not_null())
                        .col(ColumnDef::new(OrderAudits::Detail).string().null())
                        .col(
                            ColumnDef::new(OrderAudits::CreatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_order_audits_order_id")
                        .table(OrderAudits::Table)
                        .col(OrderAudits::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderAudits::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum OrderAudits {
        Table,
        Id,
        OrderId,
        Action,
        Detail,
        CreatedAt,
    }
}
