use sea_orm_migration::prelude::*;

pub struct Migrator;

/// Money columns. SQLite rejects a decimal precision above 16.
const MONEY_PRECISION: u32 = 16;
const MONEY_SCALE: u32 = 4;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_customers_tables::Migration),
            Box::new(m20240601_000002_create_catalog_tables::Migration),
            Box::new(m20240601_000003_create_cart_tables::Migration),
            Box::new(m20240601_000004_create_orders_tables::Migration),
            Box::new(m20240601_000005_create_payments_tables::Migration),
        ]
    }
}

mod m20240601_000001_create_customers_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_customers_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // customers.id is the identity provider's user id
            manager
                .create_table(
                    Table::create()
                        .table(Customers::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Customers::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Customers::Email).string().not_null())
                        .col(ColumnDef::new(Customers::Name).string().null())
                        .col(ColumnDef::new(Customers::Phone).string().null())
                        .col(ColumnDef::new(Customers::GatewayCustomerRef).string().null())
                        .col(
                            ColumnDef::new(Customers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Customers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

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
                        .col(ColumnDef::new(CustomerAddresses::CustomerId).uuid().not_null())
                        .col(ColumnDef::new(CustomerAddresses::Name).string().null())
                        .col(
                            ColumnDef::new(CustomerAddresses::AddressLine1)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CustomerAddresses::AddressLine2).string().null())
                        .col(ColumnDef::new(CustomerAddresses::City).string().not_null())
                        .col(ColumnDef::new(CustomerAddresses::Province).string().not_null())
                        .col(
                            ColumnDef::new(CustomerAddresses::CountryCode)
                                .string_len(2)
                                .not_null(),
                        )
                        .col(ColumnDef::new(CustomerAddresses::PostalCode).string().not_null())
                        .col(
                            ColumnDef::new(CustomerAddresses::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_customer_addresses_customer_id")
                                .from(CustomerAddresses::Table, CustomerAddresses::CustomerId)
                                .to(Customers::Table, Customers::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
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
                .await?;
            manager
                .drop_table(Table::drop().table(Customers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Customers {
        Table,
        Id,
        Email,
        Name,
        Phone,
        GatewayCustomerRef,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CustomerAddresses {
        Table,
        Id,
        CustomerId,
        Name,
        #[sea_orm(iden = "address_line_1")]
        AddressLine1,
        #[sea_orm(iden = "address_line_2")]
        AddressLine2,
        City,
        Province,
        CountryCode,
        PostalCode,
        CreatedAt,
    }
}

mod m20240601_000002_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_catalog_tables"
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
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Sku).string().not_null().unique_key())
                        .col(
                            ColumnDef::new(Products::BasePrice)
                                .decimal_len(super::MONEY_PRECISION, super::MONEY_SCALE)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Products::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Products::IsActive)
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
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProductVariants::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductVariants::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProductVariants::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(ProductVariants::Sku)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(ProductVariants::Name).string().not_null())
                        .col(
                            ColumnDef::new(ProductVariants::Price)
                                .decimal_len(super::MONEY_PRECISION, super::MONEY_SCALE)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_product_variants_product_id")
                                .from(ProductVariants::Table, ProductVariants::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_product_variants_product_id")
                        .table(ProductVariants::Table)
                        .col(ProductVariants::ProductId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProductVariants::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Name,
        Sku,
        BasePrice,
        Currency,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ProductVariants {
        Table,
        Id,
        ProductId,
        Sku,
        Name,
        Price,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000003_create_cart_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_cart_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Carts::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Carts::CustomerId).uuid().not_null())
                        .col(ColumnDef::new(Carts::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Carts::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Carts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Carts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CartItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(CartItems::CartId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::VariantId).uuid().null())
                        .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(CartItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_items_cart_id")
                                .from(CartItems::Table, CartItems::CartId)
                                .to(Carts::Table, Carts::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_customer_id")
                        .table(Carts::Table)
                        .col(Carts::CustomerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_items_cart_id")
                        .table(CartItems::Table)
                        .col(CartItems::CartId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Carts {
        Table,
        Id,
        CustomerId,
        Currency,
        Status,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CartItems {
        Table,
        Id,
        CartId,
        ProductId,
        VariantId,
        Quantity,
        CreatedAt,
    }
}

mod m20240601_000004_create_orders_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_orders_tables"
        }
    }

    fn money(col: Orders) -> ColumnDef {
        ColumnDef::new(col)
            .decimal_len(super::MONEY_PRECISION, super::MONEY_SCALE)
            .not_null()
            .default(0)
            .to_owned()
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
                            ColumnDef::new(Orders::OrderNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Orders::UserId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(money(Orders::Subtotal))
                        .col(money(Orders::TaxAmount))
                        .col(money(Orders::ShippingAmount))
                        .col(money(Orders::DiscountAmount))
                        .col(money(Orders::TotalAmount))
                        .col(ColumnDef::new(Orders::ShippingAddressId).uuid().not_null())
                        .col(ColumnDef::new(Orders::BillingAddressId).uuid().not_null())
                        .col(ColumnDef::new(Orders::Notes).text().null())
                        .col(
                            ColumnDef::new(Orders::DeliveredAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
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
                        .name("idx_orders_status")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderItems::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::VariantId).uuid().null())
                        .col(ColumnDef::new(OrderItems::Sku).string().not_null())
                        .col(ColumnDef::new(OrderItems::Name).string().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::UnitPrice)
                                .decimal_len(super::MONEY_PRECISION, super::MONEY_SCALE)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::LineTotal)
                                .decimal_len(super::MONEY_PRECISION, super::MONEY_SCALE)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
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
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden, Clone, Copy)]
    enum Orders {
        Table,
        Id,
        OrderNumber,
        UserId,
        Status,
        Currency,
        Subtotal,
        TaxAmount,
        ShippingAmount,
        DiscountAmount,
        TotalAmount,
        ShippingAddressId,
        BillingAddressId,
        Notes,
        DeliveredAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        ProductId,
        VariantId,
        Sku,
        Name,
        Quantity,
        UnitPrice,
        LineTotal,
        CreatedAt,
    }
}

mod m20240601_000005_create_payments_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000005_create_payments_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Payments::OrderId).uuid().not_null())
                        .col(ColumnDef::new(Payments::Amount).big_integer().not_null())
                        .col(ColumnDef::new(Payments::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Payments::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Payments::Method).string().not_null())
                        .col(ColumnDef::new(Payments::Gateway).string().not_null())
                        .col(ColumnDef::new(Payments::GatewayIntentId).string().null())
                        .col(ColumnDef::new(Payments::GatewayMetadata).json().null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_order_id")
                                .from(Payments::Table, Payments::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_gateway_intent_id")
                        .table(Payments::Table)
                        .col(Payments::GatewayIntentId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_order_id")
                        .table(Payments::Table)
                        .col(Payments::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_status_updated_at")
                        .table(Payments::Table)
                        .col(Payments::Status)
                        .col(Payments::UpdatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Refunds::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Refunds::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Refunds::PaymentId).uuid().not_null())
                        .col(ColumnDef::new(Refunds::OrderId).uuid().not_null())
                        .col(ColumnDef::new(Refunds::Amount).big_integer().not_null())
                        .col(ColumnDef::new(Refunds::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Refunds::Reason).text().not_null())
                        .col(ColumnDef::new(Refunds::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Refunds::ExternalRefundId).string().null())
                        .col(ColumnDef::new(Refunds::Metadata).json().null())
                        .col(
                            ColumnDef::new(Refunds::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Refunds::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_refunds_payment_id")
                                .from(Refunds::Table, Refunds::PaymentId)
                                .to(Payments::Table, Payments::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_refunds_payment_id")
                        .table(Refunds::Table)
                        .col(Refunds::PaymentId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Refunds::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        OrderId,
        Amount,
        Currency,
        Status,
        Method,
        Gateway,
        GatewayIntentId,
        GatewayMetadata,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Refunds {
        Table,
        Id,
        PaymentId,
        OrderId,
        Amount,
        Currency,
        Reason,
        Status,
        ExternalRefundId,
        Metadata,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectionTrait, Database, Statement};

    #[tokio::test]
    async fn migrations_apply_on_in_memory_sqlite() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        for table in [
            "customers",
            "products",
            "product_variants",
            "carts",
            "orders",
            "order_items",
            "payments",
            "refunds",
        ] {
            let row = db
                .query_one(Statement::from_string(
                    db.get_database_backend(),
                    format!(
                        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = '{}'",
                        table
                    ),
                ))
                .await
                .unwrap();
            assert!(row.is_some(), "missing table {}", table);
        }
    }
}
