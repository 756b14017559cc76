//! Initial schema migration - creates all tables from scratch.
//!
//! - `currencies`: per-tenant currencies (read only for the engine)
//! - `contacts`: per-tenant contacts (read only for the engine)
//! - `values`: stored-value accounts
//! - `transactions`: immutable transaction headers, chained by
//!   `next_transaction_id`
//! - `transaction_steps`: per-rail changes of each transaction
//! - `contact_values`: generic codes shared with contacts
//!
//! Every table is keyed by `(tenant_id, <id>)`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// ─────────────────────────────────────────────────────────────────────────────
// Table identifiers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Iden)]
enum Currencies {
    Table,
    TenantId,
    Code,
    Name,
    Symbol,
    DecimalPlaces,
}

#[derive(Iden)]
enum Contacts {
    Table,
    TenantId,
    Id,
    CreatedDate,
}

#[derive(Iden)]
enum Values {
    Table,
    TenantId,
    Id,
    Currency,
    Balance,
    UsesRemaining,
    ProgramId,
    IsGenericCode,
    PerContactBalance,
    PerContactUsesRemaining,
    CodeHashed,
    CodeLastFour,
    ContactId,
    AttachedFromValueId,
    Active,
    Frozen,
    Canceled,
    Pretax,
    Discount,
    DiscountSellerLiability,
    BalanceRule,
    RedemptionRule,
    StartDate,
    EndDate,
    Metadata,
    CreatedDate,
    UpdatedDate,
    CreatedBy,
}

#[derive(Iden)]
enum Transactions {
    Table,
    TenantId,
    Id,
    TransactionType,
    Currency,
    Totals,
    LineItems,
    PaymentSources,
    Tax,
    Pending,
    PendingVoidDate,
    RootTransactionId,
    NextTransactionId,
    RequestHash,
    CreatedDate,
    CreatedBy,
    Metadata,
}

#[derive(Iden)]
enum TransactionSteps {
    Table,
    TenantId,
    Id,
    TransactionId,
    Position,
    Rail,
    ValueId,
    ContactId,
    Code,
    BalanceBefore,
    BalanceAfter,
    BalanceChange,
    UsesRemainingBefore,
    UsesRemainingAfter,
    UsesRemainingChange,
    BalanceRule,
    ChargeId,
    Charge,
    InternalId,
    CreatedDate,
}

#[derive(Iden)]
enum ContactValues {
    Table,
    TenantId,
    Id,
    ValueId,
    ContactId,
    CreatedDate,
}

// ─────────────────────────────────────────────────────────────────────────────
// Migration implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ───────────────────────────────────────────────────────────────────
        // 1. Currencies
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Currencies::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Currencies::TenantId).string().not_null())
                    .col(ColumnDef::new(Currencies::Code).string().not_null())
                    .col(ColumnDef::new(Currencies::Name).string().not_null())
                    .col(ColumnDef::new(Currencies::Symbol).string().not_null())
                    .col(
                        ColumnDef::new(Currencies::DecimalPlaces)
                            .integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(Currencies::TenantId)
                            .col(Currencies::Code),
                    )
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 2. Contacts
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Contacts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Contacts::TenantId).string().not_null())
                    .col(ColumnDef::new(Contacts::Id).string().not_null())
                    .col(
                        ColumnDef::new(Contacts::CreatedDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(Index::create().col(Contacts::TenantId).col(Contacts::Id))
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 3. Values
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Values::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Values::TenantId).string().not_null())
                    .col(ColumnDef::new(Values::Id).string().not_null())
                    .col(ColumnDef::new(Values::Currency).string().not_null())
                    .col(ColumnDef::new(Values::Balance).big_integer())
                    .col(ColumnDef::new(Values::UsesRemaining).big_integer())
                    .col(ColumnDef::new(Values::ProgramId).string())
                    .col(ColumnDef::new(Values::IsGenericCode).boolean().not_null())
                    .col(ColumnDef::new(Values::PerContactBalance).big_integer())
                    .col(ColumnDef::new(Values::PerContactUsesRemaining).big_integer())
                    .col(ColumnDef::new(Values::CodeHashed).string())
                    .col(ColumnDef::new(Values::CodeLastFour).string())
                    .col(ColumnDef::new(Values::ContactId).string())
                    .col(ColumnDef::new(Values::AttachedFromValueId).string())
                    .col(ColumnDef::new(Values::Active).boolean().not_null())
                    .col(ColumnDef::new(Values::Frozen).boolean().not_null())
                    .col(ColumnDef::new(Values::Canceled).boolean().not_null())
                    .col(ColumnDef::new(Values::Pretax).boolean().not_null())
                    .col(ColumnDef::new(Values::Discount).boolean().not_null())
                    .col(ColumnDef::new(Values::DiscountSellerLiability).string())
                    .col(ColumnDef::new(Values::BalanceRule).json())
                    .col(ColumnDef::new(Values::RedemptionRule).json())
                    .col(ColumnDef::new(Values::StartDate).timestamp_with_time_zone())
                    .col(ColumnDef::new(Values::EndDate).timestamp_with_time_zone())
                    .col(ColumnDef::new(Values::Metadata).json())
                    .col(
                        ColumnDef::new(Values::CreatedDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Values::UpdatedDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Values::CreatedBy).string().not_null())
                    .primary_key(Index::create().col(Values::TenantId).col(Values::Id))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-values-tenant_id-code_hashed-unique")
                    .table(Values::Table)
                    .col(Values::TenantId)
                    .col(Values::CodeHashed)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-values-tenant_id-contact_id")
                    .table(Values::Table)
                    .col(Values::TenantId)
                    .col(Values::ContactId)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 4. Transactions
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Transactions::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Transactions::TenantId).string().not_null())
                    .col(ColumnDef::new(Transactions::Id).string().not_null())
                    .col(
                        ColumnDef::new(Transactions::TransactionType)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::Currency).string().not_null())
                    .col(ColumnDef::new(Transactions::Totals).json())
                    .col(ColumnDef::new(Transactions::LineItems).json())
                    .col(ColumnDef::new(Transactions::PaymentSources).json())
                    .col(ColumnDef::new(Transactions::Tax).json())
                    .col(ColumnDef::new(Transactions::Pending).boolean().not_null())
                    .col(ColumnDef::new(Transactions::PendingVoidDate).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Transactions::RootTransactionId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::NextTransactionId).string())
                    .col(ColumnDef::new(Transactions::RequestHash).string().not_null())
                    .col(
                        ColumnDef::new(Transactions::CreatedDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::CreatedBy).string().not_null())
                    .col(ColumnDef::new(Transactions::Metadata).json())
                    .primary_key(
                        Index::create()
                            .col(Transactions::TenantId)
                            .col(Transactions::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-transactions-tenant_id-created_date")
                    .table(Transactions::Table)
                    .col(Transactions::TenantId)
                    .col(Transactions::CreatedDate)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-transactions-pending_void_date")
                    .table(Transactions::Table)
                    .col(Transactions::PendingVoidDate)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 5. Transaction steps
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(TransactionSteps::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(TransactionSteps::TenantId).string().not_null())
                    .col(ColumnDef::new(TransactionSteps::Id).string().not_null())
                    .col(
                        ColumnDef::new(TransactionSteps::TransactionId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(TransactionSteps::Position).integer().not_null())
                    .col(ColumnDef::new(TransactionSteps::Rail).string().not_null())
                    .col(ColumnDef::new(TransactionSteps::ValueId).string())
                    .col(ColumnDef::new(TransactionSteps::ContactId).string())
                    .col(ColumnDef::new(TransactionSteps::Code).string())
                    .col(ColumnDef::new(TransactionSteps::BalanceBefore).big_integer())
                    .col(ColumnDef::new(TransactionSteps::BalanceAfter).big_integer())
                    .col(ColumnDef::new(TransactionSteps::BalanceChange).big_integer())
                    .col(ColumnDef::new(TransactionSteps::UsesRemainingBefore).big_integer())
                    .col(ColumnDef::new(TransactionSteps::UsesRemainingAfter).big_integer())
                    .col(ColumnDef::new(TransactionSteps::UsesRemainingChange).big_integer())
                    .col(ColumnDef::new(TransactionSteps::BalanceRule).json())
                    .col(ColumnDef::new(TransactionSteps::ChargeId).string())
                    .col(ColumnDef::new(TransactionSteps::Charge).json())
                    .col(ColumnDef::new(TransactionSteps::InternalId).string())
                    .col(
                        ColumnDef::new(TransactionSteps::CreatedDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(TransactionSteps::TenantId)
                            .col(TransactionSteps::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-transaction_steps-transaction")
                            .from(
                                TransactionSteps::Table,
                                (TransactionSteps::TenantId, TransactionSteps::TransactionId),
                            )
                            .to(
                                Transactions::Table,
                                (Transactions::TenantId, Transactions::Id),
                            )
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-transaction_steps-transaction-position-unique")
                    .table(TransactionSteps::Table)
                    .col(TransactionSteps::TenantId)
                    .col(TransactionSteps::TransactionId)
                    .col(TransactionSteps::Position)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-transaction_steps-tenant_id-value_id")
                    .table(TransactionSteps::Table)
                    .col(TransactionSteps::TenantId)
                    .col(TransactionSteps::ValueId)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 6. Contact values
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(ContactValues::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ContactValues::TenantId).string().not_null())
                    .col(ColumnDef::new(ContactValues::Id).string().not_null())
                    .col(ColumnDef::new(ContactValues::ValueId).string().not_null())
                    .col(ColumnDef::new(ContactValues::ContactId).string().not_null())
                    .col(
                        ColumnDef::new(ContactValues::CreatedDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(ContactValues::TenantId)
                            .col(ContactValues::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-contact_values-tenant_id-contact_id")
                    .table(ContactValues::Table)
                    .col(ContactValues::TenantId)
                    .col(ContactValues::ContactId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ContactValues::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TransactionSteps::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Transactions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Values::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Contacts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Currencies::Table).to_owned())
            .await?;
        Ok(())
    }
}
