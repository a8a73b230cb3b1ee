use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Device::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Device::DeviceId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Device::Secret).string())
                    .col(ColumnDef::new(Device::ClaimOwner).string())
                    .col(ColumnDef::new(Device::ClaimedAt).big_integer())
                    .col(ColumnDef::new(Device::ActivationCode).string())
                    .col(ColumnDef::new(Device::ActivationCodeExpiresAt).big_integer())
                    .col(
                        ColumnDef::new(Device::FailedAttempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Device::LockedUntil).big_integer())
                    .col(ColumnDef::new(Device::CreatedAt).big_integer().not_null())
                    .col(
                        ColumnDef::new(Device::Version)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim lookups go by code; expiry is filtered in the same query
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_activation_code")
                    .table(Device::Table)
                    .col(Device::ActivationCode)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_activation_code_expires_at")
                    .table(Device::Table)
                    .col(Device::ActivationCodeExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Device::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Device {
    #[sea_orm(iden = "devices")]
    Table,
    DeviceId,
    Secret,
    ClaimOwner,
    ClaimedAt,
    ActivationCode,
    ActivationCodeExpiresAt,
    FailedAttempts,
    LockedUntil,
    CreatedAt,
    Version,
}
