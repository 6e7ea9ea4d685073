use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_telemetry_events_table::Migration),
            Box::new(m20250101_000002_create_anomaly_records_table::Migration),
        ]
    }
}

// Migration implementations

mod m20250101_000001_create_telemetry_events_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_telemetry_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(TelemetryEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TelemetryEvents::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(TelemetryEvents::AssetId).string().not_null())
                        .col(
                            ColumnDef::new(TelemetryEvents::Timestamp)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(TelemetryEvents::Metric).string().not_null())
                        .col(ColumnDef::new(TelemetryEvents::Value).double().not_null())
                        .col(ColumnDef::new(TelemetryEvents::Unit).string().null())
                        .col(ColumnDef::new(TelemetryEvents::Tags).json_binary().null())
                        .to_owned(),
                )
                .await?;

            // Window fetch: exact pair, bounded by time
            manager
                .create_index(
                    Index::create()
                        .name("idx_telemetry_events_asset_metric_ts")
                        .table(TelemetryEvents::Table)
                        .col(TelemetryEvents::AssetId)
                        .col(TelemetryEvents::Metric)
                        .col(TelemetryEvents::Timestamp)
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            // Pair discovery scans by time only
            manager
                .create_index(
                    Index::create()
                        .name("idx_telemetry_events_timestamp")
                        .table(TelemetryEvents::Table)
                        .col(TelemetryEvents::Timestamp)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(TelemetryEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum TelemetryEvents {
        Table,
        Id,
        AssetId,
        Timestamp,
        Metric,
        Value,
        Unit,
        Tags,
    }
}

mod m20250101_000002_create_anomaly_records_table {

    use super::m20250101_000001_create_telemetry_events_table::TelemetryEvents;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_anomaly_records_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(AnomalyRecords::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(AnomalyRecords::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(AnomalyRecords::TelemetryId).uuid().null())
                        .col(ColumnDef::new(AnomalyRecords::AssetId).string().not_null())
                        .col(
                            ColumnDef::new(AnomalyRecords::Timestamp)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(AnomalyRecords::Metric).string().not_null())
                        .col(ColumnDef::new(AnomalyRecords::Score).double().not_null())
                        .col(ColumnDef::new(AnomalyRecords::Explanation).text().null())
                        .col(ColumnDef::new(AnomalyRecords::Details).json_binary().null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_anomaly_records_telemetry_id")
                                .from(AnomalyRecords::Table, AnomalyRecords::TelemetryId)
                                .to(TelemetryEvents::Table, TelemetryEvents::Id)
                                .on_delete(ForeignKeyAction::SetNull),
                        )
                        .to_owned(),
                )
                .await?;

            // Dedup key: one finding per source sample. NULLs stay distinct.
            manager
                .create_index(
                    Index::create()
                        .name("idx_anomaly_records_telemetry_id")
                        .table(AnomalyRecords::Table)
                        .col(AnomalyRecords::TelemetryId)
                        .unique()
                        .if_not_exists()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_anomaly_records_asset_ts")
                        .table(AnomalyRecords::Table)
                        .col(AnomalyRecords::AssetId)
                        .col(AnomalyRecords::Timestamp)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(AnomalyRecords::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum AnomalyRecords {
        Table,
        Id,
        TelemetryId,
        AssetId,
        Timestamp,
        Metric,
        Score,
        Explanation,
        Details,
    }
}
