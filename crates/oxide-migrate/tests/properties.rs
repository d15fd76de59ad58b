//! Property-based tests for building and reading back live tables.

use oxide_migrate::prelude::*;
use oxide_schema::prelude::*;
use proptest::prelude::*;

fn column_type() -> impl Strategy<Value = ColumnType> {
    prop::sample::select(vec![
        ColumnType::Int,
        ColumnType::BigInt,
        ColumnType::Str,
        ColumnType::Text,
        ColumnType::Double,
        ColumnType::Decimal,
        ColumnType::Bool,
        ColumnType::DateTime,
        ColumnType::Binary,
    ])
}

fn column(name: String) -> impl Strategy<Value = Column> {
    (
        column_type(),
        any::<bool>(),
        prop::option::of(0i64..1000),
        any::<bool>(),
        prop::bool::weighted(0.2),
    )
        .prop_map(move |(isa, nullable, default, indexed, unique)| {
            let mut column = Column::new(name.clone(), isa);
            if isa == ColumnType::Str {
                column = column.length(64);
            }
            if !nullable {
                column = column.not_null();
            }
            if let Some(value) = default.filter(|_| isa.is_integer()) {
                column = column.default(DefaultValue::Integer(value));
            }
            if unique {
                column = column.unique();
            } else if indexed {
                column = column.indexed();
            }
            column
        })
}

fn table() -> impl Strategy<Value = TableSchema> {
    prop::collection::btree_set("c_[a-z]{1,6}", 1..6)
        .prop_flat_map(|names| names.into_iter().map(column).collect::<Vec<_>>())
        .prop_map(|columns| {
            columns
                .into_iter()
                .fold(TableSchema::new("items"), TableSchema::column)
        })
}

async fn live_diff(registry: SchemaRegistry) -> DatabaseDiff {
    let source = DataSourceConfig::from_dsn("sqlite::memory:")
        .normalize("default")
        .unwrap();
    let connection = Connection::open(&source).await.unwrap();
    DatabaseBuilder::new(connection.clone())
        .build(&registry)
        .await
        .unwrap();
    let diff = MigrationManager::new(connection.clone())
        .diff_live(&registry)
        .await
        .unwrap();
    connection.close().await;
    diff
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn built_tables_read_back_unchanged(table in table()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let registry = SchemaRegistry::new().table(table);

        let diff = runtime.block_on(live_diff(registry));
        prop_assert!(diff.is_empty(), "unexpected changes: {:?}", diff);
        prop_assert!(diff.unmanaged_tables.is_empty());
    }
}
