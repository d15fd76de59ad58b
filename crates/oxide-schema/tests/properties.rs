//! Property-based tests for compilation, diffing and expansion.

use std::collections::BTreeMap;

use oxide_schema::prelude::*;
use proptest::prelude::*;

const DIALECTS: [Driver; 3] = [Driver::Sqlite, Driver::Postgres, Driver::MySql];

fn column_type() -> impl Strategy<Value = ColumnType> {
    prop::sample::select(vec![
        ColumnType::Int,
        ColumnType::BigInt,
        ColumnType::SmallInt,
        ColumnType::Str,
        ColumnType::Text,
        ColumnType::Float,
        ColumnType::Double,
        ColumnType::Decimal,
        ColumnType::Bool,
        ColumnType::Date,
        ColumnType::Time,
        ColumnType::DateTime,
        ColumnType::Binary,
        ColumnType::Json,
        ColumnType::Uuid,
    ])
}

fn column(name: String) -> impl Strategy<Value = Column> {
    (
        column_type(),
        any::<bool>(),
        prop::option::of(-1000i64..1000),
        any::<bool>(),
        prop::bool::weighted(0.2),
    )
        .prop_map(move |(isa, nullable, default, indexed, is_virtual)| {
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
            if is_virtual {
                column = column.as_virtual();
            } else if indexed {
                column = column.indexed();
            }
            column
        })
}

fn columns() -> impl Strategy<Value = Vec<Column>> {
    prop::collection::btree_set("c_[a-z]{1,6}", 1..8).prop_flat_map(|names| {
        names
            .into_iter()
            .map(column)
            .collect::<Vec<_>>()
    })
}

fn expanded_table(name: &str, columns: Vec<Column>) -> TableSchema {
    let mut table = columns
        .into_iter()
        .fold(TableSchema::new(name), TableSchema::column);
    table.expand_with(|_| None).unwrap();
    table
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        .. ProptestConfig::default()
    })]

    // Compiling the same schema twice yields byte-identical SQL
    #[test]
    fn compilation_is_deterministic(cols in columns()) {
        let table = expanded_table("items", cols);
        for driver in DIALECTS {
            let compiler = SchemaCompiler::new(driver.dialect());
            let first = compiler.compile(&table).unwrap();
            let second = compiler.compile(&table.clone()).unwrap();
            prop_assert_eq!(first, second);
        }
    }

    // N real and M virtual columns compile to exactly N column definitions
    #[test]
    fn virtual_columns_are_excluded(cols in columns()) {
        let table = expanded_table("items", cols);
        let persisted = table.persisted_columns().count();
        let virtual_names: Vec<String> = table
            .columns
            .iter()
            .filter(|c| c.is_virtual)
            .map(|c| c.name.clone())
            .collect();

        let statements = SchemaCompiler::new(Driver::Sqlite.dialect()).compile(&table).unwrap();
        let create = &statements[0];
        let definitions = create.lines().filter(|l| l.starts_with("  \"")).count();

        prop_assert_eq!(definitions, persisted);
        for name in virtual_names {
            let quoted = format!("\"{name}\"");
            prop_assert!(statements.iter().all(|s| !s.contains(&quoted)));
        }
    }

    // Every one-sided column yields exactly one Add/Drop, drops never precede
    // adds or modifies, and replaying the report over `actual` reaches `declared`
    #[test]
    fn diff_is_complete_and_ordered(
        declared_cols in columns(),
        actual_cols in columns(),
        driver in prop::sample::select(DIALECTS.to_vec()),
        rebuild in any::<bool>(),
    ) {
        let declared = expanded_table("t", declared_cols);
        // Introspected tables never carry virtual columns.
        let actual_cols = actual_cols.into_iter().filter(|c| !c.is_virtual).collect();
        let actual = expanded_table("t", actual_cols);
        let policy = if rebuild { ModifyPolicy::Rebuild } else { ModifyPolicy::DropAndAdd };
        let engine = SchemaDiffEngine::new(driver.dialect()).with_policy(policy);

        let report = engine.diff_table(&declared, &actual).unwrap();

        prop_assert!(report.entries.windows(2).all(|w| w[0].operation <= w[1].operation));

        for column in declared.persisted_columns() {
            let adds = report
                .entries_of(DiffOperation::AddColumn)
                .filter(|e| e.column == column.name)
                .count();
            let expected = usize::from(actual.get_column(&column.name).is_none());
            prop_assert_eq!(adds, expected);
        }
        for column in actual.persisted_columns() {
            let drops = report
                .entries_of(DiffOperation::DropColumn)
                .filter(|e| e.column == column.name)
                .count();
            let expected = usize::from(declared.get_column(&column.name).is_none());
            prop_assert_eq!(drops, expected);
        }

        let mut state: BTreeMap<String, Column> = actual
            .persisted_columns()
            .map(|c| (c.name.clone(), c.clone()))
            .collect();
        for entry in &report.entries {
            match entry.operation {
                DiffOperation::AddColumn | DiffOperation::ModifyColumn => {
                    let column = declared.get_column(&entry.column).unwrap();
                    state.insert(entry.column.clone(), column.clone());
                }
                DiffOperation::DropColumn => {
                    state.remove(&entry.column);
                }
                DiffOperation::AddIndex | DiffOperation::DropIndex => {}
            }
        }
        // A live column whose name is declared virtual is left in place.
        let names: Vec<&String> = state
            .keys()
            .filter(|name| declared.get_column(name).is_some_and(|c| !c.is_virtual))
            .collect();
        let mut expected: Vec<&String> = declared.persisted_columns().map(|c| &c.name).collect();
        expected.sort();
        prop_assert_eq!(names, expected);
        for column in declared.persisted_columns() {
            let change = engine.compare(column, &state[&column.name]).unwrap();
            prop_assert!(!change.any());
        }
    }

    // Expanding mixins twice produces the same columns as expanding once
    #[test]
    fn mixin_expansion_is_idempotent(
        own in columns(),
        first in columns(),
        second in columns(),
        locales in prop::collection::vec("[a-z]{2}", 0..3),
    ) {
        let mut own = own;
        if let Some(column) = own.first_mut() {
            column.locales = locales;
        }
        let registry = SchemaRegistry::new()
            .mixin(first.into_iter().fold(MixinSchema::new("first"), MixinSchema::column))
            .mixin(second.into_iter().fold(MixinSchema::new("second"), MixinSchema::column));
        let table = own
            .into_iter()
            .fold(TableSchema::new("t"), TableSchema::column)
            .mixin("first")
            .mixin("second");

        let mut once = table.clone();
        registry.expand(&mut once).unwrap();
        let mut twice = once.clone();
        registry.expand(&mut twice).unwrap();
        prop_assert_eq!(&once.columns, &twice.columns);

        // Replaying the pass over the flattened columns is stable too.
        let mut replay = once
            .columns
            .iter()
            .cloned()
            .fold(TableSchema::new("t"), TableSchema::column)
            .mixin("first")
            .mixin("second");
        registry.expand(&mut replay).unwrap();
        prop_assert_eq!(&once.columns, &replay.columns);

        let mut names: Vec<&str> = once.columns.iter().map(|c| c.name.as_str()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        prop_assert_eq!(names.len(), total);
    }
}
