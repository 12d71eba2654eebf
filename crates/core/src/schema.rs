//! Schema translation from warehouse column descriptors to local column
//! definitions, plus the DDL rendered from them.

use serde::{Deserialize, Serialize};

/// Column descriptor as reported by the source warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    /// Base type name, e.g. `NUMBER`, `VARCHAR`, `TIMESTAMP_NTZ`.
    pub data_type: String,
    pub max_length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub nullable: bool,
}

impl SourceColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            max_length: None,
            precision: None,
            scale: None,
            nullable: true,
        }
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Destination type token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationType {
    Double,
    /// Variable-length string, with the declared maximum when known.
    Varchar(Option<u32>),
    Boolean,
    Date,
    Timestamp,
}

impl DestinationType {
    /// Map a source base type. Unknown types fall back to `VARCHAR`.
    pub fn from_source(data_type: &str, max_length: Option<u32>) -> Self {
        let base = data_type
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase();

        match base.as_str() {
            "NUMBER" | "DECIMAL" | "NUMERIC" | "INT" | "INTEGER" | "BIGINT" | "SMALLINT"
            | "TINYINT" | "BYTEINT" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE"
            | "DOUBLE PRECISION" | "REAL" => Self::Double,
            "VARCHAR" | "CHAR" | "CHARACTER" | "NCHAR" | "NVARCHAR" | "STRING" | "TEXT" => {
                Self::Varchar(max_length.filter(|len| *len > 0))
            }
            "BOOLEAN" => Self::Boolean,
            "DATE" => Self::Date,
            "TIMESTAMP" | "TIMESTAMP_NTZ" | "TIMESTAMP_LTZ" | "TIMESTAMP_TZ" | "DATETIME" => {
                Self::Timestamp
            }
            _ => Self::Varchar(None),
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Self::Double => "DOUBLE".to_string(),
            Self::Varchar(Some(len)) => format!("VARCHAR({len})"),
            Self::Varchar(None) => "VARCHAR".to_string(),
            Self::Boolean => "BOOLEAN".to_string(),
            Self::Date => "DATE".to_string(),
            Self::Timestamp => "TIMESTAMP".to_string(),
        }
    }
}

/// Column definition for the local mirrored table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationColumn {
    pub name: String,
    /// Source base type the column was translated from.
    pub source_type: String,
    /// Rendered destination type, e.g. `VARCHAR(255)`.
    pub destination_type: String,
    pub nullable: bool,
}

impl DestinationColumn {
    /// `"NAME" TYPE [NOT NULL]`
    pub fn definition(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.destination_type);
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }
}

pub fn translate_column(column: &SourceColumn) -> DestinationColumn {
    let ty = DestinationType::from_source(&column.data_type, column.max_length);
    DestinationColumn {
        name: column.name.clone(),
        source_type: column.data_type.clone(),
        destination_type: ty.to_sql(),
        nullable: column.nullable,
    }
}

/// Translate an ordered column list, preserving order.
pub fn translate_columns(columns: &[SourceColumn]) -> Vec<DestinationColumn> {
    columns.iter().map(translate_column).collect()
}

/// Quote an identifier for the local store, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Local name of the mirrored table for `schema.table`.
pub fn destination_table_name(schema_name: &str, table_name: &str) -> String {
    format!("{schema_name}.{table_name}")
}

/// `CREATE TABLE IF NOT EXISTS` statement for a mirrored table.
pub fn create_table_sql(table: &str, columns: &[DestinationColumn]) -> String {
    let defs = columns
        .iter()
        .map(DestinationColumn::definition)
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({defs})", quote_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn maps_known_types() {
        let cols = translate_columns(&[
            SourceColumn::new("ID", "NUMBER").with_precision(38, 0).not_null(),
            SourceColumn::new("NAME", "VARCHAR").with_max_length(255),
            SourceColumn::new("ACTIVE", "BOOLEAN"),
            SourceColumn::new("SHIPPED_ON", "DATE"),
            SourceColumn::new("UPDATED_AT", "TIMESTAMP_LTZ"),
            SourceColumn::new("PRICE", "FLOAT"),
        ]);

        let types: Vec<_> = cols.iter().map(|c| c.destination_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["DOUBLE", "VARCHAR(255)", "BOOLEAN", "DATE", "TIMESTAMP", "DOUBLE"]
        );
        assert!(!cols[0].nullable);
        assert!(cols[1].nullable);
    }

    #[test]
    fn unknown_types_become_varchar() {
        assert_eq!(
            DestinationType::from_source("GEOGRAPHY", None),
            DestinationType::Varchar(None)
        );
        assert_eq!(
            DestinationType::from_source("VARIANT", Some(16)),
            DestinationType::Varchar(None)
        );
    }

    #[test]
    fn parameterized_and_lowercase_types_are_recognized() {
        assert_eq!(
            DestinationType::from_source("number(10,2)", None),
            DestinationType::Double
        );
        assert_eq!(
            DestinationType::from_source("timestamp_tz", None),
            DestinationType::Timestamp
        );
    }

    #[test]
    fn create_table_renders_not_null_and_quotes() {
        let cols = translate_columns(&[
            SourceColumn::new("ID", "NUMBER").not_null(),
            SourceColumn::new("NOTE", "TEXT").with_max_length(10),
        ]);
        let sql = create_table_sql(&destination_table_name("sales", "orders"), &cols);

        assert_eq!(
            sql,
            r#"CREATE TABLE IF NOT EXISTS "sales.orders" ("ID" DOUBLE NOT NULL, "NOTE" VARCHAR(10))"#
        );
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident(r#"a"b"#), r#""a""b""#);
    }

    proptest! {
        #[test]
        fn translation_preserves_order_and_nullability(
            cols in proptest::collection::vec(
                ("[A-Z][A-Z0-9_]{0,12}", "[A-Za-z_]{1,16}", proptest::option::of(1u32..10_000), any::<bool>()),
                0..20,
            )
        ) {
            let source: Vec<SourceColumn> = cols
                .iter()
                .map(|(name, ty, len, nullable)| SourceColumn {
                    name: name.clone(),
                    data_type: ty.clone(),
                    max_length: *len,
                    precision: None,
                    scale: None,
                    nullable: *nullable,
                })
                .collect();

            let translated = translate_columns(&source);
            prop_assert_eq!(translated.len(), source.len());
            for (src, dst) in source.iter().zip(&translated) {
                prop_assert_eq!(&src.name, &dst.name);
                prop_assert_eq!(src.nullable, dst.nullable);
                prop_assert!(!dst.destination_type.is_empty());
            }
            prop_assert_eq!(translate_columns(&source), translated);
        }
    }
}
