use std::collections::HashSet;

use thiserror::Error;

/// Columns a batch schema may hold.
pub const SCHEMA_MAX_COLUMNS: usize = 1 << 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    Integer,
    BigInt,
    Float,
    VarChar,
    Blob,
}

impl DataType {
    /// Estimated bytes of one value, used for quota accounting only.
    pub fn estimated_size(&self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::Integer => 4,
            DataType::BigInt | DataType::Float => 8,
            // average inline string
            DataType::VarChar => 32,
            // reference to out of line data
            DataType::Blob => 64,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Integer => "INTEGER",
            DataType::BigInt => "BIGINT",
            DataType::Float => "FLOAT",
            DataType::VarChar => "VARCHAR",
            DataType::Blob => "BLOB",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Column layout of the batches of a tuple buffer.
#[derive(Clone, Debug)]
pub struct BatchSchema {
    columns: Vec<Column>,
    row_size: usize,
}

impl BatchSchema {
    pub fn try_new(columns: Vec<Column>) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::NoColumns);
        }
        if columns.len() > SCHEMA_MAX_COLUMNS {
            return Err(SchemaError::TooManyColumns);
        }
        let mut uniq = HashSet::new();
        if !columns.iter().all(|c| uniq.insert(c.name.as_str())) {
            return Err(SchemaError::UniqueName);
        }

        let nullable = columns.iter().filter(|c| c.nullable).count();
        let row_size = columns
            .iter()
            .map(|c| c.data_type.estimated_size())
            .sum::<usize>()
            + nullable.div_ceil(8);

        Ok(Self { columns, row_size })
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        self.columns.as_slice()
    }

    /// Estimated bytes of one row.
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    /// Estimated KB held in memory by a batch of `rows` rows; never zero.
    pub fn estimate_batch_kb(&self, rows: usize) -> i64 {
        (rows * self.row_size).div_ceil(1024).max(1) as i64
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("a schema needs at least one column")]
    NoColumns,
    #[error("maximum number of columns reached")]
    TooManyColumns,
    #[error("columns must have unique names")]
    UniqueName,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> BatchSchema {
        let columns = vec![
            Column::new("id", DataType::BigInt),
            Column::new("name", DataType::VarChar).nullable(),
            Column::new("score", DataType::Float).nullable(),
        ];

        BatchSchema::try_new(columns).unwrap()
    }

    #[test]
    fn batch_size_estimate() {
        let schema = test_schema();
        assert_eq!(schema.num_columns(), 3);
        assert_eq!(schema.row_size(), 8 + 32 + 8 + 1);
        assert_eq!(schema.estimate_batch_kb(0), 1);
        assert_eq!(schema.estimate_batch_kb(1024), 49);
    }

    #[test]
    fn unique_names() {
        let columns = vec![
            Column::new("a", DataType::Integer),
            Column::new("a", DataType::Boolean),
        ];
        assert_eq!(
            BatchSchema::try_new(columns).unwrap_err(),
            SchemaError::UniqueName
        );
        assert_eq!(
            BatchSchema::try_new(Vec::new()).unwrap_err(),
            SchemaError::NoColumns
        );
    }

    #[test]
    fn display_types() {
        assert_eq!(DataType::VarChar.to_string(), "VARCHAR");
        assert_eq!(test_schema().columns()[2].data_type.to_string(), "FLOAT");
    }
}
