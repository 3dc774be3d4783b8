//! Derived queries over completed table snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use tracing::{debug, info, warn};

use datafeed_core::TableRef;

use crate::error::WarehouseError;
use crate::marker::MarkerUpdate;
use crate::table::{GuardedWarehouse, TableSnapshot};

/// Computes a derived table from its input tables, given in dependency order.
pub trait DerivedQuery: Send + Sync {
    fn describe(&self) -> String;

    fn execute(&self, inputs: &[TableSnapshot]) -> Result<RecordBatch, WarehouseError>;
}

/// Hash equi-join folded left to right across every input.
///
/// Rows whose key contains a NULL never match. A key column must have the
/// same type in every input; no coercion is attempted, so load integer-like
/// ids through `string_columns` on every side or on none. Right-hand non-key
/// columns whose name is already taken get the right table's name as a prefix.
#[derive(Debug, Clone)]
pub struct InnerJoin {
    pub on: Vec<String>,
}

impl InnerJoin {
    pub fn new(on: Vec<String>) -> Self {
        Self { on }
    }

    fn key_columns<'a>(&self, batch: &'a RecordBatch, table: &str) -> Result<Vec<&'a ArrayRef>, WarehouseError> {
        self.on
            .iter()
            .map(|name| {
                batch.column_by_name(name).ok_or_else(|| {
                    WarehouseError::Query(format!("join key '{name}' missing from {table}"))
                })
            })
            .collect()
    }

    fn join_pair(&self, left: &RecordBatch, right: &RecordBatch, right_name: &str) -> Result<RecordBatch, WarehouseError> {
        let left_keys = self.key_columns(left, "left input")?;
        let right_keys = self.key_columns(right, right_name)?;
        for ((name, l), r) in self.on.iter().zip(&left_keys).zip(&right_keys) {
            if l.data_type() != r.data_type() {
                return Err(WarehouseError::Query(format!(
                    "join key '{name}' is {} on the left but {} in {right_name}",
                    l.data_type(),
                    r.data_type()
                )));
            }
        }

        let mut index: HashMap<Vec<String>, Vec<u32>> = HashMap::new();
        for row in 0..right.num_rows() {
            if let Some(key) = row_key(&right_keys, row)? {
                index.entry(key).or_default().push(row as u32);
            }
        }

        let (mut left_rows, mut right_rows) = (Vec::new(), Vec::new());
        for row in 0..left.num_rows() {
            let Some(key) = row_key(&left_keys, row)? else { continue };
            if let Some(matches) = index.get(&key) {
                for &r in matches {
                    left_rows.push(row as u32);
                    right_rows.push(r);
                }
            }
        }
        let left_idx = UInt32Array::from(left_rows);
        let right_idx = UInt32Array::from(right_rows);

        let mut fields: Vec<Field> = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();
        for (field, column) in left.schema().fields().iter().zip(left.columns()) {
            fields.push(Field::new(field.name(), field.data_type().clone(), true));
            columns.push(take(column.as_ref(), &left_idx, None)?);
        }
        for (field, column) in right.schema().fields().iter().zip(right.columns()) {
            if self.on.contains(field.name()) {
                continue;
            }
            let name = if left.schema().field_with_name(field.name()).is_ok() {
                format!("{right_name}_{}", field.name())
            } else {
                field.name().clone()
            };
            fields.push(Field::new(name, field.data_type().clone(), true));
            columns.push(take(column.as_ref(), &right_idx, None)?);
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }
}

/// Keys are compared by their display text, which is exact once both sides
/// share a type.
fn row_key(columns: &[&ArrayRef], row: usize) -> Result<Option<Vec<String>>, WarehouseError> {
    let mut key = Vec::with_capacity(columns.len());
    for column in columns {
        if column.is_null(row) {
            return Ok(None);
        }
        key.push(array_value_to_string(column.as_ref(), row)?);
    }
    Ok(Some(key))
}

impl DerivedQuery for InnerJoin {
    fn describe(&self) -> String {
        format!("inner join on ({})", self.on.join(", "))
    }

    fn execute(&self, inputs: &[TableSnapshot]) -> Result<RecordBatch, WarehouseError> {
        if self.on.is_empty() {
            return Err(WarehouseError::Query("inner join needs at least one key".into()));
        }
        let Some((first, rest)) = inputs.split_first() else {
            return Err(WarehouseError::Query("inner join needs inputs".into()));
        };
        let mut acc = first.batch.clone();
        for input in rest {
            acc = self.join_pair(&acc, &input.batch, &input.table.table)?;
        }
        Ok(acc)
    }
}

/// A finished derived query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    pub job_id: String,
    pub row_count: u64,
    pub fingerprint: String,
    /// `(table, version)` of every input consumed.
    pub inputs: Vec<(TableRef, u64)>,
    pub marker: MarkerUpdate,
}

/// Run `query` over completed snapshots of `inputs` and replace `destination`.
/// The destination marker is left `failed` on any error after it began.
pub async fn run_derived(
    warehouse: &GuardedWarehouse,
    job_id: &str,
    destination: &TableRef,
    inputs: &[TableRef],
    query: &dyn DerivedQuery,
) -> Result<QueryOutcome, WarehouseError> {
    warehouse.begin_attempt(destination, job_id).await?;
    info!(job_id, table = %destination, query = %query.describe(), "derived query started");

    let result = async {
        let mut snapshots = Vec::with_capacity(inputs.len());
        for table in inputs {
            snapshots.push(warehouse.read_completed(table).await?);
        }
        debug!(job_id, inputs = snapshots.len(), "inputs read");
        let batch = query.execute(&snapshots)?;
        let commit = warehouse.commit_attempt(destination, job_id, &batch).await?;
        Ok::<_, WarehouseError>(QueryOutcome {
            job_id: job_id.to_string(),
            row_count: commit.summary.row_count,
            fingerprint: commit.summary.fingerprint,
            inputs: snapshots.into_iter().map(|s| (s.table, s.version)).collect(),
            marker: commit.marker,
        })
    }
    .await;

    match result {
        Ok(outcome) => {
            info!(job_id, table = %destination, rows = outcome.row_count, "derived query completed");
            Ok(outcome)
        }
        Err(e) => {
            if let Err(mark_err) = warehouse.fail_attempt(destination, job_id, &e.to_string()).await {
                warn!(job_id, error = %mark_err, "could not record failed derived query");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::DataType;

    fn snapshot(table: &str, columns: Vec<(&str, ArrayRef)>) -> TableSnapshot {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, col)| Field::new(*name, col.data_type().clone(), true))
            .collect();
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(fields)),
            columns.into_iter().map(|(_, c)| c).collect(),
        )
        .unwrap();
        TableSnapshot {
            table: TableRef::new("census", table),
            batch,
            job_id: format!("{table}_job"),
            version: 1,
        }
    }

    fn strings(values: &[Option<&str>]) -> ArrayRef {
        Arc::new(StringArray::from(values.to_vec()))
    }

    fn ints(values: &[i64]) -> ArrayRef {
        Arc::new(Int64Array::from(values.to_vec()))
    }

    #[test]
    fn joins_matching_rows_in_left_order() {
        let income = snapshot(
            "INCOME",
            vec![
                ("state", strings(&[Some("01"), Some("02"), Some("04")])),
                ("value", ints(&[100, 200, 400])),
            ],
        );
        let population = snapshot(
            "POPULATION",
            vec![
                ("state", strings(&[Some("04"), Some("01"), Some("99")])),
                ("value", ints(&[4_000, 1_000, 9])),
            ],
        );

        let out = InnerJoin::new(vec!["state".into()]).execute(&[income, population]).unwrap();
        assert_eq!(out.num_rows(), 2);

        let schema = out.schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["state", "value", "POPULATION_value"]);

        let state = out.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(state.value(0), "01");
        assert_eq!(state.value(1), "04");
        let pop = out.column(2).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!((pop.value(0), pop.value(1)), (1_000, 4_000));
    }

    #[test]
    fn null_keys_never_match() {
        let a = snapshot("A", vec![("k", strings(&[None, Some("x")])), ("a", ints(&[1, 2]))]);
        let b = snapshot("B", vec![("k", strings(&[None, Some("x")])), ("b", ints(&[3, 4]))]);
        let out = InnerJoin::new(vec!["k".into()]).execute(&[a, b]).unwrap();
        assert_eq!(out.num_rows(), 1);
    }

    #[test]
    fn duplicate_right_keys_fan_out() {
        let a = snapshot("A", vec![("k", strings(&[Some("x")]))]);
        let b = snapshot("B", vec![("k", strings(&[Some("x"), Some("x")])), ("b", ints(&[1, 2]))]);
        let out = InnerJoin::new(vec!["k".into()]).execute(&[a, b]).unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn folds_across_three_inputs() {
        let a = snapshot("A", vec![("k", ints(&[1, 2, 3])), ("a", ints(&[10, 20, 30]))]);
        let b = snapshot("B", vec![("k", ints(&[2, 3])), ("b", ints(&[200, 300]))]);
        let c = snapshot("C", vec![("k", ints(&[3])), ("c", ints(&[3_000]))]);
        let out = InnerJoin::new(vec!["k".into()]).execute(&[a, b, c]).unwrap();
        assert_eq!(out.num_rows(), 1);
        assert_eq!(out.num_columns(), 4);
        assert_eq!(out.schema().field(3).data_type(), &DataType::Int64);
    }

    #[test]
    fn key_type_mismatch_is_a_query_error() {
        let a = snapshot("A", vec![("k", ints(&[1])), ("a", ints(&[10]))]);
        let b = snapshot("B", vec![("k", strings(&[Some("1")])), ("b", ints(&[20]))]);
        let err = InnerJoin::new(vec!["k".into()]).execute(&[a, b]).unwrap_err();
        assert!(matches!(err, WarehouseError::Query(_)));
        assert!(err.to_string().contains("Int64"));
        assert!(err.to_string().contains("Utf8"));
    }

    #[test]
    fn missing_key_is_a_query_error() {
        let a = snapshot("A", vec![("k", ints(&[1]))]);
        let b = snapshot("B", vec![("other", ints(&[1]))]);
        let err = InnerJoin::new(vec!["k".into()]).execute(&[a, b]).unwrap_err();
        assert!(err.to_string().contains("B"));
    }
}
