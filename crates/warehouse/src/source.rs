//! Decoding landed objects into Arrow batches with an autodetected schema.
//!
//! Two encodings are accepted, told apart by their first byte: CSV with a
//! header row, and the "values" JSON layout (an array of rows whose first row
//! holds the column names). Either way the first row is the header and the
//! data must be rectangular.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder};
use arrow::compute::{cast, concat_batches};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::WarehouseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    JsonValues,
}

impl SourceFormat {
    /// Sniff the encoding from the first non-whitespace byte.
    pub fn sniff(bytes: &[u8]) -> Self {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'[') => SourceFormat::JsonValues,
            _ => SourceFormat::Csv,
        }
    }
}

/// Per-dataset decoding options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Columns forced to `Utf8`.
    pub string_columns: Vec<String>,
}

/// Decode `bytes` into a single batch. The header row is consumed.
pub fn decode(bytes: &[u8], options: &DecodeOptions) -> Result<RecordBatch, WarehouseError> {
    let format = SourceFormat::sniff(bytes);
    let batch = match format {
        SourceFormat::Csv => decode_csv(bytes, options)?,
        SourceFormat::JsonValues => decode_values(bytes, options)?,
    };
    debug!(
        ?format,
        columns = batch.num_columns(),
        rows = batch.num_rows(),
        "decoded source"
    );
    Ok(batch)
}

/// Decode the parts of one table and stack them in the order given.
///
/// Every part needs the same header. A column inferred differently across
/// parts is widened: `Int64` with `Float64` becomes `Float64`, any other mix
/// becomes `Utf8`.
pub fn decode_parts<B: AsRef<[u8]>>(parts: &[B], options: &DecodeOptions) -> Result<RecordBatch, WarehouseError> {
    let batches = parts
        .iter()
        .map(|part| decode(part.as_ref(), options))
        .collect::<Result<Vec<_>, _>>()?;
    let Some(first) = batches.first() else {
        return Err(WarehouseError::Malformed("no source objects".into()));
    };

    let names: Vec<String> = first.schema().fields().iter().map(|f| f.name().clone()).collect();
    let mut types: Vec<DataType> = first.schema().fields().iter().map(|f| f.data_type().clone()).collect();
    for (i, batch) in batches.iter().enumerate().skip(1) {
        let schema = batch.schema();
        let same_header = schema.fields().len() == names.len()
            && schema.fields().iter().zip(&names).all(|(f, name)| f.name() == name);
        if !same_header {
            return Err(WarehouseError::Malformed(format!(
                "part {} has a different header from part 1",
                i + 1
            )));
        }
        for (ty, field) in types.iter_mut().zip(schema.fields()) {
            *ty = widen(ty, field.data_type());
        }
    }

    let fields: Vec<Field> = names
        .iter()
        .zip(&types)
        .map(|(name, ty)| Field::new(name, ty.clone(), true))
        .collect();
    let schema: SchemaRef = Arc::new(Schema::new(fields));
    let stacked = batches
        .iter()
        .map(|batch| -> Result<RecordBatch, WarehouseError> {
            let columns = batch
                .columns()
                .iter()
                .zip(&types)
                .map(|(column, ty)| cast(column, ty))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(RecordBatch::try_new(schema.clone(), columns)?)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &stacked)?)
}

fn widen(a: &DataType, b: &DataType) -> DataType {
    match (a, b) {
        _ if a == b => a.clone(),
        (DataType::Null, other) | (other, DataType::Null) => other.clone(),
        (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => DataType::Float64,
        _ => DataType::Utf8,
    }
}

// ── CSV ──────────────────────────────────────────────────────────────

fn decode_csv(bytes: &[u8], options: &DecodeOptions) -> Result<RecordBatch, WarehouseError> {
    let format = Format::default().with_header(true);
    let (inferred, _) = format
        .infer_schema(Cursor::new(bytes), None)
        .map_err(|e| WarehouseError::Malformed(format!("csv: {e}")))?;

    let names: Vec<String> = inferred.fields().iter().map(|f| f.name().clone()).collect();
    check_header(&names)?;

    let schema = Arc::new(override_strings(&inferred, options));
    let reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .build(Cursor::new(bytes))
        .map_err(|e| WarehouseError::Malformed(format!("csv: {e}")))?;

    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| WarehouseError::Malformed(format!("csv: {e}")))?;
    Ok(concat_batches(&schema, &batches)?)
}

fn override_strings(schema: &Schema, options: &DecodeOptions) -> Schema {
    for wanted in &options.string_columns {
        if schema.field_with_name(wanted).is_err() {
            warn!(column = %wanted, "string column override names an unknown column");
        }
    }
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| {
            if options.string_columns.iter().any(|c| c == f.name()) {
                Field::new(f.name(), DataType::Utf8, true)
            } else {
                Field::new(f.name(), f.data_type().clone(), true)
            }
        })
        .collect();
    Schema::new(fields)
}

// ── JSON "values" ────────────────────────────────────────────────────

fn decode_values(bytes: &[u8], options: &DecodeOptions) -> Result<RecordBatch, WarehouseError> {
    let rows: Vec<Vec<Value>> = serde_json::from_slice(bytes)
        .map_err(|e| WarehouseError::Malformed(format!("values json: {e}")))?;
    let Some((header, body)) = rows.split_first() else {
        return Err(WarehouseError::Malformed("values json: no header row".into()));
    };

    let names = header
        .iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            other => Err(WarehouseError::Malformed(format!(
                "values json: header cell {other} is not a string"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    check_header(&names)?;

    let mut cells: Vec<Vec<Option<String>>> = Vec::with_capacity(body.len());
    for (i, row) in body.iter().enumerate() {
        if row.len() != names.len() {
            return Err(WarehouseError::Malformed(format!(
                "values json: row {} has {} cells, header has {}",
                i + 1,
                row.len(),
                names.len()
            )));
        }
        cells.push(row.iter().map(cell_text).collect::<Result<_, _>>()?);
    }

    let fields: Vec<Field> = names
        .iter()
        .enumerate()
        .map(|(col, name)| {
            let data_type = if options.string_columns.contains(name) {
                DataType::Utf8
            } else {
                infer_type(cells.iter().filter_map(|r| r[col].as_deref()))
            };
            Field::new(name, data_type, true)
        })
        .collect();
    let schema: SchemaRef = Arc::new(Schema::new(fields));
    let arrays = build_arrays(&cells, &schema);
    Ok(RecordBatch::try_new(schema, arrays)?)
}

fn cell_text(value: &Value) -> Result<Option<String>, WarehouseError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(WarehouseError::Malformed(format!(
            "values json: nested cell {other}"
        ))),
    }
}

/// Narrowest of Int64, Float64, Boolean, Utf8 that fits every non-empty value.
fn infer_type<'a>(values: impl Iterator<Item = &'a str>) -> DataType {
    let (mut int, mut float, mut boolean, mut seen) = (true, true, true, false);
    for v in values.filter(|v| !v.is_empty()) {
        seen = true;
        int &= v.parse::<i64>().is_ok();
        float &= v.parse::<f64>().is_ok();
        boolean &= v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("false");
        if !(int || float || boolean) {
            break;
        }
    }
    match (seen, int, float, boolean) {
        (false, ..) => DataType::Utf8,
        (true, true, _, _) => DataType::Int64,
        (true, _, true, _) => DataType::Float64,
        (true, _, _, true) => DataType::Boolean,
        _ => DataType::Utf8,
    }
}

/// Typed arrays from string cells. Values that do not parse become NULL.
fn build_arrays(rows: &[Vec<Option<String>>], schema: &Schema) -> Vec<ArrayRef> {
    let num_rows = rows.len();

    schema
        .fields()
        .iter()
        .enumerate()
        .map(|(col, field)| -> ArrayRef {
            match field.data_type() {
                DataType::Int64 => {
                    let mut builder = Int64Builder::with_capacity(num_rows);
                    for row in rows {
                        builder.append_option(cell(row, col).and_then(|s| s.parse::<i64>().ok()));
                    }
                    Arc::new(builder.finish())
                }
                DataType::Float64 => {
                    let mut builder = Float64Builder::with_capacity(num_rows);
                    for row in rows {
                        builder.append_option(cell(row, col).and_then(|s| s.parse::<f64>().ok()));
                    }
                    Arc::new(builder.finish())
                }
                DataType::Boolean => {
                    let mut builder = BooleanBuilder::with_capacity(num_rows);
                    for row in rows {
                        builder.append_option(cell(row, col).and_then(|s| {
                            match s.to_ascii_lowercase().as_str() {
                                "true" => Some(true),
                                "false" => Some(false),
                                _ => None,
                            }
                        }));
                    }
                    Arc::new(builder.finish())
                }
                _ => {
                    let mut builder = StringBuilder::with_capacity(num_rows, num_rows * 16);
                    for row in rows {
                        builder.append_option(cell(row, col));
                    }
                    Arc::new(builder.finish())
                }
            }
        })
        .collect()
}

fn cell(row: &[Option<String>], col: usize) -> Option<&str> {
    row.get(col).and_then(|v| v.as_deref())
}

fn check_header(names: &[String]) -> Result<(), WarehouseError> {
    if names.is_empty() {
        return Err(WarehouseError::Malformed("empty header row".into()));
    }
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(WarehouseError::Malformed("header has an empty column name".into()));
        }
        if !seen.insert(name.as_str()) {
            return Err(WarehouseError::Malformed(format!("duplicate column '{name}'")));
        }
    }
    Ok(())
}
