//! Splits nested records into a root table and child tables.
//!
//! The schema walk decides which tables and columns exist; the record walk
//! follows the same structure to produce rows. Nested objects flatten into
//! their parent's row, while arrays become child tables whose rows carry the
//! root key values, the record sequence and one ordinal per array level.

use std::collections::{BTreeMap, BTreeSet};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::DenestError;
use crate::path::FieldPath;
use crate::schema::{CanonicalSchema, Kind, Shape, DATE_TIME_FORMAT};

/// Ordering column carried by every root and child row.
pub const SEQUENCE_COLUMN: &str = "_sdc_sequence";
/// Column holding non-object array items.
pub const VALUE_COLUMN: &str = "_sdc_value";
/// Prefix of the columns linking child rows to their root record.
pub const SOURCE_KEY_PREFIX: &str = "_sdc_source_key_";

/// Ordinal column for array nesting `level` (0 is the outermost array).
pub fn level_id_column(level: usize) -> String {
    format!("_sdc_level_{level}_id")
}

/// Child-table column carrying the value of root key `key`.
pub fn source_key_column(key: &str) -> String {
    format!("{SOURCE_KEY_PREFIX}{key}")
}

/// Scalar kinds a column can physically hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeafKind {
    /// Text.
    String,
    /// Text in RFC 3339 form, stored as a timestamp.
    DateTime,
    /// 64-bit integer.
    Integer,
    /// Double precision float.
    Number,
    /// Boolean.
    Boolean,
}

impl LeafKind {
    /// Column-name suffix used when several kinds share one field.
    pub fn suffix(self) -> &'static str {
        match self {
            LeafKind::String => "s",
            LeafKind::DateTime => "t",
            LeafKind::Integer => "i",
            LeafKind::Number => "f",
            LeafKind::Boolean => "b",
        }
    }

    fn from_shape(shape: &Shape) -> Option<Self> {
        shape.non_null_kinds().find_map(|kind| match kind {
            Kind::Boolean => Some(LeafKind::Boolean),
            Kind::Integer => Some(LeafKind::Integer),
            Kind::Number => Some(LeafKind::Number),
            Kind::String if shape.format.as_deref() == Some(DATE_TIME_FORMAT) => {
                Some(LeafKind::DateTime)
            }
            Kind::String => Some(LeafKind::String),
            Kind::Null | Kind::Array | Kind::Object => None,
        })
    }
}

/// Kinds observed or declared for one column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeafType {
    /// Every literal kind associated with the column's path.
    pub kinds: BTreeSet<LeafKind>,
    /// Whether rows may omit the value.
    pub nullable: bool,
    /// Declared default value, if any.
    pub default: Option<Value>,
}

impl LeafType {
    /// A non-nullable single-kind type.
    pub fn of(kind: LeafKind) -> Self {
        Self {
            kinds: BTreeSet::from([kind]),
            nullable: false,
            default: None,
        }
    }

    /// The kind, when exactly one is associated.
    pub fn single(&self) -> Option<LeafKind> {
        let mut kinds = self.kinds.iter().copied();
        match (kinds.next(), kinds.next()) {
            (Some(kind), None) => Some(kind),
            _ => None,
        }
    }

    /// Kind a scalar is stored as, and the value in that kind's form.
    fn resolve(&self, value: &Value) -> Option<(LeafKind, Value)> {
        let kind = match value {
            Value::Bool(_) => LeafKind::Boolean,
            Value::Number(n) if n.is_i64() => {
                if !self.kinds.contains(&LeafKind::Integer) && self.kinds.contains(&LeafKind::Number) {
                    LeafKind::Number
                } else {
                    LeafKind::Integer
                }
            }
            Value::Number(n) => {
                // Whole floats such as `1.0` stay in an integer column.
                if self.kinds.contains(&LeafKind::Integer) && !self.kinds.contains(&LeafKind::Number) {
                    if let Some(whole) = n.as_f64().and_then(whole_number) {
                        return Some((LeafKind::Integer, Value::from(whole)));
                    }
                }
                LeafKind::Number
            }
            Value::String(text) => {
                if self.kinds.contains(&LeafKind::DateTime)
                    && DateTime::parse_from_rfc3339(text).is_ok()
                {
                    LeafKind::DateTime
                } else {
                    LeafKind::String
                }
            }
            Value::Null | Value::Array(_) | Value::Object(_) => return None,
        };
        Some((kind, value.clone()))
    }
}

fn whole_number(value: f64) -> Option<i64> {
    let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
    (value.fract() == 0.0 && in_range).then_some(value as i64)
}

/// Structure of one root or child table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    /// Path of the table below the stream root; empty for the root table.
    pub path: FieldPath,
    /// 0 for the root table, +1 per enclosing array.
    pub nesting_level: usize,
    /// Columns identifying a row for deduplication.
    pub key_columns: Vec<FieldPath>,
    /// Columns holding root key values (child tables only).
    pub parent_keys: Vec<FieldPath>,
    /// Every column with its leaf type.
    pub columns: BTreeMap<FieldPath, LeafType>,
}

impl TableSchema {
    fn root() -> Self {
        Self {
            path: FieldPath::root(),
            nesting_level: 0,
            key_columns: Vec::new(),
            parent_keys: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    /// Whether this is the stream's root table.
    pub fn is_root(&self) -> bool {
        self.nesting_level == 0
    }
}

/// One flattened row: column path to observed kind and scalar value.
pub type DenestedRow = BTreeMap<FieldPath, (LeafKind, Value)>;

/// A table schema together with the rows destined for it.
#[derive(Debug, Clone, PartialEq)]
pub struct TableBatch {
    /// Target table structure.
    pub schema: TableSchema,
    /// Rows, in no particular order.
    pub rows: Vec<DenestedRow>,
}

/// Denests `records` into one batch per table (root first).
///
/// Every table the schema implies is returned, even when no record reaches
/// it, so that table structure can be created ahead of data.
pub fn to_table_batches(
    schema: &CanonicalSchema,
    key_columns: &[String],
    records: &[Value],
) -> Result<Vec<TableBatch>, DenestError> {
    let mut tables = table_schemas(schema, key_columns)?;

    let mut rows: Vec<Vec<DenestedRow>> = vec![Vec::new(); tables.len()];
    let walker = RecordWalker {
        tables: &tables,
        key_columns,
    };
    for record in records {
        walker.denest(record, &mut rows)?;
    }

    // Kinds seen in data join the declared ones so mismatches become a family.
    for (table, table_rows) in tables.iter_mut().zip(&rows) {
        for row in table_rows {
            for (column, (kind, _)) in row {
                if let Some(leaf) = table.columns.get_mut(column) {
                    if leaf.kinds.insert(*kind)
                        && leaf.kinds.len() > 1
                        && !table.key_columns.contains(column)
                    {
                        leaf.nullable = true;
                    }
                }
            }
        }
    }

    Ok(tables
        .into_iter()
        .zip(rows)
        .map(|(schema, rows)| TableBatch { schema, rows })
        .collect())
}

/// Derives the root and child table schemas without any records.
pub fn table_schemas(
    schema: &CanonicalSchema,
    key_columns: &[String],
) -> Result<Vec<TableSchema>, DenestError> {
    let mut walker = SchemaWalker {
        tables: vec![TableSchema::root()],
    };
    walker.walk(0, &FieldPath::root(), schema, false, false);
    let mut tables = walker.tables;

    let mut key_types = Vec::with_capacity(key_columns.len());
    for key in key_columns {
        let path = FieldPath::single(key.as_str());
        let leaf = tables[0]
            .columns
            .get_mut(&path)
            .ok_or_else(|| DenestError::MissingKeyColumn(key.clone()))?;
        leaf.nullable = false;
        key_types.push(leaf.clone());
        tables[0].key_columns.push(path);
    }

    for table in tables.iter_mut().skip(1) {
        for (key, leaf) in key_columns.iter().zip(&key_types) {
            let column = FieldPath::single(source_key_column(key));
            table.columns.insert(column.clone(), leaf.clone());
            table.key_columns.push(column.clone());
            table.parent_keys.push(column);
        }
        for level in 0..table.nesting_level {
            table.key_columns.push(FieldPath::single(level_id_column(level)));
        }
    }
    Ok(tables)
}

struct SchemaWalker {
    tables: Vec<TableSchema>,
}

impl SchemaWalker {
    /// `nullable`: an enclosing shape admits null. `optional`: an enclosing
    /// object may omit the value.
    fn walk(
        &mut self,
        table: usize,
        at: &FieldPath,
        schema: &CanonicalSchema,
        nullable: bool,
        optional: bool,
    ) {
        let in_union = schema.is_union();
        for shape in schema.shapes() {
            let nullable = nullable || in_union || shape.is_nullable();
            match shape.non_null_kinds().next() {
                None => {}
                Some(Kind::Object) => {
                    for (name, property) in &shape.properties {
                        let optional = optional || !shape.required.contains(name);
                        self.walk(table, &at.child(name.as_str()), property, nullable, optional);
                    }
                }
                Some(Kind::Array) => {
                    let child = self.child_table(table, at);
                    match shape.items.as_deref() {
                        Some(items) => self.walk(child, &FieldPath::root(), items, false, false),
                        None => trace!(path = %at, "array without item schema"),
                    }
                }
                Some(_) => {
                    let Some(kind) = LeafKind::from_shape(shape) else {
                        continue;
                    };
                    let column = if at.is_root() {
                        FieldPath::single(VALUE_COLUMN)
                    } else {
                        at.clone()
                    };
                    let leaf = self.tables[table].columns.entry(column).or_default();
                    leaf.kinds.insert(kind);
                    if leaf.default.is_none() {
                        leaf.default = shape.default.clone();
                    }
                    // A declared default stands in for an omitted value.
                    leaf.nullable |= nullable || (optional && leaf.default.is_none());
                }
            }
        }
    }

    fn child_table(&mut self, parent: usize, at: &FieldPath) -> usize {
        let path = child_path(&self.tables[parent].path, at);
        if let Some(index) = self.tables.iter().position(|t| t.path == path) {
            return index;
        }

        let nesting_level = self.tables[parent].nesting_level + 1;
        let mut columns = BTreeMap::new();
        let mut sequence = LeafType::of(LeafKind::Integer);
        sequence.nullable = true;
        columns.insert(FieldPath::single(SEQUENCE_COLUMN), sequence);
        for level in 0..nesting_level {
            columns.insert(
                FieldPath::single(level_id_column(level)),
                LeafType::of(LeafKind::Integer),
            );
        }

        self.tables.push(TableSchema {
            path,
            nesting_level,
            key_columns: Vec::new(),
            parent_keys: Vec::new(),
            columns,
        });
        self.tables.len() - 1
    }
}

/// Arrays nested directly in arrays have no property name of their own.
fn child_path(parent: &FieldPath, at: &FieldPath) -> FieldPath {
    if at.is_root() {
        parent.child(VALUE_COLUMN)
    } else {
        parent.concat(at)
    }
}

#[derive(Clone)]
struct Seed {
    source_keys: Vec<(FieldPath, (LeafKind, Value))>,
    sequence: Option<Value>,
    ordinals: Vec<usize>,
}

struct RecordWalker<'a> {
    tables: &'a [TableSchema],
    key_columns: &'a [String],
}

impl RecordWalker<'_> {
    fn denest(&self, record: &Value, rows: &mut [Vec<DenestedRow>]) -> Result<(), DenestError> {
        let object = record.as_object().ok_or(DenestError::NotAnObject)?;
        let seed = self.seed(object)?;

        let mut row = DenestedRow::new();
        for (name, value) in object {
            self.walk(0, &FieldPath::single(name.as_str()), value, &mut row, &seed, rows);
        }
        rows[0].push(row);
        Ok(())
    }

    fn seed(&self, record: &Map<String, Value>) -> Result<Seed, DenestError> {
        let root = &self.tables[0];
        let mut source_keys = Vec::with_capacity(self.key_columns.len());
        for key in self.key_columns {
            let value = record
                .get(key)
                .filter(|value| !value.is_null())
                .ok_or_else(|| DenestError::MissingKeyValue(key.clone()))?;
            let resolved = root
                .columns
                .get(&FieldPath::single(key.as_str()))
                .and_then(|leaf| leaf.resolve(value))
                .ok_or_else(|| DenestError::MissingKeyValue(key.clone()))?;
            source_keys.push((FieldPath::single(source_key_column(key)), resolved));
        }

        Ok(Seed {
            source_keys,
            sequence: record.get(SEQUENCE_COLUMN).filter(|v| v.is_i64()).cloned(),
            ordinals: Vec::new(),
        })
    }

    fn walk(
        &self,
        table: usize,
        at: &FieldPath,
        value: &Value,
        row: &mut DenestedRow,
        seed: &Seed,
        rows: &mut [Vec<DenestedRow>],
    ) {
        match value {
            Value::Null => {}
            Value::Object(object) => {
                for (name, nested) in object {
                    self.walk(table, &at.child(name.as_str()), nested, row, seed, rows);
                }
            }
            Value::Array(items) => {
                let path = child_path(&self.tables[table].path, at);
                let Some(child) = self.tables.iter().position(|t| t.path == path) else {
                    trace!(path = %path, "skipping array with no child table");
                    return;
                };
                for (ordinal, item) in items.iter().enumerate() {
                    let mut child_seed = seed.clone();
                    child_seed.ordinals.push(ordinal);
                    let mut child_row = self.seeded_row(&child_seed);
                    self.walk(child, &FieldPath::root(), item, &mut child_row, &child_seed, rows);
                    rows[child].push(child_row);
                }
            }
            scalar => {
                let column = if at.is_root() {
                    FieldPath::single(VALUE_COLUMN)
                } else {
                    at.clone()
                };
                let Some(leaf) = self.tables[table].columns.get(&column) else {
                    trace!(column = %column, "skipping value with no column");
                    return;
                };
                if let Some(resolved) = leaf.resolve(scalar) {
                    row.insert(column, resolved);
                }
            }
        }
    }

    fn seeded_row(&self, seed: &Seed) -> DenestedRow {
        let mut row: DenestedRow = seed.source_keys.iter().cloned().collect();
        if let Some(sequence) = &seed.sequence {
            row.insert(
                FieldPath::single(SEQUENCE_COLUMN),
                (LeafKind::Integer, sequence.clone()),
            );
        }
        for (level, ordinal) in seed.ordinals.iter().enumerate() {
            row.insert(
                FieldPath::single(level_id_column(level)),
                (LeafKind::Integer, Value::from(*ordinal as u64)),
            );
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::normalize;
    use proptest::prelude::*;
    use serde_json::json;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn nested_objects_flatten_into_the_root_row() {
        let schema = normalize(&json!({
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "object", "properties": {"c": {"type": "string"}}}
            }
        }))
        .unwrap();

        let batches = to_table_batches(&schema, &keys(&["a"]), &[json!({"a": 1, "b": {"c": "x"}})]).unwrap();

        assert_eq!(batches.len(), 1);
        let row = &batches[0].rows[0];
        assert_eq!(row.len(), 2);
        assert_eq!(row[&FieldPath::single("a")], (LeafKind::Integer, json!(1)));
        assert_eq!(row[&FieldPath::new(["b", "c"])], (LeafKind::String, json!("x")));
        assert_eq!(batches[0].schema.key_columns, vec![FieldPath::single("a")]);
    }

    #[test]
    fn arrays_become_child_tables_with_keys_and_ordinals() {
        let schema = normalize(&json!({
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "array", "items": {"type": "object", "properties": {"c": {"type": "string"}}}}
            }
        }))
        .unwrap();

        let batches = to_table_batches(
            &schema,
            &keys(&["a"]),
            &[json!({"a": 1, "b": [{"c": "x"}, {"c": "y"}]})],
        )
        .unwrap();

        assert_eq!(batches.len(), 2);
        let child = &batches[1];
        assert_eq!(child.schema.path, FieldPath::single("b"));
        assert_eq!(child.schema.nesting_level, 1);
        assert_eq!(
            child.schema.key_columns,
            vec![
                FieldPath::single("_sdc_source_key_a"),
                FieldPath::single("_sdc_level_0_id")
            ]
        );
        assert_eq!(child.rows.len(), 2);
        for (ordinal, expected) in ["x", "y"].iter().enumerate() {
            let row = &child.rows[ordinal];
            assert_eq!(row[&FieldPath::single("_sdc_source_key_a")].1, json!(1));
            assert_eq!(row[&FieldPath::single("_sdc_level_0_id")].1, json!(ordinal));
            assert_eq!(row[&FieldPath::single("c")].1, json!(expected));
        }
        assert!(!batches[0].rows[0].contains_key(&FieldPath::single("b")));
    }

    #[test]
    fn scalar_items_use_the_value_column_and_nested_arrays_carry_every_ordinal() {
        let schema = normalize(&json!({
            "properties": {
                "id": {"type": "string"},
                "matrix": {"type": "array", "items": {"type": "array", "items": {"type": "number"}}}
            }
        }))
        .unwrap();

        let batches = to_table_batches(
            &schema,
            &keys(&["id"]),
            &[json!({"id": "k", "matrix": [[1.5, 2.5], [3.5]], "_sdc_sequence": 7})],
        )
        .unwrap();

        let inner = batches
            .iter()
            .find(|b| b.schema.nesting_level == 2)
            .unwrap();
        assert_eq!(inner.rows.len(), 3);
        assert!(inner.schema.columns.contains_key(&FieldPath::single(VALUE_COLUMN)));
        let last = inner
            .rows
            .iter()
            .find(|row| row[&FieldPath::single("_sdc_level_0_id")].1 == json!(1))
            .unwrap();
        assert_eq!(last[&FieldPath::single("_sdc_level_1_id")].1, json!(0));
        assert_eq!(last[&FieldPath::single(VALUE_COLUMN)], (LeafKind::Number, json!(3.5)));
        assert_eq!(last[&FieldPath::single(SEQUENCE_COLUMN)].1, json!(7));
    }

    #[test]
    fn nulls_are_dropped_and_empty_schemas_keep_rows() {
        let schema = normalize(&json!({"properties": {"id": {"type": "integer"}, "note": {"type": ["null", "string"]}}})).unwrap();
        let batches = to_table_batches(&schema, &keys(&["id"]), &[json!({"id": 1, "note": null})]).unwrap();
        assert_eq!(batches[0].rows[0].len(), 1);

        let empty = normalize(&json!({})).unwrap();
        let batches = to_table_batches(&empty, &[], &[json!({}), json!({})]).unwrap();
        assert_eq!(batches[0].rows.len(), 2);
    }

    #[test]
    fn unions_record_every_kind_and_are_nullable() {
        let schema = normalize(&json!({
            "properties": {
                "id": {"type": "integer"},
                "v": {"type": ["integer", "string"]},
                "at": {"type": "string", "format": "date-time"}
            }
        }))
        .unwrap();
        let batches = to_table_batches(
            &schema,
            &keys(&["id"]),
            &[json!({"id": 1, "v": 5, "at": "2024-01-01T00:00:00Z"}), json!({"id": 2, "v": "five"})],
        )
        .unwrap();

        let v = &batches[0].schema.columns[&FieldPath::single("v")];
        assert_eq!(v.kinds, BTreeSet::from([LeafKind::String, LeafKind::Integer]));
        assert!(v.nullable);
        assert_eq!(batches[0].rows[0][&FieldPath::single("at")].0, LeafKind::DateTime);
        assert_eq!(batches[0].rows[1][&FieldPath::single("v")].0, LeafKind::String);
    }

    #[test]
    fn optional_fields_are_nullable_unless_a_default_fills_them() {
        let schema = normalize(&json!({
            "type": "object",
            "required": ["id", "name"],
            "properties": {
                "id": {"type": "integer"},
                "name": {"type": "string"},
                "seen_at": {"type": "string", "format": "date-time"},
                "tier": {"type": "string", "default": "free"},
                "note": {"type": ["null", "string"], "default": "none"},
                "address": {
                    "type": "object",
                    "required": ["city"],
                    "properties": {"city": {"type": "string"}}
                }
            }
        }))
        .unwrap();
        let tables = table_schemas(&schema, &keys(&["id"])).unwrap();
        let nullable = |name: &[&str]| tables[0].columns[&FieldPath::new(name.iter().copied())].nullable;

        assert!(!nullable(&["id"]));
        assert!(!nullable(&["name"]));
        assert!(nullable(&["seen_at"]));
        assert!(!nullable(&["tier"]));
        assert!(nullable(&["note"]));
        // Required inside an optional object can still be absent.
        assert!(nullable(&["address", "city"]));
    }

    #[test]
    fn whole_floats_are_stored_in_integer_columns() {
        let schema = normalize(&json!({
            "properties": {
                "id": {"type": "integer"},
                "qty": {"type": "integer"},
                "ratio": {"type": "number"}
            }
        }))
        .unwrap();
        let batches = to_table_batches(
            &schema,
            &keys(&["id"]),
            &[json!({"id": 1.0, "qty": 2.0, "ratio": 3.0}), json!({"id": 2, "qty": 2.5})],
        )
        .unwrap();

        let first = &batches[0].rows[0];
        assert_eq!(first[&FieldPath::single("id")], (LeafKind::Integer, json!(1)));
        assert_eq!(first[&FieldPath::single("qty")], (LeafKind::Integer, json!(2)));
        assert_eq!(first[&FieldPath::single("ratio")], (LeafKind::Number, json!(3.0)));
        // A real fraction still splits the column into a family.
        assert_eq!(batches[0].rows[1][&FieldPath::single("qty")].0, LeafKind::Number);
        let qty = &batches[0].schema.columns[&FieldPath::single("qty")];
        assert_eq!(qty.kinds, BTreeSet::from([LeafKind::Integer, LeafKind::Number]));
    }

    #[test]
    fn missing_keys_are_errors() {
        let schema = normalize(&json!({"properties": {"a": {"type": "integer"}}})).unwrap();
        assert_eq!(
            to_table_batches(&schema, &keys(&["nope"]), &[]).unwrap_err(),
            DenestError::MissingKeyColumn("nope".to_string())
        );
        assert_eq!(
            to_table_batches(&schema, &keys(&["a"]), &[json!({"a": null})]).unwrap_err(),
            DenestError::MissingKeyValue("a".to_string())
        );
    }

    fn nested_record() -> impl Strategy<Value = Value> {
        (any::<i32>(), prop::collection::vec(prop::collection::vec("[a-z]{1,4}", 0..4), 0..5)).prop_map(
            |(id, lines)| {
                let lines: Vec<Value> = lines
                    .into_iter()
                    .map(|tags| json!({"qty": 1, "tags": tags}))
                    .collect();
                json!({"id": id, "lines": lines})
            },
        )
    }

    proptest! {
        #[test]
        fn row_count_matches_reachable_objects(records in prop::collection::vec(nested_record(), 0..8)) {
            let schema = normalize(&json!({
                "properties": {
                    "id": {"type": "integer"},
                    "lines": {"type": "array", "items": {
                        "type": "object",
                        "properties": {
                            "qty": {"type": "integer"},
                            "tags": {"type": "array", "items": {"type": "string"}}
                        }
                    }}
                }
            }))
            .unwrap();

            let expected: usize = records
                .iter()
                .map(|record| {
                    let lines = record["lines"].as_array().unwrap();
                    1 + lines.len()
                        + lines.iter().map(|l| l["tags"].as_array().unwrap().len()).sum::<usize>()
                })
                .sum();

            let batches = to_table_batches(&schema, &["id".to_string()], &records).unwrap();
            let actual: usize = batches.iter().map(|b| b.rows.len()).sum();
            prop_assert_eq!(actual, expected);
        }
    }
}
