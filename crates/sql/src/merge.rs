//! Statements that merge a staging table into its target.
//!
//! Staged rows are ranked per dedup key by descending sequence (ties broken by
//! arrival order) and only rank 1 survives. The delete removes target rows
//! matching a surviving staged row unless the target row is newer; the insert
//! then adds survivors whose delete key no longer exists in the target.
//!
//! Child rows only survive when they carry the newest sequence staged for
//! their parent, so one parent never mixes rows of two records.

use uuid::Uuid;

use crate::dialect::Dialect;
use crate::session::StagedColumn;

/// Ordinal column added to every staging table.
pub const STAGE_ROW_COLUMN: &str = "_sdc_stage_row";
const RANK_COLUMN: &str = "_sdc_rank";
const NEWEST_COLUMN: &str = "_sdc_newest";

/// Fresh name for a staging table.
pub fn stage_table_name() -> String {
    format!("_sdc_stage_{}", Uuid::new_v4().simple())
}

/// `CREATE TEMPORARY TABLE` for a staging table; every column is nullable.
pub fn create_stage_sql(dialect: &dyn Dialect, stage: &str, columns: &[StagedColumn]) -> String {
    let mut defs = vec![format!(
        "{} {}",
        dialect.quote(STAGE_ROW_COLUMN),
        dialect.column_type(tablesink_core::LeafKind::Integer)
    )];
    defs.extend(
        columns
            .iter()
            .map(|c| format!("{} {}", dialect.quote(&c.name), dialect.column_type(c.kind))),
    );
    format!("CREATE TEMPORARY TABLE {} ({})", dialect.quote(stage), defs.join(", "))
}

/// `DROP TABLE` for a staging table.
pub fn drop_stage_sql(dialect: &dyn Dialect, stage: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", dialect.quote(stage))
}

/// Target column filled from the staging table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeColumn {
    /// Physical name, identical in stage and target.
    pub name: String,
    /// Literal replacing a missing value.
    pub default: Option<String>,
}

/// Inputs of one merge.
#[derive(Debug, Clone)]
pub struct MergeRequest<'a> {
    /// Target table, unqualified.
    pub target: &'a str,
    /// Staging table, unqualified.
    pub stage: &'a str,
    /// Columns copied into the target.
    pub columns: &'a [MergeColumn],
    /// Columns matching target rows to replace.
    pub delete_keys: &'a [String],
    /// Columns identifying one logical row among staged rows.
    pub dedup_keys: &'a [String],
    /// Sequence column deciding which version of a row wins.
    pub sequence: Option<&'a str>,
}

/// Delete and insert statements of a merge, executed in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStatements {
    /// Removes superseded target rows.
    pub delete: String,
    /// Inserts surviving staged rows.
    pub insert: String,
}

/// Renders the merge.
pub fn merge_statements(dialect: &dyn Dialect, request: &MergeRequest<'_>) -> MergeStatements {
    let target = dialect.qualify(request.target);
    let ranked = ranked_stage(dialect, request);
    let rank = dialect.quote(RANK_COLUMN);

    let mut delete_match = key_match(dialect, &target, "d", request.delete_keys);
    if let Some(sequence) = request.sequence {
        let sequence = dialect.quote(sequence);
        delete_match.push(format!(
            "COALESCE({target}.{sequence}, 0) <= COALESCE(d.{sequence}, 0)"
        ));
    }
    let delete = format!(
        "DELETE FROM {target} WHERE EXISTS (SELECT 1 FROM ({ranked}) d WHERE d.{rank} = 1{})",
        and_all(&delete_match)
    );

    let names: Vec<String> = request.columns.iter().map(|c| dialect.quote(&c.name)).collect();
    let values: Vec<String> = request
        .columns
        .iter()
        .map(|c| {
            let column = format!("d.{}", dialect.quote(&c.name));
            match &c.default {
                Some(default) => format!("COALESCE({column}, {default})"),
                None => column,
            }
        })
        .collect();
    let survivor_match = key_match(dialect, "t", "d", request.delete_keys);
    let insert = format!(
        "INSERT INTO {target} ({}) SELECT {} FROM ({ranked}) d WHERE d.{rank} = 1 \
         AND NOT EXISTS (SELECT 1 FROM {target} t WHERE {})",
        names.join(", "),
        values.join(", "),
        if survivor_match.is_empty() {
            "1 = 1".to_string()
        } else {
            survivor_match.join(" AND ")
        }
    );
    MergeStatements { delete, insert }
}

/// Deletes target rows whose parent key is staged in `stage`, unless the
/// target row is newer than every staged parent.
pub fn parent_delete_sql(
    dialect: &dyn Dialect,
    target: &str,
    stage: &str,
    parent_keys: &[String],
    sequence: Option<&str>,
) -> String {
    let target = dialect.qualify(target);
    let mut conditions = key_match(dialect, &target, "p", parent_keys);
    if let Some(sequence) = sequence {
        let sequence = dialect.quote(sequence);
        conditions.push(format!(
            "COALESCE({target}.{sequence}, 0) <= COALESCE(p.{sequence}, 0)"
        ));
    }
    format!(
        "DELETE FROM {target} WHERE EXISTS (SELECT 1 FROM {} p WHERE {})",
        dialect.quote(stage),
        if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        }
    )
}

fn ranked_stage(dialect: &dyn Dialect, request: &MergeRequest<'_>) -> String {
    let partition: Vec<String> = request
        .dedup_keys
        .iter()
        .map(|key| format!("s.{}", dialect.quote(key)))
        .collect();
    let mut order = Vec::new();
    if let Some(sequence) = request.sequence {
        order.push(format!("COALESCE(s.{}, 0) DESC", dialect.quote(sequence)));
    }
    order.push(format!("s.{} DESC", dialect.quote(STAGE_ROW_COLUMN)));
    let partition = if partition.is_empty() {
        String::new()
    } else {
        format!("PARTITION BY {} ", partition.join(", "))
    };

    let stage = dialect.quote(request.stage);
    let is_child = !request.delete_keys.is_empty() && request.delete_keys != request.dedup_keys;
    let (source, filter) = match request.sequence {
        Some(sequence) if is_child => {
            let sequence = dialect.quote(sequence);
            let newest = dialect.quote(NEWEST_COLUMN);
            let parents: Vec<String> = request
                .delete_keys
                .iter()
                .map(|key| format!("p.{}", dialect.quote(key)))
                .collect();
            (
                format!(
                    "(SELECT p.*, MAX(COALESCE(p.{sequence}, 0)) OVER (PARTITION BY {}) \
                     AS {newest} FROM {stage} p)",
                    parents.join(", ")
                ),
                format!(" WHERE COALESCE(s.{sequence}, 0) = s.{newest}"),
            )
        }
        _ => (stage, String::new()),
    };
    format!(
        "SELECT s.*, ROW_NUMBER() OVER ({partition}ORDER BY {}) AS {} FROM {source} s{filter}",
        order.join(", "),
        dialect.quote(RANK_COLUMN),
    )
}

fn key_match(dialect: &dyn Dialect, left: &str, right: &str, keys: &[String]) -> Vec<String> {
    keys.iter()
        .map(|key| {
            let key = dialect.quote(key);
            format!("{left}.{key} = {right}.{key}")
        })
        .collect()
}

fn and_all(conditions: &[String]) -> String {
    conditions
        .iter()
        .map(|condition| format!(" AND {condition}"))
        .collect()
}
