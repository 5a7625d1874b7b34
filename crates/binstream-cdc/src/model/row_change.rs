//! Row-change identity and reduction
//!
//! Two row changes with the same identity key touch the same logical row,
//! so a run of changes can be reduced to a single equivalent change before
//! hitting the sink:
//!
//! - INSERT then UPDATE folds to INSERT of the new values
//! - UPDATE then UPDATE folds to one UPDATE across both
//! - UPDATE then DELETE folds to DELETE of the original row
//! - INSERT then DELETE cancels out entirely
//! - DELETE then INSERT folds to an UPDATE from old to new
//!
//! Identity comes from a NOT NULL unique index when the table has one,
//! falling back to the full column list.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::TableName;

/// One column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub offset: usize,
}

/// A unique index over column offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub columns: Vec<usize>,
}

/// Table structure as the mounter sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: TableName,
    pub columns: Vec<ColumnInfo>,
    /// A PK or UK whose columns are all NOT NULL, when one exists.
    pub unique_not_null_index: Option<IndexInfo>,
}

/// Kind of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowChangeType {
    Insert,
    Update,
    Delete,
}

/// A change to one row, carrying pre- and/or post-images.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub source_table: TableName,
    pub target_table: TableName,
    pre_values: Option<Vec<Value>>,
    post_values: Option<Vec<Value>>,
    table_info: Arc<TableInfo>,
    tp: RowChangeType,
}

impl RowChange {
    pub fn new_insert(table_info: Arc<TableInfo>, post_values: Vec<Value>) -> Self {
        Self {
            source_table: table_info.name.clone(),
            target_table: table_info.name.clone(),
            pre_values: None,
            post_values: Some(post_values),
            table_info,
            tp: RowChangeType::Insert,
        }
    }

    pub fn new_update(
        table_info: Arc<TableInfo>,
        pre_values: Vec<Value>,
        post_values: Vec<Value>,
    ) -> Self {
        Self {
            source_table: table_info.name.clone(),
            target_table: table_info.name.clone(),
            pre_values: Some(pre_values),
            post_values: Some(post_values),
            table_info,
            tp: RowChangeType::Update,
        }
    }

    pub fn new_delete(table_info: Arc<TableInfo>, pre_values: Vec<Value>) -> Self {
        Self {
            source_table: table_info.name.clone(),
            target_table: table_info.name.clone(),
            pre_values: Some(pre_values),
            post_values: None,
            table_info,
            tp: RowChangeType::Delete,
        }
    }

    pub fn tp(&self) -> RowChangeType {
        self.tp
    }

    pub fn pre_values(&self) -> Option<&[Value]> {
        self.pre_values.as_deref()
    }

    pub fn post_values(&self) -> Option<&[Value]> {
        self.post_values.as_deref()
    }

    /// True when the table has a PK or UK whose columns are all NOT NULL.
    pub fn has_not_null_unique_idx(&self) -> bool {
        self.table_info.unique_not_null_index.is_some()
    }

    /// The value groups identifying the row, from the pre- and post-image
    /// respectively. Without a usable unique index, all columns identify
    /// the row.
    pub fn identity_values(&self) -> (Vec<&Value>, Vec<&Value>) {
        match &self.table_info.unique_not_null_index {
            Some(index) => {
                let pre = match &self.pre_values {
                    Some(vs) => index.columns.iter().map(|&i| &vs[i]).collect(),
                    None => Vec::new(),
                };
                let post = match &self.post_values {
                    Some(vs) => index.columns.iter().map(|&i| &vs[i]).collect(),
                    None => Vec::new(),
                };
                (pre, post)
            }
            None => (
                self.pre_values.as_ref().map(|vs| vs.iter().collect()).unwrap_or_default(),
                self.post_values.as_ref().map(|vs| vs.iter().collect()).unwrap_or_default(),
            ),
        }
    }

    /// True for an UPDATE that changes its own identity columns. Such a
    /// change must be split before reduction.
    pub fn is_identity_updated(&self) -> bool {
        if self.tp != RowChangeType::Update {
            return false;
        }
        let (pre, post) = self.identity_values();
        pre.len() != post.len() || pre.iter().zip(&post).any(|(a, b)| a != b)
    }

    /// Canonical serialization of the identity values, e.g. `1.a`.
    /// Undefined for identity-updating changes.
    pub fn identity_key(&self) -> String {
        let (pre, post) = self.identity_values();
        if !pre.is_empty() {
            gen_key(&pre)
        } else {
            gen_key(&post)
        }
    }

    /// Fold `prev` (the earlier change) into `self` (the later change),
    /// yielding a single equivalent change, or `None` when the pair
    /// cancels out (INSERT then DELETE).
    ///
    /// Panics when the identity keys differ; callers group by identity key
    /// first, so a mismatch is a programming error.
    pub fn reduce(mut self, prev: RowChange) -> Option<RowChange> {
        assert_eq!(
            self.identity_key(),
            prev.identity_key(),
            "reduce row change failed, identity key not match"
        );
        self.pre_values = prev.pre_values;
        match (&self.pre_values, &self.post_values) {
            (None, None) => None,
            (pre, post) => {
                self.tp = match (pre, post) {
                    (Some(_), Some(_)) => RowChangeType::Update,
                    (None, Some(_)) => RowChangeType::Insert,
                    (Some(_), None) => RowChangeType::Delete,
                    (None, None) => unreachable!(),
                };
                Some(self)
            }
        }
    }

    /// Split an UPDATE into its DELETE and INSERT halves. Only meaningful
    /// for updates; identity-updating changes must go through this before
    /// reduction.
    pub fn split_update(&self) -> (RowChange, RowChange) {
        assert_eq!(
            self.tp,
            RowChangeType::Update,
            "split_update should only be called on updates"
        );
        let delete = RowChange {
            source_table: self.source_table.clone(),
            target_table: self.target_table.clone(),
            pre_values: self.pre_values.clone(),
            post_values: None,
            table_info: self.table_info.clone(),
            tp: RowChangeType::Delete,
        };
        let insert = RowChange {
            source_table: self.source_table.clone(),
            target_table: self.target_table.clone(),
            pre_values: None,
            post_values: self.post_values.clone(),
            table_info: self.table_info.clone(),
            tp: RowChangeType::Insert,
        };
        (delete, insert)
    }
}

/// Join values into a key like `a.1.b`; strings render without quotes so
/// keys are stable across value encodings.
fn gen_key(values: &[&Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}
