//! Query and result rewriting for protected columns.
//!
//! Each mutator is a [`Visitor`](crate::sql::Visitor) over the parsed query that rewrites the
//! constructs it owns. After the query ran, the same mutators see the RowDescription and the
//! DataRows of the result, in reverse chain order.

pub mod blind_index;
pub mod encryption;
pub mod probabilistic_join;

use std::sync::Arc;

use sqlparser::ast::{
    Assignment, AssignmentTarget, BinaryOperator, Expr, Ident, Insert, ObjectName, SetExpr,
    Statement,
};

use crate::config::{ColumnConfig, EncryptionConfig};
use crate::crypto::CryptoProvider;
use crate::error::{TdeError, TdeResult};
use crate::protocol::messages::{DataRowMessage, RowDescriptionMessage};
use crate::sql::visitor::{insert_table, update_table, upsert_assignments, UpdateStatement};
use crate::sql::{is_column, literal_of, object_name_tail, Literal, Scope};
use crate::types;

pub use blind_index::BlindIndexMutator;
pub use encryption::EncryptionMutator;
pub use probabilistic_join::ProbabilisticJoinMutator;

/// What to do with a DataRow after mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Keep,
    Discard,
}

pub trait Mutator: Send {
    fn name(&self) -> &'static str;

    fn mutate_query(&mut self, statements: &mut [Statement]) -> TdeResult<()>;

    /// `statement` is the index, within the last mutated query, of the statement that
    /// produced this result set.
    fn mutate_row_description(
        &mut self,
        _message: &mut RowDescriptionMessage,
        _statement: usize,
    ) -> TdeResult<()> {
        Ok(())
    }

    fn mutate_data_row(&mut self, _message: &mut DataRowMessage) -> TdeResult<RowAction> {
        Ok(RowAction::Keep)
    }
}

/// Shared, read-only dependencies of the mutators.
#[derive(Clone)]
pub struct MutatorContext {
    pub config: Arc<dyn EncryptionConfig>,
    pub crypto: Arc<dyn CryptoProvider>,
}

impl MutatorContext {
    pub fn new(config: Arc<dyn EncryptionConfig>, crypto: Arc<dyn CryptoProvider>) -> Self {
        MutatorContext { config, crypto }
    }

    /// Blind index, join, encryption. Results pass through them in reverse.
    pub fn build_chain(&self) -> Vec<Box<dyn Mutator>> {
        vec![
            Box::new(BlindIndexMutator::new(self.clone())),
            Box::new(ProbabilisticJoinMutator::new(self.clone())),
            Box::new(EncryptionMutator::new(self.clone())),
        ]
    }

    fn column(&self, table: &str, column: &str) -> Option<&ColumnConfig> {
        self.config.column_config(table, column)
    }

    fn any_tde_table(&self, scope: &Scope) -> bool {
        scope.tables().any(|table| self.config.has_tde_enabled(table))
    }
}

/// Bytes that stand for a literal of `column`: fixed width big-endian for numeric types,
/// the text form otherwise. `None` for NULL.
pub fn literal_plaintext(literal: &Literal, column: &ColumnConfig) -> TdeResult<Option<Vec<u8>>> {
    let text = match literal {
        Literal::Null => return Ok(None),
        Literal::String(s) | Literal::Number(s) => s.trim(),
        Literal::Boolean(true) => "t",
        Literal::Boolean(false) => "f",
    };

    let invalid = || {
        TdeError::query(format!(
            "invalid literal {} for column {}",
            text, column.column
        ))
    };

    let bytes = match column.data_type {
        types::INT2 => text.parse::<i16>().map_err(|_| invalid())?.to_be_bytes().to_vec(),
        types::INT4 => text.parse::<i32>().map_err(|_| invalid())?.to_be_bytes().to_vec(),
        types::INT8 => text.parse::<i64>().map_err(|_| invalid())?.to_be_bytes().to_vec(),
        types::FLOAT4 => text.parse::<f32>().map_err(|_| invalid())?.to_be_bytes().to_vec(),
        types::FLOAT8 => text.parse::<f64>().map_err(|_| invalid())?.to_be_bytes().to_vec(),
        types::BOOL => match text.to_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => b"t".to_vec(),
            "f" | "false" | "n" | "no" | "off" | "0" => b"f".to_vec(),
            _ => return Err(invalid()),
        },
        _ => match literal {
            Literal::String(s) | Literal::Number(s) => s.as_bytes().to_vec(),
            _ => text.as_bytes().to_vec(),
        },
    };
    Ok(Some(bytes))
}

/// Text representation sent to the client for a decrypted value.
pub fn render_plaintext(bytes: &[u8], column: &ColumnConfig) -> Option<Vec<u8>> {
    let text = match column.data_type {
        types::INT2 => itoa::Buffer::new()
            .format(i16::from_be_bytes(bytes.try_into().ok()?))
            .to_string(),
        types::INT4 => itoa::Buffer::new()
            .format(i32::from_be_bytes(bytes.try_into().ok()?))
            .to_string(),
        types::INT8 => itoa::Buffer::new()
            .format(i64::from_be_bytes(bytes.try_into().ok()?))
            .to_string(),
        types::FLOAT4 => f32::from_be_bytes(bytes.try_into().ok()?).to_string(),
        types::FLOAT8 => f64::from_be_bytes(bytes.try_into().ok()?).to_string(),
        _ => return Some(bytes.to_vec()),
    };
    Some(text.into_bytes())
}

/// Decodes a bytea value in `\x` hex output format.
pub fn decode_bytea_text(value: &[u8]) -> Option<Vec<u8>> {
    let digits = value.strip_prefix(b"\\x")?;
    hex::decode(digits).ok()
}

/// `column = literal` or `literal = column`, also `<>`. Returns the column and the literal.
pub fn column_literal_comparison(expr: &mut Expr) -> Option<(&mut Expr, &mut Expr)> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return None;
    };
    if !matches!(op, BinaryOperator::Eq | BinaryOperator::NotEq) {
        return None;
    }
    if is_column(left) && literal_of(right).is_some() {
        Some((left.as_mut(), right.as_mut()))
    } else if is_column(right) && literal_of(left).is_some() {
        Some((right.as_mut(), left.as_mut()))
    } else {
        None
    }
}

/// `column = column`.
pub fn column_equality(expr: &mut Expr) -> Option<(&mut Expr, &mut Expr)> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return None;
    };
    if *op == BinaryOperator::Eq && is_column(left) && is_column(right) {
        Some((left.as_mut(), right.as_mut()))
    } else {
        None
    }
}

/// How a protected column's value is carried into the rewritten statement.
pub(crate) enum ValueRewrite {
    /// Add a value for this shadow column next to the original one.
    Append(String),
    /// Substitute the original value.
    Replace,
}

fn literal_required(statement: &str, kind: &str) -> TdeError {
    TdeError::query(format!(
        "only literals can be used as {} values for {} columns",
        statement, kind
    ))
}

/// Rewrites the VALUES rows of an INSERT into a TDE-enabled table, and the assignments of its
/// `ON CONFLICT ... DO UPDATE`. `select` picks the columns the caller owns; `rewrite` produces
/// the new value from the literal.
pub(crate) fn rewrite_insert_values<S, R>(
    insert: &mut Insert,
    ctx: &MutatorContext,
    kind: &str,
    select: S,
    mut rewrite: R,
) -> TdeResult<()>
where
    S: Fn(&ColumnConfig) -> Option<ValueRewrite>,
    R: FnMut(&ColumnConfig, &Literal) -> TdeResult<Expr>,
{
    let Some(table) = insert_table(insert) else {
        return Ok(());
    };
    if !ctx.config.has_tde_enabled(&table) {
        return Ok(());
    }
    rewrite_insert_rows(insert, &table, ctx, kind, &select, &mut rewrite)?;
    if let Some((assignments, _)) = upsert_assignments(insert) {
        rewrite_assignments(&table, assignments, ctx, "UPDATE", kind, &select, &mut rewrite)?;
    }
    Ok(())
}

fn rewrite_insert_rows<S, R>(
    insert: &mut Insert,
    table: &str,
    ctx: &MutatorContext,
    kind: &str,
    select: &S,
    rewrite: &mut R,
) -> TdeResult<()>
where
    S: Fn(&ColumnConfig) -> Option<ValueRewrite>,
    R: FnMut(&ColumnConfig, &Literal) -> TdeResult<Expr>,
{
    if insert.columns.is_empty() {
        return Err(TdeError::query(
            "columns definition for INSERT is required for TDE-enabled tables",
        ));
    }

    let column_count = insert.columns.len();
    let targets: Vec<(usize, ColumnConfig, ValueRewrite)> = insert
        .columns
        .iter()
        .enumerate()
        .filter_map(|(index, ident)| {
            let column = ctx.column(table, &crate::sql::normalize_ident(ident))?;
            select(column).map(|rewrite| (index, column.clone(), rewrite))
        })
        .collect();
    if targets.is_empty() {
        return Ok(());
    }

    let Some(source) = insert.source.as_mut() else {
        return Ok(());
    };
    let SetExpr::Values(values) = source.body.as_mut() else {
        return Err(TdeError::unsupported(
            "INSERT INTO SELECT is not supported for TDE-enabled tables",
        ));
    };

    for row in values.rows.iter_mut() {
        if row.len() != column_count {
            return Err(TdeError::query("bad INSERT statement"));
        }
        for (index, column, mode) in &targets {
            let literal = literal_of(&row[*index]).ok_or_else(|| literal_required("INSERT", kind))?;
            let value = rewrite(column, &literal)?;
            match mode {
                ValueRewrite::Append(_) => row.push(value),
                ValueRewrite::Replace => row[*index] = value,
            }
        }
    }

    for (_, _, mode) in &targets {
        if let ValueRewrite::Append(shadow) = mode {
            insert.columns.push(Ident::new(shadow.as_str()));
        }
    }
    Ok(())
}

/// UPDATE counterpart of [`rewrite_insert_values`].
pub(crate) fn rewrite_update_assignments<S, R>(
    update: &mut UpdateStatement<'_>,
    ctx: &MutatorContext,
    kind: &str,
    select: S,
    mut rewrite: R,
) -> TdeResult<()>
where
    S: Fn(&ColumnConfig) -> Option<ValueRewrite>,
    R: FnMut(&ColumnConfig, &Literal) -> TdeResult<Expr>,
{
    let Some(table) = update_table(&*update.table) else {
        return Ok(());
    };
    if !ctx.config.has_tde_enabled(&table) {
        return Ok(());
    }
    rewrite_assignments(&table, update.assignments, ctx, "UPDATE", kind, &select, &mut rewrite)
}

fn rewrite_assignments<S, R>(
    table: &str,
    assignments: &mut Vec<Assignment>,
    ctx: &MutatorContext,
    statement: &str,
    kind: &str,
    select: &S,
    rewrite: &mut R,
) -> TdeResult<()>
where
    S: Fn(&ColumnConfig) -> Option<ValueRewrite>,
    R: FnMut(&ColumnConfig, &Literal) -> TdeResult<Expr>,
{
    let mut appended = Vec::new();
    for assignment in assignments.iter_mut() {
        let name = match &assignment.target {
            AssignmentTarget::ColumnName(name) => name,
            AssignmentTarget::Tuple(names) => {
                let owned = names
                    .iter()
                    .filter_map(object_name_tail)
                    .filter_map(|name| ctx.column(table, &name))
                    .any(|column| select(column).is_some());
                if owned {
                    return Err(literal_required(statement, kind));
                }
                continue;
            }
        };
        let Some(column_name) = object_name_tail(name) else {
            continue;
        };
        let Some(column) = ctx.column(table, &column_name) else {
            continue;
        };
        let Some(mode) = select(column) else {
            continue;
        };

        let literal =
            literal_of(&assignment.value).ok_or_else(|| literal_required(statement, kind))?;
        let value = rewrite(column, &literal)?;
        match mode {
            ValueRewrite::Append(shadow) => appended.push(Assignment {
                target: AssignmentTarget::ColumnName(ObjectName::from(vec![Ident::new(shadow)])),
                value,
            }),
            ValueRewrite::Replace => assignment.value = value,
        }
    }
    assignments.extend(appended);
    Ok(())
}
