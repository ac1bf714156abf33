//! Joins on encrypted columns through a truncated SHA-256 shadow column.
//!
//! The short join key admits false positives, so both joined columns must be part of the
//! result and every returned row is verified on the decrypted values.

use sqlparser::ast::{BinaryOperator, Expr, Insert, Statement};
use tracing::{debug, trace};

use super::{
    column_equality, literal_plaintext, rewrite_insert_values, rewrite_update_assignments,
    Mutator, MutatorContext, RowAction, ValueRewrite,
};
use crate::config::ColumnConfig;
use crate::error::{TdeError, TdeResult};
use crate::protocol::messages::{DataRowMessage, RowDescriptionMessage};
use crate::sql::visitor::{walk_insert, walk_operator_expression, walk_update, UpdateStatement};
use crate::sql::{bytea_literal, null_literal, rename_column, ColumnRef, Context, Literal, Scope, Visitor};

const KIND: &str = "join";

fn not_selected() -> TdeError {
    TdeError::query("columns present in join condition must be also present in SELECT body")
}

/// Both sides of `a = b` when both columns carry a join key.
pub(crate) fn join_pair(
    ctx: &MutatorContext,
    scope: &Scope,
    expr: &Expr,
    clause: Context,
) -> TdeResult<Option<(ColumnRef, ColumnRef)>> {
    let Expr::BinaryOp {
        left,
        op: BinaryOperator::Eq,
        right,
    } = expr
    else {
        return Ok(None);
    };
    if clause.in_select_body() {
        return Ok(None);
    }
    let (Some(left), Some(right)) = (
        scope.resolve_column(left, clause)?,
        scope.resolve_column(right, clause)?,
    ) else {
        return Ok(None);
    };

    let joinable = |column: &ColumnRef| {
        ctx.column(&column.table, &column.column)
            .is_some_and(ColumnConfig::has_join)
    };
    if joinable(&left) && joinable(&right) {
        Ok(Some((left, right)))
    } else {
        Ok(None)
    }
}

fn join_key_value(ctx: &MutatorContext, column: &ColumnConfig, literal: &Literal) -> TdeResult<Expr> {
    match literal_plaintext(literal, column)? {
        Some(plaintext) => {
            let digest = ctx.crypto.sha256(&plaintext);
            let size = ctx.config.join_key_size().min(digest.len());
            Ok(bytea_literal(&digest[..size]))
        }
        None => Ok(null_literal()),
    }
}

fn join_shadow(column: &ColumnConfig) -> Option<ValueRewrite> {
    column
        .join
        .as_ref()
        .map(|settings| ValueRewrite::Append(settings.column.clone()))
}

pub struct ProbabilisticJoinMutator {
    ctx: MutatorContext,
    scope: Scope,
    /// Joined column pairs, per statement of the last query.
    pairs: Vec<Vec<(ColumnRef, ColumnRef)>>,
    /// Result column indexes compared on each row of the current result set.
    active: Vec<(usize, usize)>,
}

impl ProbabilisticJoinMutator {
    pub fn new(ctx: MutatorContext) -> Self {
        ProbabilisticJoinMutator {
            ctx,
            scope: Scope::default(),
            pairs: Vec::new(),
            active: Vec::new(),
        }
    }

    fn join_column(&self, column: &ColumnRef) -> Option<String> {
        self.ctx
            .column(&column.table, &column.column)
            .and_then(|config| config.join.as_ref())
            .map(|settings| settings.column.clone())
    }

    fn record_pair(&mut self, left: ColumnRef, right: ColumnRef) {
        let statement = self.scope.statement_index();
        if self.pairs.len() <= statement {
            self.pairs.resize_with(statement + 1, Vec::new);
        }
        self.pairs[statement].push((left, right));
    }
}

impl Visitor for ProbabilisticJoinMutator {
    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn scope_mut(&mut self) -> &mut Scope {
        &mut self.scope
    }

    fn visit_insert_statement(&mut self, insert: &mut Insert) -> TdeResult<()> {
        rewrite_insert_values(insert, &self.ctx, KIND, join_shadow, |column, literal| {
            join_key_value(&self.ctx, column, literal)
        })?;
        walk_insert(self, insert)
    }

    fn visit_update_statement(&mut self, mut update: UpdateStatement<'_>) -> TdeResult<()> {
        rewrite_update_assignments(&mut update, &self.ctx, KIND, join_shadow, |column, literal| {
            join_key_value(&self.ctx, column, literal)
        })?;
        walk_update(self, update)
    }

    fn visit_operator_expression(&mut self, expr: &mut Expr, ctx: Context) -> TdeResult<()> {
        let Some((left, right)) = join_pair(&self.ctx, &self.scope, expr, ctx)? else {
            return walk_operator_expression(self, expr, ctx);
        };

        if !self.scope.is_selected(&left) || !self.scope.is_selected(&right) {
            return Err(not_selected());
        }

        let (Some(left_shadow), Some(right_shadow)) = (self.join_column(&left), self.join_column(&right))
        else {
            return walk_operator_expression(self, expr, ctx);
        };
        if let Some((left_expr, right_expr)) = column_equality(expr) {
            rename_column(left_expr, &left_shadow);
            rename_column(right_expr, &right_shadow);
        }
        debug!("probabilistic join {} = {}", left, right);
        self.record_pair(left, right);
        Ok(())
    }

    fn visit_column(&mut self, _expr: &mut Expr, column: &ColumnRef, ctx: Context) -> TdeResult<()> {
        if ctx.in_select_body() || self.join_column(column).is_none() {
            return Ok(());
        }
        Err(TdeError::query(format!("invalid use of join column {}", column)))
    }
}

impl Mutator for ProbabilisticJoinMutator {
    fn name(&self) -> &'static str {
        "probabilistic_join"
    }

    fn mutate_query(&mut self, statements: &mut [Statement]) -> TdeResult<()> {
        self.pairs.clear();
        self.active.clear();
        self.visit_query(statements)
    }

    fn mutate_row_description(
        &mut self,
        message: &mut RowDescriptionMessage,
        statement: usize,
    ) -> TdeResult<()> {
        self.active.clear();
        let Some(pairs) = self.pairs.get(statement).filter(|pairs| !pairs.is_empty()) else {
            return Ok(());
        };
        let Some(results) = self.scope.results(statement) else {
            return Ok(());
        };

        let names: Vec<String> = message.columns().iter().map(|column| column.name()).collect();
        let position = |column: &ColumnRef| {
            names
                .iter()
                .position(|name| results.column(name) == Some(column))
        };

        let mut active = Vec::with_capacity(pairs.len());
        for (left, right) in pairs {
            match (position(left), position(right)) {
                (Some(l), Some(r)) => active.push((l, r)),
                _ => return Err(not_selected()),
            }
        }
        trace!("verifying joined columns {:?}", active);
        self.active = active;
        Ok(())
    }

    fn mutate_data_row(&mut self, message: &mut DataRowMessage) -> TdeResult<RowAction> {
        let values = message.values();
        for &(left, right) in &self.active {
            let left = values.get(left).and_then(|value| value.as_bytes());
            let right = values.get(right).and_then(|value| value.as_bytes());
            // NULL on either side is the padding of an outer join, not a match to verify.
            if let (Some(left), Some(right)) = (left, right)
                && left != right
            {
                return Ok(RowAction::Discard);
            }
        }
        Ok(RowAction::Keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticEncryptionConfig;
    use crate::crypto::{CryptoProvider, RustCryptoProvider};
    use crate::protocol::codec::VarByteN;
    use crate::protocol::messages::ColumnDescription;
    use crate::sql::{dump_query, parse_query};
    use crate::types;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn mutator() -> ProbabilisticJoinMutator {
        let config = StaticEncryptionConfig::new(8)
            .with_column(
                "cities",
                ColumnConfig::new("id", types::INT4).with_join(),
            )
            .with_column(
                "city2region",
                ColumnConfig::new("city_id", types::INT4).with_join(),
            );
        ProbabilisticJoinMutator::new(MutatorContext::new(
            Arc::new(config),
            Arc::new(RustCryptoProvider::new()),
        ))
    }

    fn mutate(mutator: &mut ProbabilisticJoinMutator, sql: &str) -> TdeResult<String> {
        let mut statements = parse_query(sql).unwrap();
        mutator.mutate_query(&mut statements)?;
        Ok(dump_query(&statements))
    }

    const JOIN: &str = "SELECT c.id, c2r.city_id FROM cities c JOIN city2region c2r ON c.id = c2r.city_id";

    #[test]
    fn test_join_condition_uses_join_keys() {
        let mut mutator = mutator();
        let sql = mutate(&mut mutator, JOIN).unwrap();
        assert!(sql.ends_with("ON c.id_join = c2r.city_id_join"), "{}", sql);
        assert!(sql.starts_with("SELECT c.id, c2r.city_id FROM"), "{}", sql);
    }

    #[test]
    fn test_joined_columns_must_be_selected() {
        let mut mutator = mutator();
        let err = mutate(
            &mut mutator,
            "SELECT c.id FROM cities c JOIN city2region c2r ON c.id = c2r.city_id",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "pgtde: columns present in join condition must be also present in SELECT body"
        );
    }

    #[test]
    fn test_rows_with_different_values_are_discarded() {
        let mut mutator = mutator();
        mutate(&mut mutator, JOIN).unwrap();

        let mut description = RowDescriptionMessage::new(vec![
            ColumnDescription::new("id", types::INT4, 4, 0),
            ColumnDescription::new("city_id", types::INT4, 4, 0),
        ]);
        mutator.mutate_row_description(&mut description, 0).unwrap();

        let mut matching = DataRowMessage::new(vec![VarByteN::value("1"), VarByteN::value("1")]);
        assert_eq!(mutator.mutate_data_row(&mut matching).unwrap(), RowAction::Keep);

        let mut collision = DataRowMessage::new(vec![VarByteN::value("1"), VarByteN::value("2")]);
        assert_eq!(mutator.mutate_data_row(&mut collision).unwrap(), RowAction::Discard);

        let mut padded = DataRowMessage::new(vec![VarByteN::value("1"), VarByteN::null()]);
        assert_eq!(mutator.mutate_data_row(&mut padded).unwrap(), RowAction::Keep);
    }

    #[test]
    fn test_missing_result_column_is_an_error() {
        let mut mutator = mutator();
        mutate(&mut mutator, JOIN).unwrap();
        let mut description =
            RowDescriptionMessage::new(vec![ColumnDescription::new("id", types::INT4, 4, 0)]);
        assert!(mutator.mutate_row_description(&mut description, 0).is_err());
    }

    #[test]
    fn test_insert_appends_truncated_digest() {
        let mut mutator = mutator();
        let sql = mutate(&mut mutator, "INSERT INTO cities (id, title) VALUES (42, 'x')").unwrap();
        let digest = RustCryptoProvider::new().sha256(&42i32.to_be_bytes());
        assert_eq!(
            sql,
            format!(
                "INSERT INTO cities (id, title, id_join) VALUES (42, 'x', '\\x{}')",
                hex::encode(&digest[..8])
            )
        );
    }

    #[test]
    fn test_join_column_outside_join_is_rejected() {
        let mut mutator = mutator();
        let err = mutate(&mut mutator, "SELECT c.id FROM cities c WHERE c.id = 5").unwrap_err();
        assert_eq!(err.to_string(), "pgtde: invalid use of join column cities.id");

        let err = mutate(
            &mut mutator,
            "SELECT c.id, r.region FROM cities c JOIN city2region r ON c.id = r.region",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "pgtde: invalid use of join column cities.id");
    }

    #[test]
    fn test_unprotected_columns_are_left_alone() {
        let mut mutator = mutator();
        let sql = mutate(&mut mutator, "SELECT c.id FROM cities c WHERE c.title = 'x'").unwrap();
        assert_eq!(sql, "SELECT c.id FROM cities AS c WHERE c.title = 'x'");
    }
}
