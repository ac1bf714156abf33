//! Equality search on encrypted columns through an HMAC shadow column.

use sqlparser::ast::{Expr, Insert, Statement};
use tracing::debug;

use super::probabilistic_join::join_pair;
use super::{
    column_literal_comparison, literal_plaintext, rewrite_insert_values,
    rewrite_update_assignments, Mutator, MutatorContext, ValueRewrite,
};
use crate::config::ColumnConfig;
use crate::error::{TdeError, TdeResult};
use crate::sql::visitor::{walk_expression, walk_insert, walk_operator_expression, walk_update, UpdateStatement};
use crate::sql::{bytea_literal, is_column, literal_of, null_literal, rename_column, ColumnRef, Context, Literal, Scope, Visitor};

const KIND: &str = "blind-indexed";

pub struct BlindIndexMutator {
    ctx: MutatorContext,
    scope: Scope,
}

impl BlindIndexMutator {
    pub fn new(ctx: MutatorContext) -> Self {
        BlindIndexMutator {
            ctx,
            scope: Scope::default(),
        }
    }

    /// Blind index configuration of the column `expr` refers to.
    fn indexed_column(&self, expr: &Expr, ctx: Context) -> TdeResult<Option<(ColumnRef, &ColumnConfig)>> {
        let Some(column) = self.scope.resolve_column(expr, ctx)? else {
            return Ok(None);
        };
        Ok(self
            .ctx
            .column(&column.table, &column.column)
            .filter(|config| config.has_blind_index())
            .map(|config| (column, config)))
    }
}

fn blind_index_value(ctx: &MutatorContext, column: &ColumnConfig, literal: &Literal) -> TdeResult<Expr> {
    let Some(settings) = &column.blind_index else {
        return Ok(null_literal());
    };
    match literal_plaintext(literal, column)? {
        Some(plaintext) => {
            let digest = ctx.crypto.hmac_sha256(&settings.key, &plaintext)?;
            Ok(bytea_literal(&digest))
        }
        None => Ok(null_literal()),
    }
}

impl Visitor for BlindIndexMutator {
    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn scope_mut(&mut self) -> &mut Scope {
        &mut self.scope
    }

    fn visit_insert_statement(&mut self, insert: &mut Insert) -> TdeResult<()> {
        rewrite_insert_values(
            insert,
            &self.ctx,
            KIND,
            |column| {
                column
                    .blind_index
                    .as_ref()
                    .map(|settings| ValueRewrite::Append(settings.column.clone()))
            },
            |column, literal| blind_index_value(&self.ctx, column, literal),
        )?;
        walk_insert(self, insert)
    }

    fn visit_update_statement(&mut self, mut update: UpdateStatement<'_>) -> TdeResult<()> {
        rewrite_update_assignments(
            &mut update,
            &self.ctx,
            KIND,
            |column| {
                column
                    .blind_index
                    .as_ref()
                    .map(|settings| ValueRewrite::Append(settings.column.clone()))
            },
            |column, literal| blind_index_value(&self.ctx, column, literal),
        )?;
        walk_update(self, update)
    }

    fn visit_expression(&mut self, expr: &mut Expr, ctx: Context) -> TdeResult<()> {
        // column IN (literal, ...)
        if let Expr::InList { expr: target, list, .. } = expr
            && is_column(target)
            && list.iter().all(|item| literal_of(item).is_some())
            && let Some((column, config)) = self.indexed_column(target, ctx)?
            && let Some(settings) = &config.blind_index
        {
            for item in list.iter_mut() {
                let literal = literal_of(item).unwrap_or(Literal::Null);
                *item = blind_index_value(&self.ctx, config, &literal)?;
            }
            rename_column(target, &settings.column);
            debug!("blind index lookup on {} with {} values", column, list.len());
            return Ok(());
        }
        walk_expression(self, expr, ctx)
    }

    fn visit_operator_expression(&mut self, expr: &mut Expr, ctx: Context) -> TdeResult<()> {
        if join_pair(&self.ctx, &self.scope, expr, ctx)?.is_some() {
            return Ok(());
        }

        if let Some((column_expr, literal_expr)) = column_literal_comparison(expr)
            && let Some((column, config)) = self.indexed_column(column_expr, ctx)?
            && let Some(settings) = &config.blind_index
        {
            let literal = literal_of(literal_expr).unwrap_or(Literal::Null);
            *literal_expr = blind_index_value(&self.ctx, config, &literal)?;
            rename_column(column_expr, &settings.column);
            debug!("blind index comparison on {}", column);
            return Ok(());
        }

        walk_operator_expression(self, expr, ctx)
    }

    fn visit_column(&mut self, expr: &mut Expr, column: &ColumnRef, ctx: Context) -> TdeResult<()> {
        let Some(settings) = self
            .ctx
            .column(&column.table, &column.column)
            .and_then(|config| config.blind_index.as_ref())
        else {
            return Ok(());
        };

        if ctx.in_select_body() {
            Ok(())
        } else if ctx.in_group_by() {
            rename_column(expr, &settings.column);
            Ok(())
        } else {
            Err(TdeError::query(format!(
                "invalid use of blind indexed column {}",
                column
            )))
        }
    }
}

impl Mutator for BlindIndexMutator {
    fn name(&self) -> &'static str {
        "blind_index"
    }

    fn mutate_query(&mut self, statements: &mut [Statement]) -> TdeResult<()> {
        self.visit_query(statements)
    }
}
