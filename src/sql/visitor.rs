//! Scope-aware traversal of parsed statements.
//!
//! [`Visitor`] has one method per construct the mutators care about. Every default method
//! delegates to the matching `walk_*` function, so an implementation overrides the hooks it
//! needs and calls the `walk_*` function to continue into children.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use bitflags::bitflags;
use sqlparser::ast::{
    visit_expressions_mut, visit_relations, Assignment, Delete, Expr, FromTable, GroupByExpr,
    Ident, Insert, JoinConstraint, JoinOperator, OnConflictAction, OnInsert, OrderByKind, Query,
    Select, SelectItem, SetExpr, Statement, TableAlias, TableFactor, TableObject, TableWithJoins,
    UpdateTableFromKind,
};
use tracing::trace;

use super::{normalize_ident, object_name_tail, ColumnRef};
use crate::error::{TdeError, TdeResult};

bitflags! {
    /// Clause the visited expression belongs to. Copied into each call, so a nested
    /// subquery never inherits the flags of its parent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Context: u8 {
        /// Projection of the result set returned to the client.
        const SELECT_BODY = 0b0001;
        const JOIN_CONDITION = 0b0010;
        /// GROUP BY and HAVING.
        const GROUP_BY = 0b0100;
        const ORDER_BY = 0b1000;
    }
}

impl Context {
    pub fn in_select_body(self) -> bool {
        self.contains(Context::SELECT_BODY)
    }

    pub fn in_join_condition(self) -> bool {
        self.contains(Context::JOIN_CONDITION)
    }

    pub fn in_group_by(self) -> bool {
        self.contains(Context::GROUP_BY)
    }

    pub fn in_order_by(self) -> bool {
        self.contains(Context::ORDER_BY)
    }
}

#[derive(Debug, Default)]
struct Frame {
    /// (name used in the query, table) in FROM order.
    tables: Vec<(String, String)>,
    /// Projection of this frame is what the client receives.
    returns_rows: bool,
}

/// Output columns of one statement that map back to a table column.
#[derive(Debug, Default, Clone)]
pub struct ResultColumns {
    aliases: HashMap<String, ColumnRef>,
    selected: HashSet<ColumnRef>,
}

impl ResultColumns {
    /// Source of the result column called `name` in the RowDescription.
    pub fn column(&self, name: &str) -> Option<&ColumnRef> {
        self.aliases.get(name)
    }

    pub fn is_selected(&self, column: &ColumnRef) -> bool {
        self.selected.contains(column)
    }
}

/// Name resolution state of the query being traversed.
#[derive(Debug, Default)]
pub struct Scope {
    frames: Vec<Frame>,
    statements: Vec<ResultColumns>,
}

impl Scope {
    pub fn reset(&mut self) {
        self.frames.clear();
        self.statements.clear();
    }

    pub fn begin_statement(&mut self) {
        self.frames.clear();
        self.statements.push(ResultColumns::default());
    }

    /// Index of the statement being traversed within the query.
    pub fn statement_index(&self) -> usize {
        self.statements.len().saturating_sub(1)
    }

    pub fn results(&self, statement: usize) -> Option<&ResultColumns> {
        self.statements.get(statement)
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    fn current_results_mut(&mut self) -> &mut ResultColumns {
        if self.statements.is_empty() {
            self.statements.push(ResultColumns::default());
        }
        let last = self.statements.len() - 1;
        &mut self.statements[last]
    }

    fn current_results(&self) -> Option<&ResultColumns> {
        self.statements.last()
    }

    pub fn push_frame(&mut self, returns_rows: bool) {
        self.frames.push(Frame {
            tables: Vec::new(),
            returns_rows,
        });
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub fn add_table(&mut self, reference: String, table: String) {
        trace!("scope: {} -> {}", reference, table);
        if let Some(frame) = self.frames.last_mut() {
            frame.tables.push((reference, table));
        }
    }

    pub fn returns_rows(&self) -> bool {
        self.frames.last().is_some_and(|frame| frame.returns_rows)
    }

    /// Every table visible from the current position, innermost first.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.frames
            .iter()
            .rev()
            .flat_map(|frame| frame.tables.iter().map(|(_, table)| table.as_str()))
    }

    pub fn table_for(&self, reference: &str) -> Option<&str> {
        self.frames.iter().rev().find_map(|frame| {
            frame
                .tables
                .iter()
                .find(|(name, _)| name == reference)
                .map(|(_, table)| table.as_str())
        })
    }

    pub fn is_selected(&self, column: &ColumnRef) -> bool {
        self.current_results()
            .is_some_and(|results| results.is_selected(column))
    }

    /// Records a projection column. One output name may only ever refer to one column.
    pub fn register_output(&mut self, name: String, column: ColumnRef) -> TdeResult<()> {
        let results = self.current_results_mut();
        if let Some(existing) = results.aliases.get(&name)
            && *existing != column
        {
            return Err(TdeError::query(format!(
                "detected ambiguous column name {}. Please specify a different alias for each column",
                name
            )));
        }
        results.selected.insert(column.clone());
        results.aliases.insert(name, column);
        Ok(())
    }

    /// Maps a column reference to the table it belongs to. `None` for expressions that are
    /// not columns and for columns of a query without tables.
    pub fn resolve_column(&self, expr: &Expr, ctx: Context) -> TdeResult<Option<ColumnRef>> {
        match expr {
            Expr::Identifier(ident) => self.resolve_unqualified(&normalize_ident(ident), ctx),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let column = normalize_ident(&parts[parts.len() - 1]);
                let qualifier = normalize_ident(&parts[parts.len() - 2]);
                let table = self.table_for(&qualifier).ok_or_else(|| {
                    TdeError::query(format!("missing FROM-clause entry for table {}", qualifier))
                })?;
                Ok(Some(ColumnRef::new(table, column)))
            }
            _ => Ok(None),
        }
    }

    fn output_alias(&self, name: &str) -> Option<ColumnRef> {
        self.current_results()
            .and_then(|results| results.column(name))
            .cloned()
    }

    fn resolve_unqualified(&self, name: &str, ctx: Context) -> TdeResult<Option<ColumnRef>> {
        // Output names shadow input columns in ORDER BY and GROUP BY.
        if (ctx.in_order_by() || ctx.in_group_by())
            && let Some(column) = self.output_alias(name)
        {
            return Ok(Some(column));
        }

        for frame in self.frames.iter().rev() {
            match frame.tables.as_slice() {
                [] => continue,
                [(_, table)] => return Ok(Some(ColumnRef::new(table.clone(), name))),
                _ => {
                    if let Some(column) = self.output_alias(name) {
                        return Ok(Some(column));
                    }
                    return Err(TdeError::query(format!(
                        "unable to determine the source of column {}. Please specify an explicit table/alias reference",
                        name
                    )));
                }
            }
        }
        Ok(self.output_alias(name))
    }
}

/// Borrowed parts of an UPDATE statement.
pub struct UpdateStatement<'a> {
    pub table: &'a mut TableWithJoins,
    pub assignments: &'a mut Vec<Assignment>,
    pub from: &'a mut Option<UpdateTableFromKind>,
    pub selection: &'a mut Option<Expr>,
    pub returning: &'a mut Option<Vec<SelectItem>>,
}

pub trait Visitor {
    fn scope(&self) -> &Scope;

    fn scope_mut(&mut self) -> &mut Scope;

    /// Entry point; resets the scope before each statement.
    fn visit_query(&mut self, statements: &mut [Statement]) -> TdeResult<()> {
        walk_query(self, statements)
    }

    fn visit_statement(&mut self, statement: &mut Statement) -> TdeResult<()> {
        walk_statement(self, statement)
    }

    fn visit_select(&mut self, select: &mut Select) -> TdeResult<()> {
        walk_select(self, select)
    }

    fn visit_insert_statement(&mut self, insert: &mut Insert) -> TdeResult<()> {
        walk_insert(self, insert)
    }

    fn visit_update_statement(&mut self, update: UpdateStatement<'_>) -> TdeResult<()> {
        walk_update(self, update)
    }

    fn visit_delete_statement(&mut self, delete: &mut Delete) -> TdeResult<()> {
        walk_delete(self, delete)
    }

    fn visit_expression(&mut self, expr: &mut Expr, ctx: Context) -> TdeResult<()> {
        walk_expression(self, expr, ctx)
    }

    /// Binary operator expressions.
    fn visit_operator_expression(&mut self, expr: &mut Expr, ctx: Context) -> TdeResult<()> {
        walk_operator_expression(self, expr, ctx)
    }

    /// A column reference that resolved to a table column.
    fn visit_column(&mut self, _expr: &mut Expr, _column: &ColumnRef, _ctx: Context) -> TdeResult<()> {
        Ok(())
    }

    /// `*` or `t.*` in a projection.
    fn visit_wildcard(&mut self) -> TdeResult<()> {
        Ok(())
    }

    /// A construct the traversal does not look into, e.g. `JOIN ... USING`.
    fn visit_unsupported(&mut self, _feature: &str) -> TdeResult<()> {
        Ok(())
    }

    /// A statement kind that is not traversed, such as MERGE or SET. The tables it names are
    /// in scope during the call.
    fn visit_other_statement(&mut self) -> TdeResult<()> {
        Ok(())
    }
}

pub fn walk_query<V: Visitor + ?Sized>(visitor: &mut V, statements: &mut [Statement]) -> TdeResult<()> {
    visitor.scope_mut().reset();
    for statement in statements.iter_mut() {
        visitor.scope_mut().begin_statement();
        visitor.visit_statement(statement)?;
    }
    Ok(())
}

pub fn walk_statement<V: Visitor + ?Sized>(visitor: &mut V, statement: &mut Statement) -> TdeResult<()> {
    match statement {
        Statement::Query(query) => walk_query_expr(visitor, query, true),
        Statement::Insert(insert) => visitor.visit_insert_statement(insert),
        Statement::Update {
            table,
            assignments,
            from,
            selection,
            returning,
            ..
        } => visitor.visit_update_statement(UpdateStatement {
            table,
            assignments,
            from,
            selection,
            returning,
        }),
        Statement::Delete(delete) => visitor.visit_delete_statement(delete),
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. }
        | Statement::Copy { .. } => Err(TdeError::unsupported("unsupported statement")),
        // EXPLAIN ANALYZE runs the statement.
        Statement::Explain { statement, .. } => visitor.visit_statement(statement),
        other => walk_other_statement(visitor, other),
    }
}

/// Puts every table an untraversed statement names into scope for
/// [`Visitor::visit_other_statement`].
fn walk_other_statement<V: Visitor + ?Sized>(visitor: &mut V, statement: &Statement) -> TdeResult<()> {
    let mut tables = Vec::new();
    let _ = visit_relations(statement, |name| {
        if let Some(table) = object_name_tail(name) {
            tables.push(table);
        }
        ControlFlow::<()>::Continue(())
    });

    visitor.scope_mut().push_frame(false);
    for table in tables {
        visitor.scope_mut().add_table(table.clone(), table);
    }
    let result = visitor.visit_other_statement();
    visitor.scope_mut().pop_frame();
    result
}

/// A (sub)query. `returns_rows` marks the query whose projection reaches the client.
pub fn walk_query_expr<V: Visitor + ?Sized>(
    visitor: &mut V,
    query: &mut Query,
    returns_rows: bool,
) -> TdeResult<()> {
    if let Some(with) = query.with.as_mut() {
        for cte in with.cte_tables.iter_mut() {
            walk_query_expr(visitor, &mut cte.query, false)?;
        }
    }

    visitor.scope_mut().push_frame(returns_rows);
    let result = walk_query_body(visitor, query, returns_rows);
    visitor.scope_mut().pop_frame();
    result
}

fn walk_query_body<V: Visitor + ?Sized>(
    visitor: &mut V,
    query: &mut Query,
    returns_rows: bool,
) -> TdeResult<()> {
    walk_set_expr(visitor, &mut query.body, returns_rows)?;

    if let Some(order_by) = query.order_by.as_mut()
        && let OrderByKind::Expressions(items) = &mut order_by.kind
    {
        for item in items.iter_mut() {
            visitor.visit_expression(&mut item.expr, Context::ORDER_BY)?;
        }
    }
    Ok(())
}

fn walk_set_expr<V: Visitor + ?Sized>(
    visitor: &mut V,
    body: &mut SetExpr,
    returns_rows: bool,
) -> TdeResult<()> {
    match body {
        SetExpr::Select(select) => visitor.visit_select(select),
        SetExpr::Query(query) => walk_query_expr(visitor, query, returns_rows),
        SetExpr::SetOperation { .. } => Err(TdeError::unsupported("UNION queries are not supported")),
        SetExpr::Values(values) => {
            for row in values.rows.iter_mut() {
                for expr in row.iter_mut() {
                    visitor.visit_expression(expr, Context::empty())?;
                }
            }
            Ok(())
        }
        _ => Err(TdeError::unsupported("unsupported statement")),
    }
}

/// Clause order: FROM, projection, join conditions, WHERE, GROUP BY, HAVING.
pub fn walk_select<V: Visitor + ?Sized>(visitor: &mut V, select: &mut Select) -> TdeResult<()> {
    for table in select.from.iter_mut() {
        register_tables(visitor, table)?;
    }

    walk_projection(visitor, &mut select.projection)?;

    for table in select.from.iter_mut() {
        walk_join_constraints(visitor, table)?;
    }

    if let Some(selection) = select.selection.as_mut() {
        visitor.visit_expression(selection, Context::empty())?;
    }

    if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
        for expr in exprs.iter_mut() {
            visitor.visit_expression(expr, Context::GROUP_BY)?;
        }
    }

    if let Some(having) = select.having.as_mut() {
        visitor.visit_expression(having, Context::GROUP_BY)?;
    }
    Ok(())
}

pub fn walk_projection<V: Visitor + ?Sized>(visitor: &mut V, items: &mut [SelectItem]) -> TdeResult<()> {
    let returns_rows = visitor.scope().returns_rows();
    let ctx = if returns_rows {
        Context::SELECT_BODY
    } else {
        Context::empty()
    };

    for item in items.iter_mut() {
        match item {
            SelectItem::UnnamedExpr(expr) => {
                if returns_rows {
                    register_output(visitor, expr, None, ctx)?;
                }
                visitor.visit_expression(expr, ctx)?;
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                if returns_rows {
                    register_output(visitor, expr, Some(alias), ctx)?;
                }
                visitor.visit_expression(expr, ctx)?;
            }
            _ => visitor.visit_wildcard()?,
        }
    }
    Ok(())
}

fn register_output<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Expr,
    alias: Option<&Ident>,
    ctx: Context,
) -> TdeResult<()> {
    if let Some(column) = visitor.scope().resolve_column(expr, ctx)? {
        let name = alias
            .map(normalize_ident)
            .unwrap_or_else(|| column.column.clone());
        visitor.scope_mut().register_output(name, column)?;
    }
    Ok(())
}

fn register_tables<V: Visitor + ?Sized>(visitor: &mut V, table: &mut TableWithJoins) -> TdeResult<()> {
    register_factor(visitor, &mut table.relation)?;
    for join in table.joins.iter_mut() {
        register_factor(visitor, &mut join.relation)?;
    }
    Ok(())
}

fn register_factor<V: Visitor + ?Sized>(visitor: &mut V, factor: &mut TableFactor) -> TdeResult<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            if let Some(table) = object_name_tail(name) {
                let reference = alias
                    .as_ref()
                    .map(|alias| normalize_ident(&alias.name))
                    .unwrap_or_else(|| table.clone());
                visitor.scope_mut().add_table(reference, table);
            }
            Ok(())
        }
        TableFactor::Derived { subquery, alias, .. } => {
            walk_query_expr(visitor, subquery, false)?;
            register_alias(visitor, alias.as_ref());
            Ok(())
        }
        TableFactor::NestedJoin {
            table_with_joins,
            alias,
        } => {
            register_tables(visitor, table_with_joins)?;
            register_alias(visitor, alias.as_ref());
            Ok(())
        }
        TableFactor::TableFunction { alias, .. }
        | TableFactor::Function { alias, .. }
        | TableFactor::UNNEST { alias, .. }
        | TableFactor::JsonTable { alias, .. }
        | TableFactor::XmlTable { alias, .. } => {
            register_alias(visitor, alias.as_ref());
            visitor.visit_unsupported("table function")
        }
        _ => visitor.visit_unsupported("table function"),
    }
}

/// A named relation without table columns of its own.
fn register_alias<V: Visitor + ?Sized>(visitor: &mut V, alias: Option<&TableAlias>) {
    if let Some(alias) = alias {
        let name = normalize_ident(&alias.name);
        visitor.scope_mut().add_table(name.clone(), name);
    }
}

fn join_constraint(operator: &mut JoinOperator) -> Option<&mut JoinConstraint> {
    match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::Semi(constraint)
        | JoinOperator::LeftSemi(constraint)
        | JoinOperator::RightSemi(constraint)
        | JoinOperator::Anti(constraint)
        | JoinOperator::LeftAnti(constraint)
        | JoinOperator::RightAnti(constraint)
        | JoinOperator::StraightJoin(constraint) => Some(constraint),
        JoinOperator::AsOf { constraint, .. } => Some(constraint),
        _ => None,
    }
}

fn walk_join_constraints<V: Visitor + ?Sized>(visitor: &mut V, table: &mut TableWithJoins) -> TdeResult<()> {
    walk_nested_join(visitor, &mut table.relation)?;
    for join in table.joins.iter_mut() {
        walk_nested_join(visitor, &mut join.relation)?;
        match join_constraint(&mut join.join_operator) {
            Some(JoinConstraint::On(expr)) => {
                visitor.visit_expression(expr, Context::JOIN_CONDITION)?
            }
            Some(JoinConstraint::Using(_)) => visitor.visit_unsupported("JOIN ... USING")?,
            Some(JoinConstraint::Natural) => visitor.visit_unsupported("NATURAL JOIN")?,
            Some(JoinConstraint::None) | None => {}
        }
    }
    Ok(())
}

fn walk_nested_join<V: Visitor + ?Sized>(visitor: &mut V, factor: &mut TableFactor) -> TdeResult<()> {
    if let TableFactor::NestedJoin {
        table_with_joins, ..
    } = factor
    {
        walk_join_constraints(visitor, table_with_joins)?;
    }
    Ok(())
}

pub fn walk_insert<V: Visitor + ?Sized>(visitor: &mut V, insert: &mut Insert) -> TdeResult<()> {
    let table = insert_table(insert);
    let reference = insert
        .table_alias
        .as_ref()
        .map(normalize_ident)
        .or_else(|| table.clone());

    visitor.scope_mut().push_frame(true);
    if let (Some(table), Some(reference)) = (&table, &reference) {
        visitor.scope_mut().add_table(reference.clone(), table.clone());
    }
    let mut result = walk_insert_body(visitor, insert);
    visitor.scope_mut().pop_frame();

    if result.is_ok()
        && let Some(assignments) = upsert_assignments(insert)
    {
        // `excluded` sits in an outer frame so that unqualified names resolve to the target.
        let scope = visitor.scope_mut();
        scope.push_frame(false);
        if let Some(table) = &table {
            scope.add_table("excluded".to_string(), table.clone());
        }
        scope.push_frame(false);
        if let (Some(table), Some(reference)) = (table, reference) {
            scope.add_table(reference, table);
        }
        result = walk_upsert(visitor, assignments);
        visitor.scope_mut().pop_frame();
        visitor.scope_mut().pop_frame();
    }
    result
}

/// Assignments and condition of `ON CONFLICT ... DO UPDATE` (or `ON DUPLICATE KEY UPDATE`).
pub fn upsert_assignments(insert: &mut Insert) -> Option<(&mut Vec<Assignment>, Option<&mut Expr>)> {
    match insert.on.as_mut()? {
        OnInsert::DuplicateKeyUpdate(assignments) => Some((assignments, None)),
        OnInsert::OnConflict(conflict) => match &mut conflict.action {
            OnConflictAction::DoUpdate(update) => {
                Some((&mut update.assignments, update.selection.as_mut()))
            }
            OnConflictAction::DoNothing => None,
        },
        _ => None,
    }
}

fn walk_upsert<V: Visitor + ?Sized>(
    visitor: &mut V,
    (assignments, selection): (&mut Vec<Assignment>, Option<&mut Expr>),
) -> TdeResult<()> {
    for assignment in assignments.iter_mut() {
        visitor.visit_expression(&mut assignment.value, Context::empty())?;
    }
    if let Some(selection) = selection {
        visitor.visit_expression(selection, Context::empty())?;
    }
    Ok(())
}

fn walk_insert_body<V: Visitor + ?Sized>(visitor: &mut V, insert: &mut Insert) -> TdeResult<()> {
    if let Some(source) = insert.source.as_mut() {
        match source.body.as_mut() {
            SetExpr::Values(values) => {
                for row in values.rows.iter_mut() {
                    for expr in row.iter_mut() {
                        visitor.visit_expression(expr, Context::empty())?;
                    }
                }
            }
            _ => walk_query_expr(visitor, source, false)?,
        }
    }
    if let Some(returning) = insert.returning.as_mut() {
        walk_projection(visitor, returning)?;
    }
    Ok(())
}

/// Target table of an INSERT.
pub fn insert_table(insert: &Insert) -> Option<String> {
    match &insert.table {
        TableObject::TableName(name) => object_name_tail(name),
        _ => None,
    }
}

/// Target table of an UPDATE.
pub fn update_table(table: &TableWithJoins) -> Option<String> {
    match &table.relation {
        TableFactor::Table { name, .. } => object_name_tail(name),
        _ => None,
    }
}

pub fn walk_update<V: Visitor + ?Sized>(visitor: &mut V, update: UpdateStatement<'_>) -> TdeResult<()> {
    visitor.scope_mut().push_frame(true);
    let result = walk_update_body(visitor, update);
    visitor.scope_mut().pop_frame();
    result
}

fn walk_update_body<V: Visitor + ?Sized>(visitor: &mut V, update: UpdateStatement<'_>) -> TdeResult<()> {
    register_tables(visitor, update.table)?;
    let from: &mut [TableWithJoins] = match update.from.as_mut() {
        Some(UpdateTableFromKind::BeforeSet(tables) | UpdateTableFromKind::AfterSet(tables)) => {
            tables.as_mut_slice()
        }
        None => &mut [],
    };
    for table in from.iter_mut() {
        register_tables(visitor, table)?;
    }
    walk_join_constraints(visitor, update.table)?;
    for table in from.iter_mut() {
        walk_join_constraints(visitor, table)?;
    }
    for assignment in update.assignments.iter_mut() {
        visitor.visit_expression(&mut assignment.value, Context::empty())?;
    }
    if let Some(selection) = update.selection.as_mut() {
        visitor.visit_expression(selection, Context::empty())?;
    }
    if let Some(returning) = update.returning.as_mut() {
        walk_projection(visitor, returning)?;
    }
    Ok(())
}

pub fn walk_delete<V: Visitor + ?Sized>(visitor: &mut V, delete: &mut Delete) -> TdeResult<()> {
    visitor.scope_mut().push_frame(true);
    let result = walk_delete_body(visitor, delete);
    visitor.scope_mut().pop_frame();
    result
}

fn walk_delete_body<V: Visitor + ?Sized>(visitor: &mut V, delete: &mut Delete) -> TdeResult<()> {
    let tables = match &mut delete.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };
    for table in tables.iter_mut() {
        register_tables(visitor, table)?;
    }
    if let Some(using) = delete.using.as_mut() {
        for table in using.iter_mut() {
            register_tables(visitor, table)?;
        }
    }
    if let Some(selection) = delete.selection.as_mut() {
        visitor.visit_expression(selection, Context::empty())?;
    }
    if let Some(returning) = delete.returning.as_mut() {
        walk_projection(visitor, returning)?;
    }
    Ok(())
}

pub fn walk_expression<V: Visitor + ?Sized>(visitor: &mut V, expr: &mut Expr, ctx: Context) -> TdeResult<()> {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            match visitor.scope().resolve_column(expr, ctx)? {
                Some(column) => visitor.visit_column(expr, &column, ctx),
                None => Ok(()),
            }
        }
        Expr::Value(_) => Ok(()),
        Expr::BinaryOp { .. } => visitor.visit_operator_expression(expr, ctx),
        Expr::UnaryOp { expr: inner, .. }
        | Expr::Nested(inner)
        | Expr::IsNull(inner)
        | Expr::IsNotNull(inner) => visitor.visit_expression(inner, ctx),
        Expr::InList { expr: inner, list, .. } => {
            visitor.visit_expression(inner, ctx)?;
            for item in list.iter_mut() {
                visitor.visit_expression(item, ctx)?;
            }
            Ok(())
        }
        Expr::Between {
            expr: inner,
            low,
            high,
            ..
        } => {
            visitor.visit_expression(inner, ctx)?;
            visitor.visit_expression(low, ctx)?;
            visitor.visit_expression(high, ctx)
        }
        Expr::Like {
            expr: inner,
            pattern,
            ..
        }
        | Expr::ILike {
            expr: inner,
            pattern,
            ..
        } => {
            visitor.visit_expression(inner, ctx)?;
            visitor.visit_expression(pattern, ctx)
        }
        Expr::Array(array) => {
            for element in array.elem.iter_mut() {
                visitor.visit_expression(element, ctx)?;
            }
            Ok(())
        }
        Expr::Subquery(query) | Expr::Exists { subquery: query, .. } => {
            walk_query_expr(visitor, query, false)
        }
        Expr::InSubquery {
            expr: inner,
            subquery,
            ..
        } => {
            visitor.visit_expression(inner, ctx)?;
            visitor.scope_mut().push_frame(false);
            let result = walk_set_expr(visitor, subquery, false);
            visitor.scope_mut().pop_frame();
            result
        }
        other => walk_nested_columns(visitor, other, ctx),
    }
}

pub fn walk_operator_expression<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &mut Expr,
    ctx: Context,
) -> TdeResult<()> {
    if let Expr::BinaryOp { left, right, .. } = expr {
        visitor.visit_expression(left, ctx)?;
        visitor.visit_expression(right, ctx)?;
    }
    Ok(())
}

/// Functions, casts, CASE and everything else: every column reference found anywhere inside
/// is visited in the enclosing context.
fn walk_nested_columns<V: Visitor + ?Sized>(visitor: &mut V, expr: &mut Expr, ctx: Context) -> TdeResult<()> {
    let flow = visit_expressions_mut(expr, |inner| {
        if super::is_column(inner)
            && let Err(e) = visitor.visit_expression(inner, ctx)
        {
            return ControlFlow::Break(e);
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(e) => Err(e),
        ControlFlow::Continue(()) => Ok(()),
    }
}
