//! SQL parsing helpers shared by the traversal and the mutators.

pub mod visitor;

use std::fmt;

use sqlparser::ast::{Expr, Ident, ObjectName, ObjectNamePart, Statement, UnaryOperator, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Location, Span};

use crate::error::TdeResult;

pub use visitor::{Context, Scope, Visitor};

/// A column resolved to the table it belongs to. Both parts are normalized identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        ColumnRef {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Constant operand of a comparison or an INSERT/UPDATE value.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    String(String),
    Number(String),
    Boolean(bool),
}

pub fn literal_of(expr: &Expr) -> Option<Literal> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Some(Literal::Null),
            Value::SingleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::DoubleQuotedString(s) => Some(Literal::String(s.clone())),
            Value::Number(n, _) => Some(Literal::Number(n.clone())),
            Value::Boolean(b) => Some(Literal::Boolean(*b)),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal_of(expr)? {
            Literal::Number(n) => Some(Literal::Number(format!("-{}", n))),
            _ => None,
        },
        Expr::Nested(inner) => literal_of(inner),
        _ => None,
    }
}

pub fn is_column(expr: &Expr) -> bool {
    matches!(expr, Expr::Identifier(_) | Expr::CompoundIdentifier(_))
}

/// Unquoted identifiers fold to lower case, quoted ones keep their spelling.
pub fn normalize_ident(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

/// Last part of a possibly schema-qualified name.
pub fn object_name_tail(name: &ObjectName) -> Option<String> {
    match name.0.last()? {
        ObjectNamePart::Identifier(ident) => Some(normalize_ident(ident)),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Points the column reference at `column`, keeping any qualifier.
pub fn rename_column(expr: &mut Expr, column: &str) {
    match expr {
        Expr::Identifier(ident) => *ident = Ident::new(column),
        Expr::CompoundIdentifier(parts) => {
            if let Some(last) = parts.last_mut() {
                *last = Ident::new(column);
            }
        }
        _ => {}
    }
}

fn empty_span() -> Span {
    Span {
        start: Location { line: 1, column: 1 },
        end: Location { line: 1, column: 1 },
    }
}

/// `'\x...'` literal the server accepts for bytea columns.
pub fn bytea_literal(bytes: &[u8]) -> Expr {
    Expr::Value(ValueWithSpan {
        value: Value::SingleQuotedString(format!("\\x{}", hex::encode(bytes))),
        span: empty_span(),
    })
}

pub fn null_literal() -> Expr {
    Expr::Value(ValueWithSpan {
        value: Value::Null,
        span: empty_span(),
    })
}

pub fn parse_query(sql: &str) -> TdeResult<Vec<Statement>> {
    let dialect = PostgreSqlDialect {};
    Ok(Parser::parse_sql(&dialect, sql)?)
}

pub fn dump_query(statements: &[Statement]) -> String {
    statements
        .iter()
        .map(|statement| statement.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn where_expr(sql: &str) -> Expr {
        let statements = parse_query(sql).unwrap();
        let Statement::Query(query) = &statements[0] else {
            panic!("not a query");
        };
        let sqlparser::ast::SetExpr::Select(select) = query.body.as_ref() else {
            panic!("not a select");
        };
        select.selection.clone().unwrap()
    }

    #[test]
    fn test_literals() {
        let Expr::BinaryOp { right, .. } = where_expr("SELECT 1 FROM t WHERE a = -42") else {
            panic!();
        };
        assert_eq!(literal_of(&right), Some(Literal::Number("-42".to_string())));

        let Expr::BinaryOp { right, .. } = where_expr("SELECT 1 FROM t WHERE a = 'x'") else {
            panic!();
        };
        assert_eq!(literal_of(&right), Some(Literal::String("x".to_string())));

        let Expr::BinaryOp { right, .. } = where_expr("SELECT 1 FROM t WHERE a = b") else {
            panic!();
        };
        assert_eq!(literal_of(&right), None);
    }

    #[test]
    fn test_identifier_normalization() {
        assert_eq!(normalize_ident(&Ident::new("Name")), "name");
        assert_eq!(normalize_ident(&Ident::with_quote('"', "Name")), "Name");
    }

    #[test]
    fn test_rename_keeps_qualifier() {
        let Expr::BinaryOp { mut left, .. } = where_expr("SELECT 1 FROM t WHERE c.name = 'x'") else {
            panic!();
        };
        rename_column(&mut left, "name_bi");
        assert_eq!(left.to_string(), "c.name_bi");
    }

    #[test]
    fn test_bytea_literal() {
        assert_eq!(bytea_literal(&[0xde, 0xad]).to_string(), "'\\xdead'");
    }

    #[test]
    fn test_dump_joins_statements() {
        let statements = parse_query("SELECT 1; SELECT 2").unwrap();
        assert_eq!(dump_query(&statements), "SELECT 1; SELECT 2");
    }
}
