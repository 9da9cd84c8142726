//! SQLite-dialect parse and print helpers over `sqlparser`.
//!
//! Mutants are built on the `sqlparser` AST and printed with its `Display`
//! impls. Clauses that carry many optional fields (joins, ORDER BY, LIMIT,
//! function calls) are built by parsing a small SQL fragment with the same
//! dialect, so they always print the way the parser reads them.

use sqlparser::ast::{
    Expr, Ident, Join, ObjectName, ObjectNamePart, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, Value, ValueWithSpan,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::keywords::ALL_KEYWORDS;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Span;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("SQL syntax error: {0}")]
    Syntax(#[from] ParserError),
    #[error("Expected exactly one statement, found {0}")]
    StatementCount(usize),
    #[error("Statement is not a query: {0}")]
    NotAQuery(String),
    #[error("Query has no SELECT")]
    NoSelect,
    #[error("SQL fragment did not yield a {0}")]
    Fragment(&'static str),
}

/// Parses a single query statement. A trailing semicolon is accepted.
pub fn parse_query(sql: &str) -> Result<Box<Query>, ParseError> {
    let mut statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;
    if statements.len() != 1 {
        return Err(ParseError::StatementCount(statements.len()));
    }
    match statements.pop() {
        Some(Statement::Query(query)) => Ok(query),
        Some(other) => Err(ParseError::NotAQuery(other.to_string())),
        None => Err(ParseError::StatementCount(0)),
    }
}

/// Parses a single non-compound `SELECT` and returns its body.
pub fn parse_select(sql: &str) -> Result<Select, ParseError> {
    let query = parse_query(sql)?;
    match *query.body {
        SetExpr::Select(select) => Ok(*select),
        _ => Err(ParseError::NoSelect),
    }
}

pub fn parse_expr(sql: &str) -> Result<Expr, ParseError> {
    let expr = Parser::new(&SQLiteDialect {})
        .try_with_sql(sql)?
        .parse_expr()?;
    Ok(expr)
}

/// Splits a script into its statements, printed back one per entry.
///
/// Comments and string literals are handled by the tokenizer, so a `;`
/// inside either does not end a statement.
pub fn split_statements(script: &str) -> Result<Vec<String>, ParseError> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, script)?;
    Ok(statements.iter().map(ToString::to_string).collect())
}

/// The SELECT that owns the FROM clause of `query`: the body itself, or
/// the leftmost arm of a compound query.
pub fn primary_select(query: &Query) -> Option<&Select> {
    fn descend(body: &SetExpr) -> Option<&Select> {
        match body {
            SetExpr::Select(select) => Some(&**select),
            SetExpr::SetOperation { left, .. } => descend(left),
            SetExpr::Query(query) => descend(&query.body),
            _ => None,
        }
    }
    descend(&query.body)
}

pub fn primary_select_mut(query: &mut Query) -> Option<&mut Select> {
    fn descend(body: &mut SetExpr) -> Option<&mut Select> {
        match body {
            SetExpr::Select(select) => Some(&mut **select),
            SetExpr::SetOperation { left, .. } => descend(left),
            SetExpr::Query(query) => descend(&mut query.body),
            _ => None,
        }
    }
    descend(&mut query.body)
}

/// True when the query body is one plain SELECT rather than a set operation.
pub fn is_simple_select(query: &Query) -> bool {
    matches!(*query.body, SetExpr::Select(_))
}

/// An identifier, double-quoted when it is not a plain word or collides
/// with a keyword.
pub fn ident(name: &str) -> Ident {
    if is_plain_word(name) {
        Ident::new(name)
    } else {
        Ident::with_quote('"', name)
    }
}

fn is_plain_word(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_well
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !ALL_KEYWORDS.contains(&name.to_ascii_uppercase().as_str())
}

pub fn object_name(name: &str) -> ObjectName {
    ObjectName(vec![ObjectNamePart::Identifier(ident(name))])
}

/// The unqualified name an object name ends with.
pub fn object_name_last(name: &ObjectName) -> Option<&str> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.as_str()),
        _ => None,
    })
}

/// A column reference, qualified with `table` when given.
pub fn column(table: Option<&str>, name: &str) -> Expr {
    match table {
        Some(table) => Expr::CompoundIdentifier(vec![ident(table), ident(name)]),
        None => Expr::Identifier(ident(name)),
    }
}

pub fn number(value: i64) -> Expr {
    literal(Value::Number(value.to_string(), false))
}

pub fn boolean(value: bool) -> Expr {
    literal(Value::Boolean(value))
}

fn literal(value: Value) -> Expr {
    Expr::Value(ValueWithSpan {
        value,
        span: Span::empty(),
    })
}

/// `FROM <name> [AS <alias>]` as a table factor.
pub fn table_factor(name: &str, alias: Option<&str>) -> Result<TableFactor, ParseError> {
    let mut text = format!("SELECT * FROM {}", ident(name));
    if let Some(alias) = alias {
        text.push_str(&format!(" AS {}", ident(alias)));
    }
    parse_select(&text)?
        .from
        .into_iter()
        .next()
        .map(|table| table.relation)
        .ok_or(ParseError::Fragment("table"))
}

/// A join clause such as `JOIN t1 ON t0.c0 = t1.c4`, attached to `source`.
pub fn join_clause(source: &str, clause: &str) -> Result<Join, ParseError> {
    parse_select(&format!("SELECT * FROM {} {clause}", ident(source)))?
        .from
        .into_iter()
        .next()
        .and_then(|table| table.joins.into_iter().next())
        .ok_or(ParseError::Fragment("join"))
}

/// `<table>.*` as a select item.
pub fn qualified_wildcard(table: &str) -> Result<SelectItem, ParseError> {
    let table = ident(table);
    parse_select(&format!("SELECT {table}.* FROM {table}"))?
        .projection
        .pop()
        .ok_or(ParseError::Fragment("wildcard"))
}

/// Name and alias of a plain table factor; `None` for derived tables,
/// table functions and the like.
pub fn table_factor_name(factor: &TableFactor) -> Option<(&str, Option<&str>)> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let alias = alias.as_ref().map(|alias| alias.name.value.as_str());
            object_name_last(name).map(|name| (name, alias))
        }
        _ => None,
    }
}
