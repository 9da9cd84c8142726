use crate::schema::{Schema, TableSchema};
use crate::sql::{self, ParseError};
use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    BinaryOperator, Expr, GroupByExpr, Join, JoinConstraint, JoinOperator, OrderBy, OrderByKind,
    Query, Select, SelectItem, TableFactor, TableWithJoins, UnaryOperator, Value, ValueWithSpan,
    VisitMut, VisitorMut, WildcardAdditionalOptions, visit_expressions_mut,
};
use std::fmt;
use std::ops::ControlFlow;
use thiserror::Error;
use tracing::{debug, warn};

/// Probability of replacing the select list with `*`.
const WILDCARD_PROJECTION_PROBABILITY: f64 = 0.2;
/// Probability of extending an existing WHERE predicate.
const WHERE_AUGMENT_PROBABILITY: f64 = 0.45;
/// Probability that the appended WHERE clause is a bare boolean literal.
const BOOLEAN_LITERAL_CLAUSE_PROBABILITY: f64 = 0.35;
/// Probability that a non-literal appended WHERE clause is `IS NULL` rather than `IS <bool>`.
const IS_NULL_CLAUSE_PROBABILITY: f64 = 0.7;
const JOIN_INSERT_PROBABILITY: f64 = 0.2;
const GROUP_BY_PROBABILITY: f64 = 0.4;
const HAVING_PROBABILITY: f64 = 0.4;
const ORDER_BY_PROBABILITY: f64 = 0.4;
const LIMIT_PROBABILITY: f64 = 0.3;

/// Upper bound on grouping keys and ORDER BY terms added per mutant.
const MAX_INJECTED_COLUMNS: usize = 3;
const NUMERIC_LITERAL_RANGE: std::ops::RangeInclusive<i64> = 1..=100;
const LIMIT_RANGE: std::ops::RangeInclusive<i64> = 1..=50;

/// Sentinel values string literals are replaced with.
pub const STRING_LITERAL_POOL: [&str; 4] = ["foo", "bar", "pivot", "test"];

/// Strategy used to derive mutants from a statement.
///
/// Only `Generic` produces mutants. `Pqs`, `Tlp` and `Eet` (pivoted query
/// synthesis, ternary logic partitioning, equivalent expression
/// transformation) are reserved names that currently yield nothing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MutationTechnique {
    Pqs,
    Tlp,
    Eet,
    Generic,
}

impl MutationTechnique {
    pub const ALL: [MutationTechnique; 4] = [
        MutationTechnique::Pqs,
        MutationTechnique::Tlp,
        MutationTechnique::Eet,
        MutationTechnique::Generic,
    ];

    pub fn is_implemented(&self) -> bool {
        matches!(self, MutationTechnique::Generic)
    }
}

impl fmt::Display for MutationTechnique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MutationTechnique::Pqs => "PQS",
            MutationTechnique::Tlp => "TLP",
            MutationTechnique::Eet => "EET",
            MutationTechnique::Generic => "GENERIC",
        })
    }
}

/// Operators the comparison flip draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
}

impl ComparisonOperator {
    pub const ALL: [ComparisonOperator; 6] = [
        ComparisonOperator::Eq,
        ComparisonOperator::NotEq,
        ComparisonOperator::Gt,
        ComparisonOperator::Lt,
        ComparisonOperator::GtEq,
        ComparisonOperator::LtEq,
    ];

    pub fn random(rng: &mut dyn RngCore) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }
}

impl From<ComparisonOperator> for BinaryOperator {
    fn from(op: ComparisonOperator) -> Self {
        match op {
            ComparisonOperator::Eq => BinaryOperator::Eq,
            ComparisonOperator::NotEq => BinaryOperator::NotEq,
            ComparisonOperator::Gt => BinaryOperator::Gt,
            ComparisonOperator::Lt => BinaryOperator::Lt,
            ComparisonOperator::GtEq => BinaryOperator::GtEq,
            ComparisonOperator::LtEq => BinaryOperator::LtEq,
        }
    }
}

/// Aggregates the GROUP BY injection wraps non-key columns in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregateFunction {
    pub const ALL: [AggregateFunction; 5] = [
        AggregateFunction::Count,
        AggregateFunction::Sum,
        AggregateFunction::Avg,
        AggregateFunction::Max,
        AggregateFunction::Min,
    ];

    pub fn random(rng: &mut dyn RngCore) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Min => "MIN",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|agg| agg.as_sql().eq_ignore_ascii_case(name))
    }

    pub fn apply(&self, arg: &Expr) -> Result<Expr, ParseError> {
        sql::parse_expr(&format!("{}({arg})", self.as_sql()))
    }
}


/// Reasons a single mutant could not be built. The batch goes on without it.
#[derive(Error, Debug)]
enum MutationError {
    #[error(transparent)]
    Fragment(#[from] ParseError),
    #[error("Schema has no tables")]
    EmptySchema,
    #[error("Query has no SELECT to rewrite")]
    NoSelect,
}

/// A `Mutator` derives new SQL statements from an existing one.
///
/// Implementations never fail: a statement they cannot work with, or a
/// technique they do not implement, yields an empty list. Every returned
/// string must parse again with [`sql::parse_query`].
pub trait Mutator: Send + Sync {
    fn mutate(
        &self,
        sql: &str,
        technique: MutationTechnique,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Vec<String>;
}

/// Schema-aware AST mutator.
///
/// Each mutant is an independent clone of the parsed input, rewritten so
/// that it only references the tables and columns of the schema.
#[derive(Debug, Clone)]
pub struct SqlMutator {
    schema: Schema,
}

/// The table a mutant selects from after substitution.
#[derive(Debug, Clone, Copy)]
struct ActiveTable<'s> {
    name: &'s str,
    columns: &'s TableSchema,
}

impl<'s> ActiveTable<'s> {
    fn column_names(&self) -> Vec<&'s str> {
        self.columns.column_names()
    }

    /// Column references are qualified once the statement has a join.
    fn column(&self, name: &str, qualified: bool) -> Expr {
        sql::column(qualified.then_some(self.name), name)
    }

    fn random_column(&self, qualified: bool, rng: &mut dyn RngCore) -> Option<Expr> {
        let names = self.column_names();
        let name = names.choose(rng)?;
        Some(self.column(name, qualified))
    }

    /// Between one and three distinct columns, in random order.
    fn random_columns(&self, rng: &mut dyn RngCore) -> Vec<&'s str> {
        let names = self.column_names();
        if names.is_empty() {
            return Vec::new();
        }
        let amount = rng.random_range(1..=names.len().min(MAX_INJECTED_COLUMNS));
        names.choose_multiple(rng, amount).copied().collect()
    }
}

/// Points every plain table factor it visits at one table and drops aliases.
struct RenameTables<'a> {
    table: &'a str,
}

impl VisitorMut for RenameTables<'_> {
    type Break = ();

    fn pre_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<()> {
        if let TableFactor::Table { name, alias, .. } = factor {
            *name = sql::object_name(self.table);
            *alias = None;
        }
        ControlFlow::Continue(())
    }
}

fn select_mut(query: &mut Query) -> Result<&mut Select, MutationError> {
    sql::primary_select_mut(query).ok_or(MutationError::NoSelect)
}

fn joins(select: &Select) -> impl Iterator<Item = &Join> {
    select.from.iter().flat_map(|table| table.joins.iter())
}

fn is_qualified(select: &Select) -> bool {
    joins(select).next().is_some()
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => Some(constraint),
        _ => None,
    }
}

fn join_constraint_mut(operator: &mut JoinOperator) -> Option<&mut JoinConstraint> {
    match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => Some(constraint),
        _ => None,
    }
}

fn has_using_join(select: &Select) -> bool {
    joins(select).any(|join| {
        matches!(
            join_constraint(&join.join_operator),
            Some(JoinConstraint::Using(_))
        )
    })
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Gt
            | BinaryOperator::Lt
            | BinaryOperator::GtEq
            | BinaryOperator::LtEq
    )
}

/// `TRUE`, `FALSE`, `NULL` and `IS` tests: the operands a comparison flip
/// leaves alone.
fn is_boolean_like(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Value(ValueWithSpan {
            value: Value::Boolean(_) | Value::Null,
            ..
        }) | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::IsTrue(_)
            | Expr::IsNotTrue(_)
            | Expr::IsFalse(_)
            | Expr::IsNotFalse(_)
            | Expr::IsUnknown(_)
            | Expr::IsNotUnknown(_)
            | Expr::IsDistinctFrom(..)
            | Expr::IsNotDistinctFrom(..)
    )
}

impl SqlMutator {
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn generic_mutation(&self, sql: &str, count: usize, rng: &mut dyn RngCore) -> Vec<String> {
        let original = match sql::parse_query(sql) {
            Ok(query) => query,
            Err(e) => {
                warn!(error = %e, sql, "Failed to parse SQL, no mutants produced");
                return Vec::new();
            }
        };
        if sql::primary_select(&original).is_none() {
            warn!(sql, "Query has no SELECT to rewrite, no mutants produced");
            return Vec::new();
        }
        if self.schema.is_empty() {
            warn!("Schema has no tables, no mutants produced");
            return Vec::new();
        }

        let mut mutants = Vec::with_capacity(count);
        for _ in 0..count {
            let mut query = original.clone();
            if let Err(e) = self.mutate_once(&mut query, rng) {
                warn!(error = %e, "Skipping mutant that could not be built");
                continue;
            }
            let text = query.to_string();
            match sql::parse_query(&text) {
                Ok(_) => mutants.push(text),
                Err(e) => warn!(error = %e, sql = %text, "Skipping mutant that does not parse"),
            }
        }
        mutants
    }

    /// Runs the full rewrite pipeline on `query`, a fresh clone of the input.
    fn mutate_once(&self, query: &mut Query, rng: &mut dyn RngCore) -> Result<(), MutationError> {
        let table = self.substitute_table(query, rng)?;
        // Set operations need the same column count in every arm.
        let simple = sql::is_simple_select(query);

        if simple {
            apply_projection(select_mut(query)?, table, rng);
        }
        mutate_literals(query, rng);
        flip_comparisons(query, table, rng)?;

        let select = select_mut(query)?;
        if select.selection.is_some() && rng.random_bool(WHERE_AUGMENT_PROBABILITY) {
            augment_where(select, table, rng);
        }
        if !is_qualified(select) && rng.random_bool(JOIN_INSERT_PROBABILITY) {
            self.insert_join(query, table, rng)?;
        }
        if simple && rng.random_bool(GROUP_BY_PROBABILITY) {
            apply_group_by(select_mut(query)?, table, rng)?;
        }
        if simple && rng.random_bool(ORDER_BY_PROBABILITY) {
            apply_order_by(query, table, rng)?;
        }
        if query.limit_clause.is_none() && rng.random_bool(LIMIT_PROBABILITY) {
            let k = rng.random_range(LIMIT_RANGE);
            let template = sql::parse_query(&format!("SELECT 1 LIMIT {k}"))?;
            query.limit_clause = template.limit_clause;
        }
        Ok(())
    }

    /// Points the statement at a random schema table and rewrites every
    /// column reference to one of that table's columns.
    ///
    /// Tables inside subqueries and set-operation arms follow the source
    /// table, so every reference in the tree resolves against it.
    fn substitute_table<'s>(
        &'s self,
        query: &mut Query,
        rng: &mut dyn RngCore,
    ) -> Result<ActiveTable<'s>, MutationError> {
        let names = self.schema.table_names();
        let name = *names.choose(rng).ok_or(MutationError::EmptySchema)?;
        let table = ActiveTable {
            name,
            columns: self.schema.table(name).ok_or(MutationError::EmptySchema)?,
        };

        let select = select_mut(query)?;
        select.from.truncate(1);
        let mut joins = match select.from.first_mut() {
            Some(from) => {
                if !matches!(from.relation, TableFactor::Table { .. }) {
                    from.relation = sql::table_factor(name, None)?;
                }
                std::mem::take(&mut from.joins)
            }
            None => {
                select.from.push(TableWithJoins {
                    relation: sql::table_factor(name, None)?,
                    joins: Vec::new(),
                });
                Vec::new()
            }
        };
        let _ = query.visit(&mut RenameTables { table: name });

        self.repoint_joins(&mut joins, table, rng)?;
        let qualified = !joins.is_empty();
        let select = select_mut(query)?;
        if let Some(from) = select.from.first_mut() {
            from.joins = joins;
        }
        for item in &mut select.projection {
            if matches!(item, SelectItem::QualifiedWildcard(..)) {
                *item = sql::qualified_wildcard(name)?;
            }
        }

        let columns = table.column_names();
        let _ = visit_expressions_mut(query, |expr| {
            if matches!(expr, Expr::Identifier(_) | Expr::CompoundIdentifier(_)) {
                if let Some(column) = columns.choose(&mut *rng) {
                    *expr = table.column(column, qualified);
                }
            }
            ControlFlow::<()>::Continue(())
        });
        Ok(table)
    }

    /// Keeps existing joins valid against the schema after the source table
    /// changed. Joins on anything but a plain table are dropped, as is a
    /// USING join with no column left on both sides.
    fn repoint_joins(
        &self,
        joins: &mut Vec<Join>,
        source: ActiveTable<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(), MutationError> {
        let names = self.schema.table_names();
        let mut self_joins = 0;
        let mut kept = Vec::with_capacity(joins.len());
        for mut join in joins.drain(..) {
            let Some((joined_name, alias)) = sql::table_factor_name(&join.relation) else {
                continue;
            };
            let mut joined_name = joined_name.to_string();
            let mut alias = alias.map(str::to_string);
            if self.schema.table(&joined_name).is_none() {
                let Some(name) = names.choose(&mut *rng) else {
                    continue;
                };
                joined_name = name.to_string();
            }
            let clashes = match alias.as_deref() {
                Some(alias) => alias == source.name,
                None => joined_name == source.name,
            };
            if clashes {
                self_joins += 1;
                alias = Some(match self_joins {
                    1 => format!("{}_j", source.name),
                    n => format!("{}_j{n}", source.name),
                });
            }
            let Some(joined) = self.schema.table(&joined_name) else {
                continue;
            };
            join.relation = sql::table_factor(&joined_name, alias.as_deref())?;
            if let Some(JoinConstraint::Using(columns)) = join_constraint_mut(&mut join.join_operator)
            {
                columns.retain(|column| {
                    sql::object_name_last(column)
                        .is_some_and(|c| source.columns.has_column(c) && joined.has_column(c))
                });
                if columns.is_empty() {
                    continue;
                }
            }
            kept.push(join);
        }
        *joins = kept;
        Ok(())
    }

    /// Adds a join when the schema allows one; otherwise leaves `query` alone.
    fn insert_join(
        &self,
        query: &mut Query,
        source: ActiveTable<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(), MutationError> {
        let clause = if rng.random_bool(0.5) {
            let Some(column) = source.column_names().choose(rng).copied() else {
                return Ok(());
            };
            format!(
                "JOIN {} AS {} USING ({})",
                sql::ident(source.name),
                sql::ident(&format!("{}_j", source.name)),
                sql::ident(column)
            )
        } else {
            let mut candidates = Vec::new();
            for (other_name, other) in self.schema.tables() {
                if other_name == source.name {
                    continue;
                }
                for (left, left_type) in source.columns.columns() {
                    for (right, right_type) in other.columns() {
                        if left_type == right_type {
                            candidates.push((other_name, left, right));
                        }
                    }
                }
            }
            let Some(&(other_name, left, right)) = candidates.choose(rng) else {
                debug!(table = source.name, "No same-typed column pair, join skipped");
                return Ok(());
            };
            format!(
                "JOIN {} ON {} = {}",
                sql::ident(other_name),
                sql::column(Some(source.name), left),
                sql::column(Some(other_name), right)
            )
        };

        let join = sql::join_clause(source.name, &clause)?;
        let select = select_mut(query)?;
        let Some(from) = select.from.first_mut() else {
            return Ok(());
        };
        from.joins.push(join);
        let qualifier = sql::ident(source.name);
        let _ = visit_expressions_mut(query, |expr| {
            if let Expr::Identifier(column) = expr {
                *expr = Expr::CompoundIdentifier(vec![qualifier.clone(), column.clone()]);
            }
            ControlFlow::<()>::Continue(())
        });
        Ok(())
    }
}

impl Mutator for SqlMutator {
    fn mutate(
        &self,
        sql: &str,
        technique: MutationTechnique,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Vec<String> {
        match technique {
            MutationTechnique::Generic => self.generic_mutation(sql, count, rng),
            MutationTechnique::Pqs | MutationTechnique::Tlp | MutationTechnique::Eet => {
                debug!(%technique, "Technique not implemented, no mutants produced");
                Vec::new()
            }
        }
    }
}

/// Replaces the select list with `*` or a random non-empty column subset.
fn apply_projection(select: &mut Select, table: ActiveTable<'_>, rng: &mut dyn RngCore) {
    if has_using_join(select) {
        return;
    }
    if rng.random_bool(WILDCARD_PROJECTION_PROBABILITY) {
        select.projection = vec![SelectItem::Wildcard(WildcardAdditionalOptions::default())];
        return;
    }
    let names = table.column_names();
    if names.is_empty() {
        return;
    }
    let qualified = is_qualified(select);
    let amount = rng.random_range(1..=names.len());
    select.projection = names
        .choose_multiple(rng, amount)
        .map(|name| SelectItem::UnnamedExpr(table.column(name, qualified)))
        .collect();
}

fn mutate_literals(query: &mut Query, rng: &mut dyn RngCore) {
    let _ = visit_expressions_mut(query, |expr| {
        if let Expr::Value(literal) = expr {
            match &mut literal.value {
                Value::Number(text, _) => {
                    *text = rng.random_range(NUMERIC_LITERAL_RANGE).to_string();
                }
                Value::SingleQuotedString(text) => {
                    if let Some(replacement) = STRING_LITERAL_POOL.choose(&mut *rng) {
                        *text = replacement.to_string();
                    }
                }
                _ => {}
            }
        }
        ControlFlow::<()>::Continue(())
    });
}

/// Rebuilds every comparison as `<random column> <random operator> <old rhs>`,
/// except those whose right side is a boolean, NULL or IS test.
fn flip_comparisons(
    query: &mut Query,
    table: ActiveTable<'_>,
    rng: &mut dyn RngCore,
) -> Result<(), MutationError> {
    let qualified = is_qualified(select_mut(query)?);
    let _ = visit_expressions_mut(query, |expr| {
        if let Expr::BinaryOp { left, op, right } = expr {
            if is_comparison(op) && !is_boolean_like(right) {
                if let Some(column) = table.random_column(qualified, &mut *rng) {
                    **left = column;
                    *op = ComparisonOperator::random(&mut *rng).into();
                }
            }
        }
        ControlFlow::<()>::Continue(())
    });
    Ok(())
}

/// `WHERE p` becomes `WHERE p AND|OR NOT (<clause>)`.
fn augment_where(select: &mut Select, table: ActiveTable<'_>, rng: &mut dyn RngCore) {
    let qualified = is_qualified(select);
    let Some(existing) = select.selection.take() else {
        return;
    };
    let clause = if rng.random_bool(BOOLEAN_LITERAL_CLAUSE_PROBABILITY) {
        Some(sql::boolean(rng.random_bool(0.5)))
    } else {
        table.random_column(qualified, rng).map(|column| {
            let column = Box::new(column);
            if rng.random_bool(IS_NULL_CLAUSE_PROBABILITY) {
                Expr::IsNull(column)
            } else if rng.random_bool(0.5) {
                Expr::IsTrue(column)
            } else {
                Expr::IsFalse(column)
            }
        })
    };
    select.selection = Some(match clause {
        Some(clause) => {
            let op = if rng.random_bool(0.5) {
                BinaryOperator::And
            } else {
                BinaryOperator::Or
            };
            let existing = match existing {
                Expr::BinaryOp {
                    op: BinaryOperator::And | BinaryOperator::Or,
                    ..
                } => Expr::Nested(Box::new(existing)),
                other => other,
            };
            Expr::BinaryOp {
                left: Box::new(existing),
                op,
                right: Box::new(Expr::UnaryOp {
                    op: UnaryOperator::Not,
                    expr: Box::new(Expr::Nested(Box::new(clause))),
                }),
            }
        }
        None => existing,
    });
}

/// Groups by one to three columns and aggregates every other column, so key
/// and aggregated columns partition the table.
fn apply_group_by(
    select: &mut Select,
    table: ActiveTable<'_>,
    rng: &mut dyn RngCore,
) -> Result<(), MutationError> {
    let keys = table.random_columns(rng);
    if keys.is_empty() {
        return Ok(());
    }
    let qualified = is_qualified(select);
    let names = table.column_names();

    let mut projection = Vec::with_capacity(names.len());
    for name in &names {
        let column = table.column(name, qualified);
        let expr = if keys.contains(name) {
            column
        } else {
            AggregateFunction::random(rng).apply(&column)?
        };
        projection.push(SelectItem::UnnamedExpr(expr));
    }
    select.projection = projection;
    select.group_by = GroupByExpr::Expressions(
        keys.iter().map(|key| table.column(key, qualified)).collect(),
        Vec::new(),
    );
    select.having = None;

    if rng.random_bool(HAVING_PROBABILITY) {
        let non_keys: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| !keys.contains(name))
            .collect();
        if let Some(name) = non_keys.choose(rng) {
            let aggregate =
                AggregateFunction::random(rng).apply(&table.column(name, qualified))?;
            let op = ComparisonOperator::random(rng);
            select.having = Some(Expr::BinaryOp {
                left: Box::new(aggregate),
                op: op.into(),
                right: Box::new(sql::number(rng.random_range(NUMERIC_LITERAL_RANGE))),
            });
        }
    }
    Ok(())
}

fn apply_order_by(
    query: &mut Query,
    table: ActiveTable<'_>,
    rng: &mut dyn RngCore,
) -> Result<(), MutationError> {
    let qualified = is_qualified(select_mut(query)?);
    let terms: Vec<String> = table
        .random_columns(rng)
        .into_iter()
        .map(|name| {
            let direction = if rng.random_bool(0.5) { "ASC" } else { "DESC" };
            format!("{} {direction}", table.column(name, qualified))
        })
        .collect();
    if terms.is_empty() {
        return Ok(());
    }
    let template = sql::parse_query(&format!("SELECT 1 ORDER BY {}", terms.join(", ")))?;
    let Some(added) = template.order_by else {
        return Ok(());
    };
    match &mut query.order_by {
        Some(OrderBy {
            kind: OrderByKind::Expressions(existing),
            ..
        }) => {
            if let OrderByKind::Expressions(terms) = added.kind {
                existing.extend(terms);
            }
        }
        _ => query.order_by = Some(added),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use sqlparser::ast::{LimitClause, visit_expressions, visit_relations};
    use std::collections::HashSet;

    const SEED_SQL: &str = "SELECT * FROM t0 WHERE c0 > 5;";

    fn single_table_schema() -> Schema {
        Schema::new().with_table(
            "t0",
            TableSchema::new()
                .with_column("c0", ColumnType::Integer)
                .with_column("c1", ColumnType::Text),
        )
    }

    fn multi_table_schema() -> Schema {
        single_table_schema()
            .with_table(
                "t1",
                TableSchema::new()
                    .with_column("c2", ColumnType::Real)
                    .with_column("c3", ColumnType::Boolean)
                    .with_column("c4", ColumnType::Integer),
            )
            .with_table(
                "t2",
                TableSchema::new()
                    .with_column("c5", ColumnType::Text)
                    .with_column("c6", ColumnType::Real),
            )
    }

    fn active<'s>(schema: &'s Schema, name: &'s str) -> ActiveTable<'s> {
        ActiveTable {
            name,
            columns: schema.table(name).unwrap(),
        }
    }

    fn from_table(query: &Query) -> String {
        let select = sql::primary_select(query).expect("mutant should have a SELECT");
        let relation = &select.from.first().expect("mutant should have a FROM").relation;
        let (name, _) = sql::table_factor_name(relation).expect("FROM should be a table");
        name.to_string()
    }

    /// Every column reference in the tree as `(qualifier, column)`.
    fn column_refs(query: &Query) -> Vec<(Option<String>, String)> {
        let mut refs = Vec::new();
        let _ = visit_expressions(query, |expr| {
            match expr {
                Expr::Identifier(column) => refs.push((None, column.value.clone())),
                Expr::CompoundIdentifier(parts) => {
                    if let [qualifier, column] = parts.as_slice() {
                        refs.push((Some(qualifier.value.clone()), column.value.clone()));
                    } else {
                        panic!("Unexpected reference {expr}");
                    }
                }
                _ => {}
            }
            ControlFlow::<()>::Continue(())
        });
        refs
    }

    fn relations(query: &Query) -> Vec<String> {
        let mut names = Vec::new();
        let _ = visit_relations(query, |name| {
            names.push(sql::object_name_last(name).unwrap_or_default().to_string());
            ControlFlow::<()>::Continue(())
        });
        names
    }

    fn first_join(query: &Query) -> &Join {
        sql::primary_select(query).unwrap().from[0]
            .joins
            .first()
            .expect("a join should have been inserted")
    }

    #[test]
    fn generic_mutation_of_default_seed_targets_schema_table() {
        let mutator = SqlMutator::new(single_table_schema());
        for seed in 0..100 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mutants = mutator.mutate(SEED_SQL, MutationTechnique::Generic, 1, &mut rng);
            assert_eq!(mutants.len(), 1, "Exactly one mutant expected (seed {seed})");

            let query = sql::parse_query(&mutants[0]).expect("mutant should parse");
            assert_eq!(from_table(&query), "t0");
            let select = sql::primary_select(&query).unwrap();
            let selection = select
                .selection
                .as_ref()
                .unwrap_or_else(|| panic!("WHERE should survive: {}", mutants[0]));
            let mut referenced = Vec::new();
            let _ = visit_expressions(selection, |expr| {
                match expr {
                    Expr::Identifier(column) => referenced.push(column.value.clone()),
                    Expr::CompoundIdentifier(parts) => {
                        referenced.extend(parts.last().map(|column| column.value.clone()))
                    }
                    _ => {}
                }
                ControlFlow::<()>::Continue(())
            });
            assert!(
                referenced.iter().any(|name| name == "c0" || name == "c1"),
                "WHERE should reference c0 or c1: {}",
                mutants[0]
            );
        }
    }

    #[test]
    fn placeholder_techniques_return_no_mutants() {
        let mutator = SqlMutator::new(single_table_schema());
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for technique in [
            MutationTechnique::Pqs,
            MutationTechnique::Tlp,
            MutationTechnique::Eet,
        ] {
            assert!(
                mutator.mutate(SEED_SQL, technique, 5, &mut rng).is_empty(),
                "{technique} should yield no mutants"
            );
            assert!(!technique.is_implemented());
        }
        assert!(MutationTechnique::Generic.is_implemented());
    }

    #[test]
    fn unparseable_input_yields_empty_list() {
        let mutator = SqlMutator::new(single_table_schema());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for sql in ["DELETE FROM t0", "SELECT * FROM", "SELECT 1; SELECT 2", "VALUES (1)"] {
            assert!(
                mutator
                    .mutate(sql, MutationTechnique::Generic, 3, &mut rng)
                    .is_empty(),
                "{sql} should yield no mutants"
            );
        }
    }

    #[test]
    fn every_mutant_reparses_and_resolves_against_its_table() {
        let schema = multi_table_schema();
        let mutator = SqlMutator::new(schema.clone());
        let seeds = [
            SEED_SQL,
            "SELECT c0, c1 FROM t0 WHERE c1 = 'x' AND (c0 < 3 OR c0 IS NULL) ORDER BY c0",
            "SELECT DISTINCT a.c0 FROM t0 AS a JOIN t1 ON a.c0 = t1.c4 WHERE a.c0 BETWEEN 1 AND 9",
            "SELECT * FROM t0 JOIN t0 AS x USING (c0) WHERE c1 LIKE 'a%' LIMIT 4",
            "SELECT COUNT(*), MAX(c0) FROM t0 GROUP BY c1 HAVING COUNT(*) > 2",
            "SELECT c0 FROM missing_table WHERE NOT c0 IN (1, 2, 3) AND c0 <> -4",
            "SELECT * FROM t0 WHERE c0 IN (SELECT c4 FROM t1 WHERE c3 = TRUE)",
            "SELECT CASE WHEN c0 > 1 THEN 'big' ELSE 'small' END AS size, CAST(c0 AS TEXT) FROM t0",
            "SELECT c0 FROM t0 UNION SELECT c2 FROM t1",
            "SELECT * FROM t0 WHERE NOT EXISTS (SELECT 1 FROM t2 WHERE c5 = x'41') \
             AND c0 IS NOT DISTINCT FROM c1",
            "SELECT * FROM t0 NATURAL JOIN t1",
            "SELECT t0.* FROM t0 CROSS JOIN t2",
        ];
        let mut produced = 0;
        for seed in 0..240u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let sql = seeds[seed as usize % seeds.len()];
            for mutant in mutator.mutate(sql, MutationTechnique::Generic, 3, &mut rng) {
                produced += 1;
                let query = sql::parse_query(&mutant)
                    .unwrap_or_else(|e| panic!("Mutant must reparse: {mutant}: {e}"));
                let table_name = from_table(&query);
                let table = schema
                    .table(&table_name)
                    .unwrap_or_else(|| panic!("FROM target must be a schema table: {mutant}"));
                for (qualifier, name) in column_refs(&query) {
                    assert!(
                        table.has_column(&name),
                        "Column {name} must exist on {table_name}: {mutant}"
                    );
                    if let Some(qualifier) = qualifier {
                        assert_eq!(qualifier, table_name, "Qualifier mismatch: {mutant}");
                    }
                }
                for relation in relations(&query) {
                    assert!(
                        schema.table(&relation).is_some(),
                        "Every table must exist: {mutant}"
                    );
                }
            }
        }
        assert_eq!(produced, 720, "Every requested mutant should be produced");
    }

    #[test]
    fn quoted_schema_names_round_trip() {
        let single = Schema::new().with_table(
            "t0",
            TableSchema::new().with_column("we\"ird", ColumnType::Integer),
        );
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mutants = SqlMutator::new(single).mutate(
            "SELECT * FROM t0 WHERE c0 > 5",
            MutationTechnique::Generic,
            5,
            &mut rng,
        );
        assert_eq!(mutants.len(), 5);
        for mutant in &mutants {
            assert!(mutant.contains(r#""we""ird""#), "Got {mutant}");
        }

        let schema = Schema::new().with_table(
            "order",
            TableSchema::new()
                .with_column("we\"ird", ColumnType::Integer)
                .with_column("two words", ColumnType::Text),
        );
        let mutator = SqlMutator::new(schema);
        for seed in 0..40 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mutants = mutator.mutate(SEED_SQL, MutationTechnique::Generic, 5, &mut rng);
            assert_eq!(mutants.len(), 5, "All mutants should survive (seed {seed})");
            for mutant in &mutants {
                let query = sql::parse_query(mutant).unwrap();
                assert_eq!(from_table(&query), "order");
                assert!(mutant.contains(r#"FROM "order""#), "Got {mutant}");
                for (_, name) in column_refs(&query) {
                    assert!(name == "we\"ird" || name == "two words", "Got {name}");
                }
            }
        }
    }

    #[test]
    fn literals_are_redrawn_from_fixed_ranges() {
        let mut query =
            sql::parse_query("SELECT c0 FROM t0 WHERE c0 = 1000 AND c1 = 'zzz' AND c1 IS NOT NULL")
                .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        mutate_literals(&mut query, &mut rng);

        let mut saw_number = false;
        let mut saw_string = false;
        let _ = visit_expressions(&*query, |expr| {
            if let Expr::Value(literal) = expr {
                match &literal.value {
                    Value::Number(text, _) => {
                        let value: i64 = text.parse().unwrap();
                        assert!(NUMERIC_LITERAL_RANGE.contains(&value), "{value} out of range");
                        saw_number = true;
                    }
                    Value::SingleQuotedString(value) => {
                        assert!(STRING_LITERAL_POOL.contains(&value.as_str()));
                        saw_string = true;
                    }
                    _ => {}
                }
            }
            ControlFlow::<()>::Continue(())
        });
        assert!(saw_number && saw_string);
    }

    #[test]
    fn comparison_flip_skips_boolean_and_null_operands() {
        let schema = single_table_schema();
        let table = active(&schema, "t0");
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..50 {
            let mut query =
                sql::parse_query("SELECT * FROM t0 WHERE c0 = NULL OR c1 = TRUE OR 5 > 3").unwrap();
            flip_comparisons(&mut query, table, &mut rng).unwrap();
            let text = query.to_string();
            assert!(text.contains("c0 = NULL"), "NULL comparison must stay: {text}");
            assert!(text.contains("c1 = true"), "TRUE comparison must stay: {text}");
            assert!(!text.contains("5 >"), "Plain comparison must be rebuilt: {text}");
            assert!(text.ends_with(" 3"), "Right operand must be preserved: {text}");
        }
    }

    #[test]
    fn where_augmentation_negates_appended_clause() {
        let schema = single_table_schema();
        let table = active(&schema, "t0");
        for seed in 0..30 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut select = sql::parse_select("SELECT * FROM t0 WHERE c0 > 5").unwrap();
            augment_where(&mut select, table, &mut rng);
            match select.selection {
                Some(Expr::BinaryOp { left, op, right }) => {
                    assert!(matches!(op, BinaryOperator::And | BinaryOperator::Or));
                    assert_eq!(left.to_string(), "c0 > 5");
                    assert!(right.to_string().starts_with("NOT ("), "Got {right}");
                }
                other => panic!("Expected a combined predicate, got {other:?}"),
            }
        }
    }

    #[test]
    fn where_augmentation_keeps_existing_disjunction_grouped() {
        let schema = single_table_schema();
        let table = active(&schema, "t0");
        for seed in 0..30 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut select = sql::parse_select("SELECT * FROM t0 WHERE c0 = 1 OR c0 = 2").unwrap();
            augment_where(&mut select, table, &mut rng);
            let text = select.to_string();
            assert!(text.contains("WHERE (c0 = 1 OR c0 = 2) "), "Got {text}");
        }
    }

    #[test]
    fn projection_is_untouched_with_using_join() {
        let schema = single_table_schema();
        let table = active(&schema, "t0");
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let original =
            sql::parse_select("SELECT t0.c1 FROM t0 JOIN t0 AS t0_j USING (c0)").unwrap();
        for _ in 0..20 {
            let mut select = original.clone();
            apply_projection(&mut select, table, &mut rng);
            assert_eq!(select.projection, original.projection);
        }
    }

    #[test]
    fn projection_subset_is_non_empty_and_distinct() {
        let schema = multi_table_schema();
        let table = active(&schema, "t1");
        for seed in 0..50 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut select = sql::parse_select("SELECT c2 FROM t1").unwrap();
            apply_projection(&mut select, table, &mut rng);
            if matches!(select.projection.as_slice(), [SelectItem::Wildcard(_)]) {
                continue;
            }
            let names: HashSet<String> = select
                .projection
                .iter()
                .map(|item| item.to_string())
                .collect();
            assert!(!names.is_empty() && names.len() <= 3);
            assert_eq!(names.len(), select.projection.len(), "Columns must be distinct");
        }
    }

    #[test]
    fn set_operations_keep_their_projections() {
        let mutator = SqlMutator::new(multi_table_schema());
        for seed in 0..40 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mutants = mutator.mutate(
                "SELECT c0, c1 FROM t0 UNION ALL SELECT c2, c3 FROM t1",
                MutationTechnique::Generic,
                2,
                &mut rng,
            );
            assert_eq!(mutants.len(), 2);
            for mutant in mutants {
                let query = sql::parse_query(&mutant).unwrap();
                assert!(!sql::is_simple_select(&query), "Got {mutant}");
                let select = sql::primary_select(&query).unwrap();
                assert_eq!(select.projection.len(), 2, "Got {mutant}");
                assert!(query.order_by.is_none(), "Got {mutant}");
            }
        }
    }

    #[test]
    fn group_by_partitions_table_columns() {
        let schema = multi_table_schema();
        let table = active(&schema, "t1");
        for seed in 0..100 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut select = sql::parse_select("SELECT * FROM t1").unwrap();
            apply_group_by(&mut select, table, &mut rng).unwrap();

            let GroupByExpr::Expressions(key_exprs, _) = &select.group_by else {
                panic!("GROUP BY must list expressions");
            };
            let keys: HashSet<String> = key_exprs.iter().map(ToString::to_string).collect();
            let mut aggregated = HashSet::new();
            let mut passed_through = HashSet::new();
            for item in &select.projection {
                let SelectItem::UnnamedExpr(expr) = item else {
                    panic!("Projection must list columns explicitly");
                };
                match expr {
                    Expr::Identifier(column) => {
                        passed_through.insert(column.value.clone());
                    }
                    Expr::Function(_) => {
                        let text = expr.to_string();
                        let (name, rest) = text.split_once('(').unwrap();
                        assert!(AggregateFunction::from_name(name).is_some(), "Got {text}");
                        let column = rest.strip_suffix(')').unwrap();
                        aggregated.insert(column.to_string());
                    }
                    other => panic!("Unexpected projection item {other}"),
                }
            }

            assert!(!keys.is_empty() && keys.len() <= 3);
            assert_eq!(passed_through, keys, "Key columns are passed through");
            assert!(keys.is_disjoint(&aggregated), "No overlap (seed {seed})");
            let union: HashSet<String> = keys.union(&aggregated).cloned().collect();
            let all: HashSet<String> = table
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            assert_eq!(union, all, "No omission (seed {seed})");
        }
    }

    #[test]
    fn on_join_uses_same_typed_columns_of_distinct_tables() {
        let schema = multi_table_schema();
        let mutator = SqlMutator::new(schema.clone());
        let table = active(&schema, "t0");
        let mut seen_on = false;
        let mut seen_using = false;
        for seed in 0..60 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut query = sql::parse_query("SELECT c0 FROM t0 WHERE c1 = 'a'").unwrap();
            mutator.insert_join(&mut query, table, &mut rng).unwrap();
            let join = first_join(&query);
            let (joined, alias) = sql::table_factor_name(&join.relation).unwrap();
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::On(Expr::BinaryOp { left, right, .. })) => {
                    seen_on = true;
                    let (Expr::CompoundIdentifier(l), Expr::CompoundIdentifier(r)) =
                        (&**left, &**right)
                    else {
                        panic!("ON must compare two qualified columns");
                    };
                    assert_eq!(l[0].value, "t0");
                    assert_eq!(r[0].value, joined);
                    assert_ne!(joined, "t0", "ON join needs distinct tables");
                    let left_type = schema.table("t0").unwrap().column_type(&l[1].value);
                    let right_type = schema.table(joined).unwrap().column_type(&r[1].value);
                    assert_eq!(left_type, right_type);
                }
                Some(JoinConstraint::Using(columns)) => {
                    seen_using = true;
                    assert_eq!((joined, alias), ("t0", Some("t0_j")));
                    assert_eq!(columns.len(), 1);
                }
                other => panic!("Unexpected constraint {other:?}"),
            }
            let text = query.to_string();
            assert!(text.starts_with("SELECT t0.c0 FROM t0"), "Got {text}");
            assert!(text.contains("t0.c1 = 'a'"), "Got {text}");
        }
        assert!(seen_on && seen_using);
    }

    #[test]
    fn on_join_is_skipped_without_compatible_pair() {
        let schema = Schema::new()
            .with_table("a", TableSchema::new().with_column("x", ColumnType::Integer))
            .with_table("b", TableSchema::new().with_column("y", ColumnType::Text));
        let mutator = SqlMutator::new(schema.clone());
        let table = active(&schema, "a");
        for seed in 0..30 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut query = sql::parse_query("SELECT x FROM a").unwrap();
            mutator.insert_join(&mut query, table, &mut rng).unwrap();
            let select = sql::primary_select(&query).unwrap();
            assert!(
                !is_qualified(select) || has_using_join(select),
                "Only a self USING join is possible here: {query}"
            );
        }
    }

    #[test]
    fn order_by_and_limit_stay_within_bounds() {
        let schema = multi_table_schema();
        let table = active(&schema, "t1");
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        for _ in 0..30 {
            let mut query = sql::parse_query("SELECT * FROM t1 ORDER BY c2").unwrap();
            apply_order_by(&mut query, table, &mut rng).unwrap();
            let Some(OrderBy {
                kind: OrderByKind::Expressions(terms),
                ..
            }) = &query.order_by
            else {
                panic!("ORDER BY must list expressions");
            };
            let added = &terms[1..];
            assert!((1..=3).contains(&added.len()));
            for term in added {
                let text = term.to_string();
                assert!(text.ends_with(" ASC") || text.ends_with(" DESC"), "Got {text}");
            }
        }

        let mutator = SqlMutator::new(schema);
        for seed in 0..50 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for mutant in mutator.mutate("SELECT * FROM t0", MutationTechnique::Generic, 2, &mut rng)
            {
                let query = sql::parse_query(&mutant).unwrap();
                if let Some(LimitClause::LimitOffset {
                    limit: Some(limit), ..
                }) = &query.limit_clause
                {
                    let k: i64 = limit.to_string().parse().unwrap();
                    assert!(LIMIT_RANGE.contains(&k), "LIMIT {k} out of range");
                }
            }
        }
    }
}
