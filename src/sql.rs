use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::model::*;

/// Parsed command from SQL input.
///
/// Dates and times stay as text here; the engine owns their validation so
/// malformed values surface with their own error class.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        id: ServiceId,
        owner_id: OwnerId,
        name: String,
    },
    SelectServices {
        owner_id: OwnerId,
    },
    /// Replace one day's availability.
    SaveSchedule {
        owner_id: OwnerId,
        date: String,
        ranges: Vec<TimeRangeInput>,
    },
    SelectSchedule {
        owner_id: OwnerId,
        date: String,
        days: Option<i64>,
    },
    InsertAppointment {
        owner_id: OwnerId,
        service_id: ServiceId,
        date: String,
        start: String,
        end: String,
        customer: Customer,
    },
    SelectAppointments {
        owner_id: OwnerId,
    },
    DeleteAppointment {
        id: String,
        owner_id: OwnerId,
    },
}

/// Tables a statement can return rows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Services,
    Schedule,
    Appointments,
}

impl Relation {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "services" => Some(Relation::Services),
            "schedule" => Some(Relation::Schedule),
            "appointments" => Some(Relation::Appointments),
            _ => None,
        }
    }
}

const SERVICE_COLUMNS: &[&str] = &["id", "owner_id", "name"];
const SCHEDULE_COLUMNS: &[&str] = &["owner_id", "date", "start_time", "end_time"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "owner_id",
    "service_id",
    "date",
    "start_time",
    "end_time",
    "first_name",
    "last_name",
    "email",
    "phone",
    "handle",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmt = parse_one(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Which relation a statement returns rows from, if any. Works on statements
/// that still carry `$n` placeholders.
pub fn returned_relation(sql: &str) -> Option<Relation> {
    match parse_one(sql).ok()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => select
                .from
                .first()
                .and_then(|t| table_factor_name(&t.relation).ok())
                .and_then(|name| Relation::from_name(&name)),
            _ => None,
        },
        Statement::Insert(insert) => match Relation::from_name(&insert_table_name(&insert).ok()?)? {
            Relation::Services => None,
            rel => Some(rel),
        },
        _ => None,
    }
}

fn parse_one(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "services" => {
            let row = single_row(insert, "services", SERVICE_COLUMNS)?;
            Ok(Command::InsertService {
                id: parse_i64_expr(row.get("id")?)?,
                owner_id: parse_i64_expr(row.get("owner_id")?)?,
                name: parse_string_expr(row.get("name")?)?,
            })
        }
        "schedule" => parse_schedule_insert(insert),
        "appointments" => {
            let row = single_row(insert, "appointments", APPOINTMENT_COLUMNS)?;
            let handle = match row.opt("handle") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertAppointment {
                owner_id: parse_i64_expr(row.get("owner_id")?)?,
                service_id: parse_i64_expr(row.get("service_id")?)?,
                date: parse_string_expr(row.get("date")?)?,
                start: parse_string_expr(row.get("start_time")?)?,
                end: parse_string_expr(row.get("end_time")?)?,
                customer: Customer {
                    first_name: parse_string_expr(row.get("first_name")?)?,
                    last_name: parse_string_expr(row.get("last_name")?)?,
                    email: parse_string_expr(row.get("email")?)?,
                    phone: parse_string_expr(row.get("phone")?)?,
                    handle,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Two shapes: one row per range sharing owner and date, or a single row
/// carrying the whole day as a JSON `ranges` array (which may be empty).
fn parse_schedule_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let has_ranges_column = insert.columns.iter().any(|c| c.value.eq_ignore_ascii_case("ranges"));
    if has_ranges_column {
        let row = single_row(insert, "schedule", &["owner_id", "date", "ranges"])?;
        let json = parse_string_expr(row.get("ranges")?)?;
        let ranges: Vec<TimeRangeInput> =
            serde_json::from_str(&json).map_err(|e| SqlError::Parse(format!("bad ranges JSON: {e}")))?;
        return Ok(Command::SaveSchedule {
            owner_id: parse_i64_expr(row.get("owner_id")?)?,
            date: parse_string_expr(row.get("date")?)?,
            ranges,
        });
    }

    let rows = bind_rows(insert, "schedule", SCHEDULE_COLUMNS)?;
    let mut day: Option<(OwnerId, String)> = None;
    let mut ranges = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let owner_id = parse_i64_expr(row.get("owner_id")?).map_err(|e| e.in_row(i))?;
        let date = parse_string_expr(row.get("date")?).map_err(|e| e.in_row(i))?;
        match &day {
            None => day = Some((owner_id, date)),
            Some((o, d)) if *o == owner_id && *d == date => {}
            Some(_) => return Err(SqlError::MixedDays),
        }
        ranges.push(TimeRangeInput::new(
            parse_string_expr(row.get("start_time")?).map_err(|e| e.in_row(i))?,
            parse_string_expr(row.get("end_time")?).map_err(|e| e.in_row(i))?,
        ));
    }
    let (owner_id, date) = day.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::SaveSchedule { owner_id, date, ranges })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_equalities(&delete.selection)?;

    match table.as_str() {
        "schedule" => Ok(Command::SaveSchedule {
            owner_id: parse_i64_expr(filters.require("owner_id")?)?,
            date: parse_string_expr(filters.require("date")?)?,
            ranges: Vec::new(),
        }),
        "appointments" => Ok(Command::DeleteAppointment {
            id: parse_string_expr(filters.require("id")?)?,
            owner_id: parse_i64_expr(filters.require("owner_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_equalities(&select.selection)?;
    let owner_id = parse_i64_expr(filters.require("owner_id")?)?;

    match table.as_str() {
        "services" => Ok(Command::SelectServices { owner_id }),
        "appointments" => Ok(Command::SelectAppointments { owner_id }),
        "schedule" => Ok(Command::SelectSchedule {
            owner_id,
            date: parse_string_expr(filters.require("date")?)?,
            days: filters.get("days").map(parse_i64_expr).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Row binding ───────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct BoundRow<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> BoundRow<'a> {
    fn get(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.opt(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn opt(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }
}

/// Pair each VALUES row with the statement's column list, or with
/// `canonical` order when the statement names no columns.
fn bind_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    canonical: &[&str],
) -> Result<Vec<BoundRow<'a>>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        canonical.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let mut bound = Vec::new();
    for row in all_insert_rows(insert)? {
        if row.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), row.len()));
        }
        let values = columns.iter().cloned().zip(row.iter()).collect();
        bound.push(BoundRow { table, values });
    }
    Ok(bound)
}

fn single_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    canonical: &[&str],
) -> Result<BoundRow<'a>, SqlError> {
    let mut rows = bind_rows(insert, table, canonical)?;
    if rows.len() != 1 {
        return Err(SqlError::WrongArity(table, 1, rows.len()));
    }
    Ok(rows.swap_remove(0))
}

fn all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// `col = value` terms of an AND-only WHERE clause.
struct Filters<'a>(HashMap<String, &'a Expr>);

impl<'a> Filters<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.0.get(column).copied()
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn where_equalities(selection: &Option<Expr>) -> Result<Filters<'_>, SqlError> {
    let mut out = HashMap::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_equalities(left, out)?;
                collect_equalities(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::Nested(inner) => collect_equalities(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("schedule rows must share one owner_id and date")]
    MixedDays,
}

impl SqlError {
    fn in_row(self, i: usize) -> Self {
        match self {
            SqlError::Parse(msg) => SqlError::Parse(format!("row {i}: {msg}")),
            other => other,
        }
    }
}
