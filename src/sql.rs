use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPool {
        day: String,
    },
    SelectPools {
        day: Option<String>,
    },
    InsertReservation {
        pool_id: Ulid,
        spot_number: u32,
        claimant_id: Ulid,
        date: Ms,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    Id(Ulid),
    Claimant(Ulid),
    /// `scope = 'all'`: every reservation with its owners blanked.
    Everyone,
}

/// Column order assumed by `INSERT INTO reservations VALUES (...)` without a column list.
const RESERVATION_COLUMNS: [&str; 4] = ["pool_id", "spot_number", "claimant_id", "date"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "pools" => {
            if values.len() != 1 {
                return Err(SqlError::WrongArity("pools", 1, values.len()));
            }
            Ok(Command::InsertPool {
                day: parse_string(&values[0])?,
            })
        }
        "reservations" => {
            let columns: Vec<String> = if insert.columns.is_empty() {
                RESERVATION_COLUMNS.iter().map(|c| c.to_string()).collect()
            } else {
                insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
            };
            if values.len() != columns.len() {
                return Err(SqlError::WrongArity("reservations", columns.len(), values.len()));
            }

            let value_of = |name: &'static str| -> Result<&Expr, SqlError> {
                columns
                    .iter()
                    .position(|c| c == name)
                    .map(|i| &values[i])
                    .ok_or(SqlError::MissingColumn(name))
            };
            Ok(Command::InsertReservation {
                pool_id: parse_ulid(value_of("pool_id")?)?,
                spot_number: parse_u32(value_of("spot_number")?)?,
                claimant_id: parse_ulid(value_of("claimant_id")?)?,
                date: parse_i64(value_of("date")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let mut patch = ReservationPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        match column.as_str() {
            "spot_number" => patch.slot_number = Some(parse_u32(&assignment.value)?),
            "date" => patch.date = Some(parse_i64(&assignment.value)?),
            _ => return Err(SqlError::ReadOnlyColumn(column)),
        }
    }
    if patch.is_empty() {
        return Err(SqlError::Parse("UPDATE without assignments".into()));
    }
    Ok(Command::UpdateReservation { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation { id }),
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
    let filter = select.selection.as_ref().map(where_eq).transpose()?;

    match table.as_str() {
        "pools" => match filter {
            None => Ok(Command::SelectPools { day: None }),
            Some(("day", value)) => Ok(Command::SelectPools {
                day: Some(parse_string(value)?),
            }),
            Some((col, _)) => Err(SqlError::UnsupportedFilter(col.to_string())),
        },
        "reservations" => {
            let filter = match filter {
                None => ReservationFilter::All,
                Some(("id", value)) => ReservationFilter::Id(parse_ulid(value)?),
                Some(("claimant_id", value)) => ReservationFilter::Claimant(parse_ulid(value)?),
                Some(("scope", value)) => match parse_string(value)?.as_str() {
                    "all" => ReservationFilter::Everyone,
                    other => return Err(SqlError::UnsupportedFilter(format!("scope = '{other}'"))),
                },
                Some((col, _)) => return Err(SqlError::UnsupportedFilter(col.to_string())),
            };
            Ok(Command::SelectReservations { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// The single `column = value` comparison a WHERE clause may hold.
fn where_eq(expr: &Expr) -> Result<(&'static str, &Expr), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left:?}")))?;
            let known = ["id", "day", "claimant_id", "scope"]
                .into_iter()
                .find(|k| *k == col)
                .ok_or(SqlError::UnsupportedFilter(col))?;
            Ok((known, right.as_ref()))
        }
        Expr::Nested(inner) => where_eq(inner),
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match where_eq(sel)? {
        ("id", value) => parse_ulid(value),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
    UnsupportedFilter(String),
    ReadOnlyColumn(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::UnsupportedFilter(col) => write!(f, "cannot filter on column: {col}"),
            SqlError::ReadOnlyColumn(col) => write!(f, "column cannot be updated: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
