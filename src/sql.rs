use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{self, Span};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectProviders,
    InsertProvider {
        /// Defaults to the caller's own id.
        id: Option<Ulid>,
        name: String,
    },
    SelectAvailability {
        provider_id: Ulid,
    },
    InsertAvailability {
        provider_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        timezone: Option<Tz>,
    },
    DeleteAvailability {
        provider_id: Ulid,
        date: NaiveDate,
    },
    SelectSlots {
        date: NaiveDate,
        provider_id: Option<Ulid>,
        timezone: Option<Tz>,
    },
    SelectReservations {
        date: Option<NaiveDate>,
    },
    InsertHold {
        date: NaiveDate,
        slot: Span,
        provider_id: Option<Ulid>,
    },
    InsertAssignment {
        reservation_id: Ulid,
        provider_id: Ulid,
    },
    InsertBooking {
        reservation_id: Ulid,
    },
    DeleteReservation {
        id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Change-feed channel name for a date: `slots_YYYYMMDD`.
pub fn channel_for(date: NaiveDate) -> String {
    format!("slots_{}", date.format("%Y%m%d"))
}

/// Inverse of [`channel_for`].
pub fn channel_date(channel: &str) -> Result<NaiveDate, SqlError> {
    channel
        .strip_prefix("slots_")
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok())
        .ok_or_else(|| SqlError::BadChannel(channel.to_string()))
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_ascii_uppercase();
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if let Some(rest) = upper.strip_prefix("LISTEN ") {
        let channel = trimmed[trimmed.len() - rest.len()..].trim().to_lowercase();
        return Ok(Command::Listen { channel });
    }
    if let Some(rest) = upper.strip_prefix("UNLISTEN ") {
        let channel = trimmed[trimmed.len() - rest.len()..].trim().to_lowercase();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by the INSERT's column list.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &'static str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.require(col)?)
    }

    fn opt_ulid(&self, col: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid_or_null).transpose().map(Option::flatten)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.require(col)?)
    }

    fn time(&self, col: &'static str) -> Result<NaiveTime, SqlError> {
        parse_time(self.require(col)?)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = |table: &'static str| insert_row(insert, table);

    match table.as_str() {
        "providers" => {
            let row = row("providers")?;
            Ok(Command::InsertProvider {
                id: row.opt_ulid("id")?,
                name: parse_string(row.require("name")?)?,
            })
        }
        "availability" => {
            let row = row("availability")?;
            Ok(Command::InsertAvailability {
                provider_id: row.ulid("provider_id")?,
                date: row.date("date")?,
                start: row.time("start")?,
                end: row.time("end")?,
                timezone: row.get("timezone").map(parse_tz).transpose()?,
            })
        }
        "holds" => {
            let row = row("holds")?;
            let (start, end) = (row.time("start")?, row.time("end")?);
            if start >= end {
                return Err(SqlError::Parse(format!(
                    "hold must end after it starts: {} >= {}",
                    model::format_time(start),
                    model::format_time(end)
                )));
            }
            Ok(Command::InsertHold {
                date: row.date("date")?,
                slot: Span::new(start, end),
                provider_id: row.opt_ulid("provider_id")?,
            })
        }
        "assignments" => {
            let row = row("assignments")?;
            Ok(Command::InsertAssignment {
                reservation_id: row.ulid("reservation_id")?,
                provider_id: row.ulid("provider_id")?,
            })
        }
        "bookings" => {
            let row = row("bookings")?;
            Ok(Command::InsertBooking {
                reservation_id: row.ulid("reservation_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn insert_row(insert: &ast::Insert, table: &'static str) -> Result<Row, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let [first] = values.as_slice() else {
        return Err(SqlError::Parse(format!("{table}: exactly one VALUES row expected")));
    };
    if first.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), first.len()));
    }
    let cells = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .zip(first.iter().cloned())
        .collect();
    Ok(Row { table, cells })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::DeleteAvailability {
            provider_id: parse_ulid(filters.require("provider_id")?)?,
            date: parse_date(filters.require("date")?)?,
        }),
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid(filters.require("id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "providers" => Ok(Command::SelectProviders),
        "availability" => Ok(Command::SelectAvailability {
            provider_id: parse_ulid(filters.require("provider_id")?)?,
        }),
        "slots" => Ok(Command::SelectSlots {
            date: parse_date(filters.require("date")?)?,
            provider_id: filters.get("provider_id").map(parse_ulid).transpose()?,
            timezone: filters.get("timezone").map(parse_tz).transpose()?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            date: filters.get("date").map(parse_date).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` conjuncts of a WHERE clause.
struct Filters<'a> {
    eqs: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.eqs.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }
}

fn where_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut filters = Filters { eqs: Vec::new() };
    if let Some(expr) = selection {
        collect_eqs(expr, &mut filters.eqs)?;
    }
    Ok(filters)
}

fn collect_eqs<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eqs(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eqs(left, out)?;
                collect_eqs(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    model::parse_date(&s).map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    model::parse_time(&s).map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_tz(expr: &Expr) -> Result<Tz, SqlError> {
    let s = parse_string(expr)?;
    s.parse::<Tz>()
        .map_err(|_| SqlError::Parse(format!("unknown timezone {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    BadChannel(String),
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
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadChannel(c) => write!(f, "invalid channel: {c} (expected slots_YYYYMMDD)"),
        }
    }
}

impl std::error::Error for SqlError {}
