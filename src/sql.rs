use chrono::{NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::DayHours;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertService {
        id: Ulid,
        name: String,
        duration_min: u32,
        price_cents: i64,
        active: bool,
    },
    UpsertProfessional {
        id: Ulid,
        name: String,
        specialty: Option<String>,
    },
    SetBusinessHours {
        weekday: Weekday,
        hours: DayHours,
    },
    /// Book for the calling client. `start` is an ISO-8601 instant, validated by the engine.
    InsertAppointment {
        service_id: Ulid,
        professional_id: Option<Ulid>,
        start: String,
    },
    /// Soft delete: cancels, never removes.
    DeleteAppointment {
        id: Ulid,
    },
    SetAppointmentStatus {
        id: Ulid,
        status: String,
    },
    SelectSlots {
        date: NaiveDate,
        service_id: Ulid,
        professional_id: Option<Ulid>,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectServices,
    SelectProfessionals,
    SelectBusinessHours,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppointmentFilter {
    /// Everything the caller may see.
    All,
    Id(Ulid),
    Client(String),
}

/// Which row shape a statement produces, decided without binding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Appointments,
    Slots,
    Services,
    Professionals,
    BusinessHours,
    /// Command tag only.
    Empty,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmt = parse_statement(sql)?;
    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Classify a (possibly parameterized) statement by the rows it will return.
pub fn result_shape(sql: &str) -> ResultShape {
    let Ok(stmt) = parse_statement(sql) else {
        return ResultShape::Empty;
    };
    match &stmt {
        // Appointment writes echo the resulting appointment; catalog writes return a tag.
        Statement::Insert(insert) => match insert_table_name(insert).as_deref() {
            Ok("appointments" | "appointment_status") => ResultShape::Appointments,
            _ => ResultShape::Empty,
        },
        Statement::Delete(delete) => match delete_table_name(delete).as_deref() {
            Ok("appointments") => ResultShape::Appointments,
            _ => ResultShape::Empty,
        },
        Statement::Query(query) => {
            let table = match query.body.as_ref() {
                SetExpr::Select(s) => s.from.first().and_then(|f| table_factor_name(&f.relation).ok()),
                _ => None,
            };
            match table.as_deref() {
                Some("appointments") => ResultShape::Appointments,
                Some("slots") => ResultShape::Slots,
                Some("services") => ResultShape::Services,
                Some("professionals") => ResultShape::Professionals,
                Some("business_hours") => ResultShape::BusinessHours,
                _ => ResultShape::Empty,
            }
        }
        _ => ResultShape::Empty,
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }
    Ok(stmts.remove(0))
}

// ── INSERT ────────────────────────────────────────────────────

/// Writable tables and their positional column order for INSERTs that name no columns.
const INSERT_TABLES: [(&str, &[&str]); 5] = [
    ("services", &["id", "name", "duration", "price", "active"]),
    ("professionals", &["id", "name", "specialty"]),
    ("business_hours", &["weekday", "open", "opens_at", "closes_at"]),
    ("appointments", &["service_id", "professional_id", "start"]),
    ("appointment_status", &["appointment_id", "status"]),
];

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
            .filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let Some(&(table, defaults)) = INSERT_TABLES.iter().find(|(t, _)| *t == name) else {
        return Err(SqlError::UnknownTable(name));
    };
    let values = extract_single_row(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let row = Row {
        table,
        cells: columns.into_iter().zip(values.iter()).collect(),
    };

    match table {
        "services" => Ok(Command::UpsertService {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
            duration_min: parse_u32(row.required("duration")?)?,
            price_cents: row.get("price").map(parse_i64).transpose()?.unwrap_or(0),
            active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
        }),
        "professionals" => Ok(Command::UpsertProfessional {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
            specialty: row.get("specialty").map(parse_string).transpose()?,
        }),
        "business_hours" => {
            let weekday = parse_weekday(row.required("weekday")?)?;
            let open = row.get("open").map(parse_bool).transpose()?.unwrap_or(true);
            let hours = if open {
                DayHours::open(
                    parse_time(row.required("opens_at")?)?,
                    parse_time(row.required("closes_at")?)?,
                )
            } else {
                DayHours::closed()
            };
            Ok(Command::SetBusinessHours { weekday, hours })
        }
        "appointments" => Ok(Command::InsertAppointment {
            service_id: parse_ulid(row.required("service_id")?)?,
            professional_id: row.get("professional_id").map(parse_ulid).transpose()?,
            start: parse_string(row.required("start")?)?,
        }),
        "appointment_status" => Ok(Command::SetAppointmentStatus {
            id: parse_ulid(row.required("appointment_id")?)?,
            status: parse_string(row.required("status")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::Unsupported(format!("DELETE FROM {table}")));
    }
    let filters = where_filters(delete.selection.as_ref())?;
    let id = filters.get("id").ok_or(SqlError::MissingFilter("id"))?;
    Ok(Command::DeleteAppointment { id: parse_ulid(id)? })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            date: parse_date(filters.get("date").ok_or(SqlError::MissingFilter("date"))?)?,
            service_id: parse_ulid(
                filters
                    .get("service_id")
                    .ok_or(SqlError::MissingFilter("service_id"))?,
            )?,
            professional_id: filters.get("professional_id").map(parse_ulid).transpose()?,
        }),
        "appointments" => {
            let filter = if let Some(id) = filters.get("id") {
                AppointmentFilter::Id(parse_ulid(id)?)
            } else if let Some(client) = filters.get("client_id") {
                AppointmentFilter::Client(parse_string(client)?)
            } else {
                AppointmentFilter::All
            };
            Ok(Command::SelectAppointments { filter })
        }
        "services" => Ok(Command::SelectServices),
        "professionals" => Ok(Command::SelectProfessionals),
        "business_hours" => Ok(Command::SelectBusinessHours),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` conjuncts of a WHERE clause. Anything else is rejected rather
/// than silently ignored.
struct Filters<'a>(Vec<(String, &'a Expr)>);

impl<'a> Filters<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }
}

fn where_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
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
    match tables_with_joins.first() {
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

fn extract_single_row(insert: &ast::Insert) -> Result<&Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Text of a quoted string or a bare number.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    literal_text(expr).map(str::to_string)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::BadValue(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::BadValue(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::BadValue(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(SqlError::BadValue(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

const ISO_WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// `monday`, `mon`, or ISO number 1 (Monday) through 7 (Sunday).
fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = literal_text(expr)?.trim();
    if let Ok(n) = s.parse::<usize>() {
        return match n {
            1..=7 => Ok(ISO_WEEK[n - 1]),
            _ => Err(SqlError::BadValue(format!("weekday number must be 1-7, got {n}"))),
        };
    }
    s.parse::<Weekday>()
        .map_err(|_| SqlError::BadValue(format!("bad weekday: {s}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = literal_text(expr)?.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| SqlError::BadValue(format!("bad time of day: {s}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| SqlError::BadValue(format!("bad date: {s}")))
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
    /// Well-formed SQL carrying a value of the wrong shape.
    BadValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
