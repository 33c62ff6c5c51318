use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::PaymentUpdate;
use crate::limits::MAX_LEGACY_BATCH;
use crate::model::*;
use crate::settlement::{Money, Payment};
use crate::timeofday::{self, Minutes};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: String,
        hourly_rate: Money,
        base_coins: u32,
        slot_minutes: Minutes,
    },
    /// Every `None` keeps the stored value.
    UpdateResource {
        id: Ulid,
        name: Option<String>,
        hourly_rate: Option<Money>,
        base_coins: Option<u32>,
        slot_minutes: Option<Minutes>,
        active: Option<bool>,
    },
    InsertReservation {
        id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        slot_start: Minutes,
        customer_key: String,
        customer_name: String,
    },
    UpdateReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    InsertCounterBooking(NewCounterBooking),
    UpdateCounterTimes {
        id: Ulid,
        start: Option<Minutes>,
        end: Option<Minutes>,
    },
    UpdateCounterPayment {
        id: Ulid,
        update: PaymentUpdate,
    },
    CloseCounterSession {
        id: Ulid,
    },
    DeleteCounterBooking {
        id: Ulid,
    },
    ImportLegacy {
        records: Vec<LegacyCounterBooking>,
    },
    InsertAdjustment {
        operation_id: Ulid,
        customer_key: String,
        coins: i64,
        reason: String,
    },
    SelectResources,
    /// Without `slot_start`, lists every free grid slot of the day.
    SelectAvailability {
        resource_id: Ulid,
        date: NaiveDate,
        slot_start: Option<Minutes>,
        duration: Option<Minutes>,
    },
    SelectConflicts {
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
        exclude: Option<Ulid>,
    },
    SelectReservations {
        resource_id: Ulid,
        date: NaiveDate,
    },
    SelectCounterBookings {
        date: NaiveDate,
    },
    SelectCustomer {
        customer_key: String,
    },
    SelectAccount {
        customer_key: String,
    },
    SelectAudit {
        customer_key: Option<String>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen { channel: channel_name(&trimmed[7..]) });
    }
    if upper == "UNLISTEN *" || upper == "UNLISTEN" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        return Ok(Command::Unlisten { channel: channel_name(&trimmed[9..]) });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "{} statements in one query, send them one at a time",
            stmts.len()
        )));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            let table = table_factor_name(&table.relation)?;
            let sets = assignments
                .iter()
                .map(|a| match &a.target {
                    AssignmentTarget::ColumnName(name) => object_name_last(name)
                        .map(|col| (col, a.value.clone()))
                        .ok_or_else(|| SqlError::Parse("empty column name".into())),
                    AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let id = extract_where_id(selection)?;
            parse_update(&table, id, sets)
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn channel_name(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

// ── INSERT ────────────────────────────────────────────────────

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "hourly_rate", "base_coins", "slot_minutes"];
const RESERVATION_COLUMNS: &[&str] = &["id", "resource_id", "date", "slot_start", "customer_key", "customer_name"];
const COUNTER_COLUMNS: &[&str] = &[
    "id",
    "resource",
    "date",
    "start_time",
    "end_time",
    "customer_name",
    "customer_key",
    "amount",
    "discount",
    "cash_paid",
    "digital_paid",
];
const LEGACY_COLUMNS: &[&str] = &[
    "id",
    "resource",
    "date",
    "start_time",
    "end_time",
    "customer_name",
    "customer_key",
    "amount",
    "discount",
    "cash_paid",
    "digital_paid",
    "serial",
    "closed",
    "awarded",
];
const ADJUSTMENT_COLUMNS: &[&str] = &["id", "customer_key", "coins", "reason"];

const DEFAULT_SLOT_MINUTES: Minutes = 30;

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "resources" => {
            let row = single_row(insert, "resources", RESOURCE_COLUMNS)?;
            Ok(Command::InsertResource {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string_expr(row.require("name")?)?,
                hourly_rate: row.get("hourly_rate").map(parse_i64_expr).transpose()?.unwrap_or(0),
                base_coins: row.get("base_coins").map(parse_u32).transpose()?.unwrap_or(0),
                slot_minutes: row
                    .get("slot_minutes")
                    .map(parse_u32)
                    .transpose()?
                    .unwrap_or(DEFAULT_SLOT_MINUTES),
            })
        }
        "reservations" => {
            let row = single_row(insert, "reservations", RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                id: parse_ulid_expr(row.require("id")?)?,
                resource_id: parse_ulid_expr(row.require("resource_id")?)?,
                date: parse_date_expr(row.require("date")?)?,
                slot_start: parse_minutes_expr(row.require("slot_start")?)?,
                customer_key: parse_string_expr(row.require("customer_key")?)?,
                customer_name: parse_string_expr(row.require("customer_name")?)?,
            })
        }
        "counter_bookings" => {
            let row = single_row(insert, "counter_bookings", COUNTER_COLUMNS)?;
            let money = |col| row.get(col).map(parse_i64_expr).transpose().map(Option::unwrap_or_default);
            Ok(Command::InsertCounterBooking(NewCounterBooking {
                id: parse_ulid_expr(row.require("id")?)?,
                resource: ResourceRef::parse(&parse_string_expr(row.require("resource")?)?),
                date: parse_date_expr(row.require("date")?)?,
                span: Span::new(
                    parse_minutes_expr(row.require("start_time")?)?,
                    parse_minutes_expr(row.require("end_time")?)?,
                ),
                customer_name: parse_string_expr(row.require("customer_name")?)?,
                customer_key: row.get("customer_key").map(parse_string_or_null).transpose()?.flatten(),
                payment: Payment::new(money("amount")?, money("discount")?, money("cash_paid")?, money("digital_paid")?),
            }))
        }
        "legacy_counter_bookings" => {
            let rows = insert_rows(insert, "legacy_counter_bookings", LEGACY_COLUMNS)?;
            if rows.len() > MAX_LEGACY_BATCH {
                return Err(SqlError::Unsupported(format!("more than {MAX_LEGACY_BATCH} rows")));
            }
            let records = rows
                .iter()
                .enumerate()
                .map(|(i, row)| legacy_record(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}"))))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Command::ImportLegacy { records })
        }
        "adjustments" => {
            let row = single_row(insert, "adjustments", ADJUSTMENT_COLUMNS)?;
            Ok(Command::InsertAdjustment {
                operation_id: parse_ulid_expr(row.require("id")?)?,
                customer_key: parse_string_expr(row.require("customer_key")?)?,
                coins: parse_i64_expr(row.require("coins")?)?,
                reason: parse_string_expr(row.require("reason")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Legacy rows keep their text times and resource references as-is; the
/// engine resolves them and reports what it cannot.
fn legacy_record(row: &Row) -> Result<LegacyCounterBooking, SqlError> {
    let money = |col| row.get(col).map(parse_i64_expr).transpose().map(Option::unwrap_or_default);
    let flag = |col| row.get(col).map(parse_bool).transpose().map(Option::unwrap_or_default);
    Ok(LegacyCounterBooking {
        id: parse_ulid_expr(row.require("id")?)?,
        resource: parse_string_expr(row.require("resource")?)?,
        date: parse_string_expr(row.require("date")?)?,
        start_time: parse_string_expr(row.require("start_time")?)?,
        end_time: parse_string_expr(row.require("end_time")?)?,
        customer_name: parse_string_expr(row.require("customer_name")?)?,
        customer_key: row.get("customer_key").map(parse_string_or_null).transpose()?.flatten(),
        amount: money("amount")?,
        discount: money("discount")?,
        cash_paid: money("cash_paid")?,
        digital_paid: money("digital_paid")?,
        serial: row.get("serial").map(parse_u32_or_null).transpose()?.flatten(),
        closed: flag("closed")?,
        awarded: flag("awarded")?,
    })
}

/// One VALUES row keyed by column name. Without an explicit column list the
/// values are taken in the table's canonical column order.
struct Row {
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }
}

fn insert_rows(insert: &ast::Insert, table: &'static str, canonical: &[&str]) -> Result<Vec<Row>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        canonical.iter().map(|c| c.to_string()).collect()
    } else {
        let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
        if let Some(unknown) = columns.iter().find(|c| !canonical.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        columns
    };

    extract_all_insert_rows(insert)?
        .into_iter()
        .map(|values| {
            let arity_ok = if insert.columns.is_empty() {
                values.len() <= columns.len()
            } else {
                values.len() == columns.len()
            };
            if !arity_ok {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            Ok(Row { cells: columns.iter().cloned().zip(values).collect() })
        })
        .collect()
}

fn single_row(insert: &ast::Insert, table: &'static str, canonical: &[&str]) -> Result<Row, SqlError> {
    let mut rows = insert_rows(insert, table, canonical)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    Ok(rows.remove(0))
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(table: &str, id: Ulid, sets: Vec<(String, Expr)>) -> Result<Command, SqlError> {
    if sets.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    match table {
        "resources" => {
            let (mut name, mut hourly_rate, mut base_coins, mut slot_minutes, mut active) =
                (None, None, None, None, None);
            for (col, value) in &sets {
                match col.as_str() {
                    "name" => name = Some(parse_string_expr(value)?),
                    "hourly_rate" => hourly_rate = Some(parse_i64_expr(value)?),
                    "base_coins" => base_coins = Some(parse_u32(value)?),
                    "slot_minutes" => slot_minutes = Some(parse_u32(value)?),
                    "active" => active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn(col.clone())),
                }
            }
            Ok(Command::UpdateResource { id, name, hourly_rate, base_coins, slot_minutes, active })
        }
        "reservations" => match sets.as_slice() {
            [(col, value)] if col == "status" => {
                let raw = parse_string_expr(value)?;
                let status = ReservationStatus::parse(&raw)
                    .ok_or_else(|| SqlError::Parse(format!("unknown reservation status {raw:?}")))?;
                Ok(Command::UpdateReservationStatus { id, status })
            }
            _ => Err(SqlError::Unsupported("reservations: only status can be updated".into())),
        },
        "counter_bookings" => parse_counter_update(id, &sets),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_counter_update(id: Ulid, sets: &[(String, Expr)]) -> Result<Command, SqlError> {
    if let Some((_, value)) = sets.iter().find(|(col, _)| col == "status") {
        let raw = parse_string_expr(value)?;
        if sets.len() != 1 || !raw.eq_ignore_ascii_case("closed") {
            return Err(SqlError::Unsupported("counter_bookings: status can only be set to 'closed' on its own".into()));
        }
        return Ok(Command::CloseCounterSession { id });
    }

    let (mut start, mut end) = (None, None);
    let mut update = PaymentUpdate::default();
    for (col, value) in sets {
        match col.as_str() {
            "start_time" => start = Some(parse_minutes_expr(value)?),
            "end_time" => end = Some(parse_minutes_expr(value)?),
            "amount" => update.amount = Some(parse_i64_expr(value)?),
            "discount" => update.discount = Some(parse_i64_expr(value)?),
            "cash_paid" => update.cash_paid = Some(parse_i64_expr(value)?),
            "digital_paid" => update.digital_paid = Some(parse_i64_expr(value)?),
            _ => return Err(SqlError::UnknownColumn(col.clone())),
        }
    }
    let times = start.is_some() || end.is_some();
    match (times, update != PaymentUpdate::default()) {
        (true, true) => Err(SqlError::Unsupported("update times and payment in separate statements".into())),
        (true, false) => Ok(Command::UpdateCounterTimes { id, start, end }),
        _ => Ok(Command::UpdateCounterPayment { id, update }),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "counter_bookings" => Ok(Command::DeleteCounterBooking { id }),
        "reservations" | "resources" => {
            Err(SqlError::Unsupported(format!("{table} are cancelled or deactivated, not deleted")))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filters = Row { cells: filters };
    let need = |col: &'static str| filters.get(col).ok_or(SqlError::MissingFilter(col));

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "availability" => Ok(Command::SelectAvailability {
            resource_id: parse_ulid_expr(need("resource_id")?)?,
            date: parse_date_expr(need("date")?)?,
            slot_start: filters.get("slot_start").map(parse_minutes_expr).transpose()?,
            duration: filters.get("duration").map(parse_u32).transpose()?,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            resource_id: parse_ulid_expr(need("resource_id")?)?,
            date: parse_date_expr(need("date")?)?,
            span: Span::new(
                parse_minutes_expr(need("start_time")?)?,
                parse_minutes_expr(need("end_time")?)?,
            ),
            exclude: filters.get("exclude").map(parse_ulid_expr).transpose()?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            resource_id: parse_ulid_expr(need("resource_id")?)?,
            date: parse_date_expr(need("date")?)?,
        }),
        "counter_bookings" => Ok(Command::SelectCounterBookings { date: parse_date_expr(need("date")?)? }),
        "customers" => Ok(Command::SelectCustomer { customer_key: parse_string_expr(need("customer_key")?)? }),
        "accounts" => Ok(Command::SelectAccount { customer_key: parse_string_expr(need("customer_key")?)? }),
        "audit_log" => Ok(Command::SelectAudit {
            customer_key: filters.get("customer_key").map(parse_string_expr).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2 AND ...` into column/value pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let v = parse_i64_expr(expr)?;
        v.checked_neg().ok_or_else(|| SqlError::Parse(format!("-({v}) out of i64 range")))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_u32(expr).map(Some),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let raw = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| SqlError::Parse(format!("bad date {raw:?}")))
}

/// Times arrive as `'10:30'` / `'10:30 AM'` or as plain minutes since midnight.
fn parse_minutes_expr(expr: &Expr) -> Result<Minutes, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            timeofday::parse_time_of_day(s).map_err(|e| SqlError::Parse(e.to_string()))
        }
        _ => parse_u32(expr),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
