use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_IN_CLAUSE_IDS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        vehicle: Vehicle,
    },
    DeleteVehicle {
        id: Ulid,
    },
    InsertAddOn {
        add_on: AddOn,
    },
    DeleteAddOn {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        vehicle_id: Ulid,
        customer_id: String,
        start: Ms,
        end: Ms,
        add_on_ids: Vec<Ulid>,
    },
    /// `DELETE FROM reservations` cancels; records are never removed.
    CancelReservation {
        id: Ulid,
    },
    /// `INSERT INTO history` requests a lifecycle transition.
    InsertHistory {
        reservation_id: Ulid,
        action: HistoryAction,
        note: Option<String>,
    },
    SelectVehicles {
        category: Option<String>,
        max_price_per_day: Option<Money>,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SelectAddOns,
    SelectReservations {
        lookup: ReservationLookup,
    },
    SelectHistory {
        reservation_id: Ulid,
    },
    SelectAvailability {
        target: AvailabilityTarget,
        start: Ms,
        end: Ms,
    },
    SelectQuote {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        add_on_ids: Vec<Ulid>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationLookup {
    ById(Ulid),
    ByVehicle(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityTarget {
    Vehicle(Ulid),
    /// Union of free time across all vehicles of a category.
    Category(String),
}

/// Parse a single statement.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut cmds = parse_batch(sql)?;
    if cmds.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }
    cmds.pop().ok_or(SqlError::Empty)
}

/// Parse a `;`-separated script. All statements must parse before any runs.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];

    match table.as_str() {
        "vehicles" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("vehicles", 5, values.len()));
            }
            let available = match values.get(5) {
                Some(v) => parse_bool(v)?,
                None => true,
            };
            Ok(Command::InsertVehicle {
                vehicle: Vehicle {
                    id: parse_ulid(&values[0])?,
                    name: parse_string(&values[1])?,
                    category: parse_string(&values[2])?,
                    price_per_day: parse_money(&values[3])?,
                    deposit: parse_money(&values[4])?,
                    available,
                },
            })
        }
        "add_ons" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("add_ons", 3, values.len()));
            }
            Ok(Command::InsertAddOn {
                add_on: AddOn {
                    id: parse_ulid(&values[0])?,
                    name: parse_string(&values[1])?,
                    price: parse_money(&values[2])?,
                },
            })
        }
        "reservations" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("reservations", 5, values.len()));
            }
            let add_on_ids = match values.get(5) {
                Some(v) => parse_id_list(v)?,
                None => Vec::new(),
            };
            Ok(Command::InsertReservation {
                id: parse_ulid(&values[0])?,
                vehicle_id: parse_ulid(&values[1])?,
                customer_id: parse_string(&values[2])?,
                start: parse_time(&values[3])?,
                end: parse_time(&values[4])?,
                add_on_ids,
            })
        }
        "history" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("history", 2, values.len()));
            }
            let note = match values.get(2) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertHistory {
                reservation_id: parse_ulid(&values[0])?,
                action: parse_action(&values[1])?,
                note,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "vehicles" => Ok(Command::DeleteVehicle { id }),
        "add_ons" => Ok(Command::DeleteAddOn { id }),
        "reservations" => Ok(Command::CancelReservation { id }),
        "history" => Err(SqlError::Unsupported("history is append-only".into())),
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
    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "vehicles" => Ok(Command::SelectVehicles {
            category: filters.eq("category").map(parse_string).transpose()?,
            max_price_per_day: filters.lte("price_per_day").map(parse_money).transpose()?,
            start: filters.gte("start").map(parse_time).transpose()?,
            end: filters.lte("end").map(parse_time).transpose()?,
        }),
        "add_ons" => Ok(Command::SelectAddOns),
        "reservations" => {
            let lookup = if let Some(id) = filters.eq("id") {
                ReservationLookup::ById(parse_ulid(id)?)
            } else if let Some(vehicle_id) = filters.eq("vehicle_id") {
                ReservationLookup::ByVehicle(parse_ulid(vehicle_id)?)
            } else {
                return Err(SqlError::MissingFilter("id or vehicle_id"));
            };
            Ok(Command::SelectReservations { lookup })
        }
        "history" => Ok(Command::SelectHistory {
            reservation_id: parse_ulid(filters.require_eq("reservation_id")?)?,
        }),
        "availability" => {
            let target = if let Some(vehicle_id) = filters.eq("vehicle_id") {
                AvailabilityTarget::Vehicle(parse_ulid(vehicle_id)?)
            } else if let Some(category) = filters.eq("category") {
                AvailabilityTarget::Category(parse_string(category)?)
            } else {
                return Err(SqlError::MissingFilter("vehicle_id or category"));
            };
            let (start, end) = filters.window()?;
            Ok(Command::SelectAvailability { target, start, end })
        }
        "quote" => {
            let vehicle_id = parse_ulid(filters.require_eq("vehicle_id")?)?;
            let (start, end) = filters.window()?;
            let mut add_on_ids = Vec::new();
            if let Some(list) = filters.in_lists.get("add_on_id") {
                if list.len() > MAX_IN_CLAUSE_IDS {
                    return Err(SqlError::Parse(format!(
                        "too many values in IN clause (max {MAX_IN_CLAUSE_IDS})"
                    )));
                }
                for e in list {
                    add_on_ids.push(parse_ulid(e)?);
                }
            } else if let Some(single) = filters.eq("add_on_id") {
                add_on_ids.push(parse_ulid(single)?);
            }
            Ok(Command::SelectQuote { vehicle_id, start, end, add_on_ids })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

/// Conjunctive WHERE clause flattened by column. Other shapes are ignored.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    gte: HashMap<String, Expr>,
    lte: HashMap<String, Expr>,
    in_lists: HashMap<String, Vec<Expr>>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner)?,
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)?;
                }
                ast::BinaryOperator::Or => {
                    return Err(SqlError::Unsupported("OR in WHERE".into()));
                }
                ast::BinaryOperator::Eq => self.insert_cmp(Cmp::Eq, left, right),
                ast::BinaryOperator::GtEq => self.insert_cmp(Cmp::Gte, left, right),
                ast::BinaryOperator::LtEq => self.insert_cmp(Cmp::Lte, left, right),
                _ => {}
            },
            Expr::InList { expr, list, negated: false } => {
                if let Some(col) = expr_column_name(expr) {
                    self.in_lists.insert(col, list.clone());
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn insert_cmp(&mut self, cmp: Cmp, left: &Expr, right: &Expr) {
        let Some(col) = expr_column_name(left) else { return };
        let target = match cmp {
            Cmp::Eq => &mut self.eq,
            Cmp::Gte => &mut self.gte,
            Cmp::Lte => &mut self.lte,
        };
        target.insert(col, right.clone());
    }

    fn eq(&self, col: &str) -> Option<&Expr> {
        self.eq.get(col)
    }

    fn gte(&self, col: &str) -> Option<&Expr> {
        self.gte.get(col)
    }

    fn lte(&self, col: &str) -> Option<&Expr> {
        self.lte.get(col)
    }

    fn require_eq(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.eq(col).ok_or(SqlError::MissingFilter(col))
    }

    /// `start >= .. AND "end" <= ..`
    fn window(&self) -> Result<(Ms, Ms), SqlError> {
        let start = parse_time(self.gte("start").ok_or(SqlError::MissingFilter("start"))?)?;
        let end = parse_time(self.lte("end").ok_or(SqlError::MissingFilter("end"))?)?;
        Ok((start, end))
    }
}

enum Cmp {
    Eq,
    Gte,
    Lte,
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Filters::default();
    filters.collect(sel)?;
    parse_ulid(filters.require_eq("id")?)
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_ulid_str(s),
        Some(other) => Err(SqlError::Parse(format!("expected ULID string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// `'id1,id2,...'`, `''`, or NULL.
fn parse_id_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let Some(raw) = parse_string_or_null(expr)? else {
        return Ok(Vec::new());
    };
    let ids: Vec<&str> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if ids.len() > MAX_IN_CLAUSE_IDS {
        return Err(SqlError::Parse(format!("too many add-on ids (max {MAX_IN_CLAUSE_IDS})")));
    }
    ids.into_iter().map(parse_ulid_str).collect()
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) => s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// Unix ms as a number, or a quoted `YYYY-MM-DD` (midnight UTC),
/// RFC 3339 timestamp, or integer string.
fn parse_time(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => parse_time_str(s),
        _ => parse_i64(expr),
    }
}

pub fn parse_time_str(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp {s:?}: expected ms, YYYY-MM-DD or RFC 3339")))
}

/// Decimal amount in major units with at most two fraction digits.
fn parse_money(expr: &Expr) -> Result<Money, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_money(expr).map(|m| Money::from_cents(-m.cents()));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => parse_money_str(s),
        Some(other) => Err(SqlError::Parse(format!("expected amount, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

pub fn parse_money_str(s: &str) -> Result<Money, SqlError> {
    let bad = || SqlError::Parse(format!("bad amount {s:?}"));
    let trimmed = s.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (units, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if units.is_empty() || frac.len() > 2 || !units.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let units: i64 = units.parse().map_err(|_| bad())?;
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().map_err(|_| bad())? * 10,
        _ => frac.parse().map_err(|_| bad())?,
    };
    let cents = units
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac_cents))
        .ok_or_else(bad)?;
    Ok(Money::from_cents(if negative { -cents } else { cents }))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_action(expr: &Expr) -> Result<HistoryAction, SqlError> {
    let raw = parse_string(expr)?;
    match raw.trim().to_lowercase().as_str() {
        "confirmed" | "confirm" => Ok(HistoryAction::Confirmed),
        "active" | "activated" | "activate" => Ok(HistoryAction::Activated),
        "completed" | "complete" => Ok(HistoryAction::Completed),
        "cancelled" | "canceled" | "cancel" => Ok(HistoryAction::Cancelled),
        _ => Err(SqlError::Parse(format!(
            "unknown action {raw:?} (expected confirmed, active, completed or cancelled)"
        ))),
    }
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
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at least {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
