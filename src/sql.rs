use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which bookings a `SELECT ... FROM bookings` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingScope {
    Staff(Ulid),
    Tenant(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTenant {
        id: Ulid,
        name: Option<String>,
        utc_offset_minutes: i32,
        grid: GridSpec,
    },
    DeleteTenant {
        id: Ulid,
    },
    SelectTenants,
    InsertStaff {
        id: Ulid,
        tenant_id: Ulid,
        name: Option<String>,
    },
    SetStaffActive {
        staff_id: Ulid,
        active: bool,
    },
    DeleteStaff {
        id: Ulid,
    },
    SelectStaff {
        tenant_id: Option<Ulid>,
    },
    InsertService {
        id: Ulid,
        tenant_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_cents: i64,
    },
    DeleteService {
        id: Ulid,
    },
    SelectServices {
        tenant_id: Option<Ulid>,
    },
    /// Every row of one multi-row INSERT; replaces the tenant's hours wholesale.
    ReplaceBusinessHours {
        tenant_id: Ulid,
        hours: Vec<BusinessHours>,
    },
    ClearBusinessHours {
        tenant_id: Ulid,
    },
    SelectBusinessHours {
        tenant_id: Ulid,
    },
    InsertBooking(BookingCandidate),
    SetBookingStatus {
        booking_id: Ulid,
        status: BookingStatus,
    },
    CancelBooking {
        id: Ulid,
    },
    ClearBookingHistory {
        tenant_id: Ulid,
        before: NaiveDate,
    },
    SelectBookings {
        scope: BookingScope,
        date: Option<NaiveDate>,
    },
    SelectAvailability {
        staff_id: Ulid,
        date: NaiveDate,
    },
}

impl Command {
    /// Commands reserved for users on the admin allowlist.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::InsertTenant { .. }
                | Command::DeleteTenant { .. }
                | Command::ClearBookingHistory { .. }
        )
    }
}

const TENANT_COLUMNS: &[&str] = &[
    "id",
    "name",
    "utc_offset_minutes",
    "grid_start",
    "grid_end",
    "grid_step_minutes",
];
const STAFF_COLUMNS: &[&str] = &["id", "tenant_id", "name"];
const STAFF_STATUS_COLUMNS: &[&str] = &["staff_id", "active"];
const SERVICE_COLUMNS: &[&str] = &["id", "tenant_id", "name", "duration_minutes", "price_cents"];
const HOURS_COLUMNS: &[&str] = &["tenant_id", "day_of_week", "is_open", "open_time", "close_time"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "staff_id",
    "service_id",
    "date",
    "time",
    "client_name",
    "client_phone",
    "client_email",
    "payment",
    "notes",
];
const BOOKING_STATUS_COLUMNS: &[&str] = &["booking_id", "status"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "tenants" => {
            let row = single_row(insert, "tenants", TENANT_COLUMNS)?;
            let defaults = GridSpec::default();
            Ok(Command::InsertTenant {
                id: parse_ulid(row.required("id")?)?,
                name: row.optional_at("name", parse_string)?,
                utc_offset_minutes: row
                    .get("utc_offset_minutes")
                    .map(parse_i32_or_null)
                    .transpose()?
                    .flatten()
                    .unwrap_or(0),
                grid: GridSpec {
                    start: row.optional_at("grid_start", parse_time)?.unwrap_or(defaults.start),
                    end: row.optional_at("grid_end", parse_time)?.unwrap_or(defaults.end),
                    step_minutes: row
                        .optional_at("grid_step_minutes", parse_u16)?
                        .unwrap_or(defaults.step_minutes),
                },
            })
        }
        "staff" => {
            let row = single_row(insert, "staff", STAFF_COLUMNS)?;
            Ok(Command::InsertStaff {
                id: parse_ulid(row.required("id")?)?,
                tenant_id: parse_ulid(row.required("tenant_id")?)?,
                name: row.optional_at("name", parse_string)?,
            })
        }
        "staff_status" => {
            let row = single_row(insert, "staff_status", STAFF_STATUS_COLUMNS)?;
            Ok(Command::SetStaffActive {
                staff_id: parse_ulid(row.required("staff_id")?)?,
                active: parse_bool(row.required("active")?)?,
            })
        }
        "services" => {
            let row = single_row(insert, "services", SERVICE_COLUMNS)?;
            Ok(Command::InsertService {
                id: parse_ulid(row.required("id")?)?,
                tenant_id: parse_ulid(row.required("tenant_id")?)?,
                name: parse_string(row.required("name")?)?,
                duration_minutes: parse_u32(row.required("duration_minutes")?)?,
                price_cents: row.optional_at("price_cents", parse_i64)?.unwrap_or(0),
            })
        }
        "business_hours" => {
            let rows = insert_rows(insert, "business_hours", HOURS_COLUMNS)?;
            let mut tenant_id = None;
            let mut hours = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let row_tenant = parse_ulid(row.required("tenant_id")?)?;
                if *tenant_id.get_or_insert(row_tenant) != row_tenant {
                    return Err(SqlError::Parse(format!(
                        "row {i}: all business_hours rows must share one tenant_id"
                    )));
                }
                hours.push(BusinessHours {
                    day_of_week: parse_u8(row.required("day_of_week")?)?,
                    is_open: parse_bool(row.required("is_open")?)?,
                    open_time: row.optional_at("open_time", parse_time)?,
                    close_time: row.optional_at("close_time", parse_time)?,
                });
            }
            let tenant_id = tenant_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::ReplaceBusinessHours { tenant_id, hours })
        }
        "bookings" => {
            let row = single_row(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking(BookingCandidate {
                id: parse_ulid(row.required("id")?)?,
                staff_id: parse_ulid(row.required("staff_id")?)?,
                service_id: parse_ulid(row.required("service_id")?)?,
                date: parse_date(row.required("date")?)?,
                time: parse_time(row.required("time")?)?,
                client: ClientContact {
                    name: row.optional_at("client_name", parse_string)?.unwrap_or_default(),
                    phone: row.optional_at("client_phone", parse_string)?.unwrap_or_default(),
                    email: row.optional_at("client_email", parse_string)?,
                },
                payment: row.optional_at("payment", parse_payment)?,
                notes: row.optional_at("notes", parse_string)?,
            }))
        }
        "booking_status" => {
            let row = single_row(insert, "booking_status", BOOKING_STATUS_COLUMNS)?;
            Ok(Command::SetBookingStatus {
                booking_id: parse_ulid(row.required("booking_id")?)?,
                status: parse_status(row.required("status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row keyed by column name. Named columns come from the INSERT's
/// column list; without one, values are matched to `columns` by position and
/// trailing columns may be left out.
struct InsertRow<'a> {
    table: &'static str,
    values: HashMap<&'static str, &'a Expr>,
}

impl<'a> InsertRow<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        match self.get(column) {
            Some(expr) if !is_null(expr) => Ok(expr),
            _ => Err(SqlError::MissingValue(self.table, column)),
        }
    }

    /// Absent and NULL both read as `None`.
    fn optional_at<T>(
        &self,
        column: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.get(column) {
            Some(expr) if !is_null(expr) => parse(expr).map(Some),
            _ => Ok(None),
        }
    }
}

fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    columns: &[&'static str],
) -> Result<Vec<InsertRow<'a>>, SqlError> {
    let mut named = Vec::with_capacity(insert.columns.len());
    for ident in &insert.columns {
        let name = ident.value.to_lowercase();
        let column = columns
            .iter()
            .copied()
            .find(|c| *c == name)
            .ok_or_else(|| SqlError::UnknownColumn(table, name.clone()))?;
        named.push(column);
    }
    let names: &[&'static str] = if named.is_empty() { columns } else { &named };

    values_rows(insert)?
        .iter()
        .map(|row| {
            let arity_ok = if named.is_empty() {
                row.len() <= names.len()
            } else {
                row.len() == names.len()
            };
            if !arity_ok {
                return Err(SqlError::WrongArity(table, names.len(), row.len()));
            }
            Ok(InsertRow {
                table,
                values: names.iter().copied().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn single_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    columns: &[&'static str],
) -> Result<InsertRow<'a>, SqlError> {
    let mut rows = insert_rows(insert, table, columns)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!(
            "{table}: multi-row INSERT ({} rows)",
            rows.len()
        )));
    }
    rows.pop().ok_or(SqlError::Empty)
}

fn values_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

// ── DELETE / SELECT ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "tenants" => Ok(Command::DeleteTenant {
            id: filters.only(&["id"])?.required_ulid("id")?,
        }),
        "staff" => Ok(Command::DeleteStaff {
            id: filters.only(&["id"])?.required_ulid("id")?,
        }),
        "services" => Ok(Command::DeleteService {
            id: filters.only(&["id"])?.required_ulid("id")?,
        }),
        "business_hours" => Ok(Command::ClearBusinessHours {
            tenant_id: filters.only(&["tenant_id"])?.required_ulid("tenant_id")?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            id: filters.only(&["id"])?.required_ulid("id")?,
        }),
        "booking_history" => {
            let filters = filters.only(&["tenant_id", "date"])?;
            let before = filters
                .find("date", FilterOp::Lt)
                .ok_or(SqlError::MissingFilter("date <"))?;
            Ok(Command::ClearBookingHistory {
                tenant_id: filters.required_ulid("tenant_id")?,
                before: parse_date(before)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "tenants" => {
            filters.only(&[])?;
            Ok(Command::SelectTenants)
        }
        "staff" => Ok(Command::SelectStaff {
            tenant_id: filters.only(&["tenant_id"])?.optional_ulid("tenant_id")?,
        }),
        "services" => Ok(Command::SelectServices {
            tenant_id: filters.only(&["tenant_id"])?.optional_ulid("tenant_id")?,
        }),
        "business_hours" => Ok(Command::SelectBusinessHours {
            tenant_id: filters.only(&["tenant_id"])?.required_ulid("tenant_id")?,
        }),
        "bookings" => {
            let filters = filters.only(&["staff_id", "tenant_id", "date"])?;
            let scope = match (
                filters.optional_ulid("staff_id")?,
                filters.optional_ulid("tenant_id")?,
            ) {
                (Some(staff_id), None) => BookingScope::Staff(staff_id),
                (None, Some(tenant_id)) => BookingScope::Tenant(tenant_id),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported(
                        "bookings: filter by staff_id or tenant_id, not both".into(),
                    ));
                }
                (None, None) => return Err(SqlError::MissingFilter("staff_id or tenant_id")),
            };
            let date = filters
                .find("date", FilterOp::Eq)
                .map(parse_date)
                .transpose()?;
            Ok(Command::SelectBookings { scope, date })
        }
        "availability" => {
            let filters = filters.only(&["staff_id", "date"])?;
            Ok(Command::SelectAvailability {
                staff_id: filters.required_ulid("staff_id")?,
                date: parse_date(
                    filters
                        .find("date", FilterOp::Eq)
                        .ok_or(SqlError::MissingFilter("date"))?,
                )?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    Lt,
}

struct Filter<'a> {
    column: String,
    op: FilterOp,
    value: &'a Expr,
}

/// The conjuncts of a WHERE clause: `column = value` or `column < value`
/// joined by AND.
struct Filters<'a>(Vec<Filter<'a>>);

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut out)?;
        }
        Ok(Self(out))
    }

    /// Reject filters on any column outside `allowed`.
    fn only(self, allowed: &[&str]) -> Result<Self, SqlError> {
        if let Some(f) = self.0.iter().find(|f| !allowed.contains(&f.column.as_str())) {
            return Err(SqlError::Unsupported(format!("filter on {}", f.column)));
        }
        Ok(self)
    }

    fn find(&self, column: &str, op: FilterOp) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|f| f.column == column && f.op == op)
            .map(|f| f.value)
    }

    fn optional_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(column, FilterOp::Eq).map(parse_ulid).transpose()
    }

    fn required_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.optional_ulid(column)?
            .ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Eq => FilterOp::Eq,
                BinaryOperator::Lt => FilterOp::Lt,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(Filter {
                column,
                op,
                value: right.as_ref(),
            });
            Ok(())
        }
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

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<SlotTime, SqlError> {
    let s = parse_string(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("{e}")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_payment(expr: &Expr) -> Result<PaymentMethod, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i32_or_null(expr: &Expr) -> Result<Option<i32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64(expr)?;
    i32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing value for {1}")]
    MissingValue(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
