use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{self, SlotTime};

/// Parsed statement. Values are positional in the documented column order.
#[derive(Debug, PartialEq)]
pub enum Command {
    Book {
        id: Ulid,
        date: NaiveDate,
        start: SlotTime,
        service_id: String,
        owner_name: String,
        owner_email: String,
    },
    Modify {
        id: Ulid,
        date: NaiveDate,
        start: SlotTime,
    },
    Complete {
        id: Ulid,
    },
    Cancel {
        id: Ulid,
    },
    Enroll {
        id: Ulid,
        date: NaiveDate,
        start: SlotTime,
        service_id: String,
        waiter_name: String,
        waiter_email: String,
    },
    Withdraw {
        id: Ulid,
    },
    BlockDate {
        id: Ulid,
        date: NaiveDate,
        reason: String,
    },
    UnblockDate {
        id: Ulid,
    },
    UpsertService {
        id: String,
        name: String,
        duration_minutes: u32,
        price: u64,
        active: bool,
    },
    RetireService {
        id: String,
    },
    SelectAvailability {
        date: NaiveDate,
    },
    /// Without a date: the caller's active appointments. With one: the day agenda.
    SelectAppointments {
        date: Option<NaiveDate>,
    },
    SelectWaitlist,
    SelectOccupancy {
        year: i32,
        month: u32,
    },
    SelectBlockedDates,
    SelectServices,
}

impl Command {
    /// Statements only operators may run.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Command::Complete { .. }
                | Command::BlockDate { .. }
                | Command::UnblockDate { .. }
                | Command::UpsertService { .. }
                | Command::RetireService { .. }
                | Command::SelectAppointments { date: Some(_) }
                | Command::SelectOccupancy { .. }
        )
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
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
    let need = |n: usize, t: &'static str| {
        if values.len() < n {
            Err(SqlError::WrongArity(t, n, values.len()))
        } else {
            Ok(())
        }
    };

    match table.as_str() {
        "appointments" => {
            need(6, "appointments")?;
            Ok(Command::Book {
                id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                start: parse_time(&values[2])?,
                service_id: parse_string(&values[3])?,
                owner_name: parse_string(&values[4])?,
                owner_email: parse_string(&values[5])?,
            })
        }
        "waitlist" => {
            need(6, "waitlist")?;
            Ok(Command::Enroll {
                id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                start: parse_time(&values[2])?,
                service_id: parse_string(&values[3])?,
                waiter_name: parse_string(&values[4])?,
                waiter_email: parse_string(&values[5])?,
            })
        }
        "blocked_dates" => {
            need(2, "blocked_dates")?;
            let reason = match values.get(2) {
                Some(v) => parse_string_or_null(v)?.unwrap_or_default(),
                None => String::new(),
            };
            Ok(Command::BlockDate {
                id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                reason,
            })
        }
        "services" => {
            need(4, "services")?;
            let active = match values.get(4) {
                Some(v) => parse_bool(v)?,
                None => true,
            };
            Ok(Command::UpsertService {
                id: parse_string(&values[0])?,
                name: parse_string(&values[1])?,
                duration_minutes: parse_u32(&values[2])?,
                price: parse_u64(&values[3])?,
                active,
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
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let (mut date, mut start, mut status) = (None, None, None);
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("date") => date = Some(parse_date(&a.value)?),
            Some("start_time") => start = Some(parse_time(&a.value)?),
            Some("status") => status = Some(parse_string(&a.value)?.to_lowercase()),
            Some(other) => {
                return Err(SqlError::Unsupported(format!("cannot SET {other}")));
            }
            None => return Err(SqlError::Unsupported("complex SET target".into())),
        }
    }

    match (date, start, status.as_deref()) {
        (Some(date), Some(start), None) => Ok(Command::Modify { id, date, start }),
        (None, None, Some("completed")) => Ok(Command::Complete { id }),
        (None, None, Some(other)) => Err(SqlError::InvalidValue(format!(
            "status can only be set to 'completed', got {other:?}"
        ))),
        (None, _, None) => Err(SqlError::MissingFilter("date")),
        (_, None, None) => Err(SqlError::MissingFilter("start_time")),
        _ => Err(SqlError::Unsupported(
            "status and slot cannot change in one statement".into(),
        )),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "appointments" => Ok(Command::Cancel {
            id: extract_where_id(&delete.selection)?,
        }),
        "waitlist" => Ok(Command::Withdraw {
            id: extract_where_id(&delete.selection)?,
        }),
        "blocked_dates" => Ok(Command::UnblockDate {
            id: extract_where_id(&delete.selection)?,
        }),
        "services" => {
            let filters = eq_filters(delete.selection.as_ref())?;
            let id = filter(&filters, "id").ok_or(SqlError::MissingFilter("id"))?;
            Ok(Command::RetireService { id: parse_string(id)? })
        }
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
    let filters = eq_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            let date = filter(&filters, "date").ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectAvailability {
                date: parse_date(date)?,
            })
        }
        "appointments" => Ok(Command::SelectAppointments {
            date: filter(&filters, "date").map(parse_date).transpose()?,
        }),
        "waitlist" => Ok(Command::SelectWaitlist),
        "occupancy" => {
            let year = filter(&filters, "year").ok_or(SqlError::MissingFilter("year"))?;
            let month = filter(&filters, "month").ok_or(SqlError::MissingFilter("month"))?;
            let year = parse_i64_expr(year)?;
            Ok(Command::SelectOccupancy {
                year: i32::try_from(year)
                    .map_err(|_| SqlError::InvalidValue(format!("year {year} out of range")))?,
                month: parse_u32(month)?,
            })
        }
        "blocked_dates" => Ok(Command::SelectBlockedDates),
        "services" => Ok(Command::SelectServices),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` pairs of an AND-chain. Other predicates are rejected.
fn eq_filters(selection: Option<&Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left) {
            Some(col) => {
                out.push((col, right.as_ref()));
                Ok(())
            }
            None => Err(SqlError::Unsupported(format!("filter {expr}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter<'a>(filters: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = eq_filters(selection.as_ref())?;
    let id = filter(&filters, "id").ok_or(SqlError::MissingFilter("id"))?;
    parse_ulid(id)
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::InvalidValue("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    model::parse_date(&s)
        .ok_or_else(|| SqlError::InvalidValue(format!("malformed date {s:?}, expected YYYY-MM-DD")))
}

fn parse_time(expr: &Expr) -> Result<SlotTime, SqlError> {
    let s = parse_string(expr)?;
    SlotTime::parse(&s)
        .ok_or_else(|| SqlError::InvalidValue(format!("malformed time {s:?}, expected HH:MM")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::InvalidValue(format!("bad integer {s:?}: {e}"))),
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} must not be negative")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
    /// Well-formed SQL carrying a value the domain rejects.
    InvalidValue(String),
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
            SqlError::InvalidValue(s) => write!(f, "invalid argument: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hm(h: u32, m: u32) -> SlotTime {
        SlotTime::from_hm(h, m).unwrap()
    }

    #[test]
    fn parse_book() {
        let sql = format!(
            "INSERT INTO appointments (id, date, start_time, service_id, owner_name, owner_email) \
             VALUES ('{ID}', '2025-10-10', '14:00', 'corte', 'Ana Pérez', 'ana@example.com')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Book {
                id: Ulid::from_string(ID).unwrap(),
                date: date(2025, 10, 10),
                start: hm(14, 0),
                service_id: "corte".into(),
                owner_name: "Ana Pérez".into(),
                owner_email: "ana@example.com".into(),
            }
        );
    }

    #[test]
    fn parse_book_short_row_is_arity_error() {
        let sql = format!("INSERT INTO appointments (id, date) VALUES ('{ID}', '2025-10-10')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::WrongArity("appointments", 6, 2))
        ));
    }

    #[test]
    fn malformed_date_is_invalid_value() {
        let sql = format!(
            "INSERT INTO appointments (id, date, start_time, service_id, owner_name, owner_email) \
             VALUES ('{ID}', '10/10/2025', '14:00', 'corte', 'Ana', 'ana@example.com')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_modify() {
        let sql = format!(
            "UPDATE appointments SET date = '2025-10-11', start_time = '10:30' WHERE id = '{ID}'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Modify {
                id: Ulid::from_string(ID).unwrap(),
                date: date(2025, 10, 11),
                start: hm(10, 30),
            }
        );
    }

    #[test]
    fn parse_complete() {
        let sql = format!("UPDATE appointments SET status = 'completed' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::Complete { .. }));
        let sql = format!("UPDATE appointments SET status = 'confirmed' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn modify_needs_both_columns() {
        let sql = format!("UPDATE appointments SET date = '2025-10-11' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("start_time"))));
    }

    #[test]
    fn parse_deletes() {
        let id = Ulid::from_string(ID).unwrap();
        let cancel = parse_sql(&format!("DELETE FROM appointments WHERE id = '{ID}'")).unwrap();
        assert_eq!(cancel, Command::Cancel { id });
        let withdraw = parse_sql(&format!("DELETE FROM waitlist WHERE id = '{ID}'")).unwrap();
        assert_eq!(withdraw, Command::Withdraw { id });
        let unblock = parse_sql(&format!("DELETE FROM blocked_dates WHERE id = '{ID}'")).unwrap();
        assert_eq!(unblock, Command::UnblockDate { id });
        let retire = parse_sql("DELETE FROM services WHERE id = 'color'").unwrap();
        assert_eq!(retire, Command::RetireService { id: "color".into() });
    }

    #[test]
    fn delete_without_id_errors() {
        assert!(matches!(
            parse_sql("DELETE FROM appointments"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(parse_sql("DELETE FROM appointments WHERE date > '2025-01-01'").is_err());
    }

    #[test]
    fn parse_enroll() {
        let sql = format!(
            "INSERT INTO waitlist (id, date, start_time, service_id, waiter_name, waiter_email) \
             VALUES ('{ID}', '2025-10-10', '14:00', 'corte', 'Bea', 'bea@example.com')"
        );
        assert!(matches!(parse_sql(&sql).unwrap(), Command::Enroll { .. }));
    }

    #[test]
    fn parse_block_date_reason_optional() {
        let sql = format!("INSERT INTO blocked_dates (id, date) VALUES ('{ID}', '2025-12-24')");
        match parse_sql(&sql).unwrap() {
            Command::BlockDate { date: d, reason, .. } => {
                assert_eq!(d, date(2025, 12, 24));
                assert!(reason.is_empty());
            }
            other => panic!("expected BlockDate, got {other:?}"),
        }
    }

    #[test]
    fn parse_upsert_service() {
        let sql = "INSERT INTO services (id, name, duration_minutes, price, active) \
                   VALUES ('barba', 'Barba', 20, 1500, false)";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::UpsertService {
                id: "barba".into(),
                name: "Barba".into(),
                duration_minutes: 20,
                price: 1500,
                active: false,
            }
        );
    }

    #[test]
    fn negative_price_rejected() {
        let sql = "INSERT INTO services (id, name, duration_minutes, price) VALUES ('x', 'X', 20, -5)";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_selects() {
        assert_eq!(
            parse_sql("SELECT * FROM availability WHERE date = '2025-10-10'").unwrap(),
            Command::SelectAvailability {
                date: date(2025, 10, 10)
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM appointments").unwrap(),
            Command::SelectAppointments { date: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM appointments WHERE date = '2025-10-10'").unwrap(),
            Command::SelectAppointments {
                date: Some(date(2025, 10, 10))
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM occupancy WHERE year = 2025 AND month = 10").unwrap(),
            Command::SelectOccupancy {
                year: 2025,
                month: 10
            }
        );
        assert_eq!(parse_sql("SELECT * FROM waitlist").unwrap(), Command::SelectWaitlist);
        assert_eq!(
            parse_sql("SELECT * FROM blocked_dates").unwrap(),
            Command::SelectBlockedDates
        );
        assert_eq!(parse_sql("SELECT * FROM services").unwrap(), Command::SelectServices);
    }

    #[test]
    fn availability_requires_date() {
        assert!(matches!(
            parse_sql("SELECT * FROM availability"),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn operator_statements() {
        assert!(Command::SelectAppointments { date: Some(date(2025, 1, 1)) }.requires_operator());
        assert!(!Command::SelectAppointments { date: None }.requires_operator());
        assert!(Command::RetireService { id: "x".into() }.requires_operator());
        assert!(!Command::Cancel { id: Ulid::nil() }.requires_operator());
    }

    #[test]
    fn unknown_table_and_empty() {
        assert!(matches!(
            parse_sql(&format!("INSERT INTO foobar (id) VALUES ('{ID}')")),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
