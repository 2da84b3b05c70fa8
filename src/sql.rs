use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    ProvisionSeats {
        seats: Vec<SeatTemplate>,
    },
    SelectTemplate,
    SelectSeatMap {
        key: TripDateKey,
    },
    /// The seat map as a single JSON document.
    SelectSeatMapJson {
        key: TripDateKey,
    },
    HoldSeats {
        key: TripDateKey,
        seat_codes: Vec<String>,
        user_id: Option<String>,
        returning: bool,
    },
    ReleaseSeats {
        key: TripDateKey,
        seat_codes: Vec<String>,
        user_id: Option<String>,
    },
    ConfirmBooking {
        key: TripDateKey,
        seat_codes: Vec<String>,
        booking_code: String,
        user_id: Option<String>,
        returning: bool,
    },
    SelectHolds {
        key: TripDateKey,
    },
    SelectBooked {
        key: TripDateKey,
    },
    SelectInventory {
        key: TripDateKey,
    },
}

const TEMPLATE_COLUMNS: &[&str] = &["seat_code", "deck", "sort_order"];
const HOLD_COLUMNS: &[&str] = &["trip_id", "travel_date", "seat_code", "user_id"];
const BOOKED_COLUMNS: &[&str] = &["trip_id", "travel_date", "seat_code", "booking_code", "user_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::InvalidValue("statement too long".into()));
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "seat_templates" => {
            let rows = InsertRows::new("seat_templates", insert, TEMPLATE_COLUMNS)?;
            let mut seats = Vec::with_capacity(rows.len());
            for row in rows.iter() {
                let row = row?;
                let deck_name = parse_string(row.required("deck")?)?;
                let deck = Deck::parse(&deck_name)
                    .ok_or_else(|| SqlError::InvalidValue(format!("bad deck: {deck_name}")))?;
                seats.push(SeatTemplate {
                    code: parse_string(row.required("seat_code")?)?,
                    deck,
                    sort_order: match row.get("sort_order") {
                        Some(expr) => parse_i32(expr)?,
                        None => 0,
                    },
                });
            }
            Ok(Command::ProvisionSeats { seats })
        }
        "seat_holds" => {
            let rows = InsertRows::new("seat_holds", insert, HOLD_COLUMNS)?;
            let batch = SeatBatch::collect(&rows, false)?;
            Ok(Command::HoldSeats {
                key: batch.key,
                seat_codes: batch.seat_codes,
                user_id: batch.user_id,
                returning,
            })
        }
        "booked_seats" => {
            let rows = InsertRows::new("booked_seats", insert, BOOKED_COLUMNS)?;
            let batch = SeatBatch::collect(&rows, true)?;
            Ok(Command::ConfirmBooking {
                key: batch.key,
                seat_codes: batch.seat_codes,
                booking_code: batch.booking_code.unwrap_or_default(),
                user_id: batch.user_id,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "seat_holds" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    if filters.seat_codes.is_empty() {
        return Err(SqlError::MissingFilter("seat_code"));
    }
    Ok(Command::ReleaseSeats {
        key: filters.key()?,
        seat_codes: filters.seat_codes,
        user_id: filters.user_id,
    })
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
    if table == "seat_templates" {
        return Ok(Command::SelectTemplate);
    }

    let filters = Filters::from_selection(select.selection.as_ref())?;
    match table.as_str() {
        "seat_map" => Ok(Command::SelectSeatMap { key: filters.key()? }),
        "seat_map_json" => Ok(Command::SelectSeatMapJson { key: filters.key()? }),
        "seat_holds" => Ok(Command::SelectHolds { key: filters.key()? }),
        "booked_seats" => Ok(Command::SelectBooked { key: filters.key()? }),
        "seat_inventory" => Ok(Command::SelectInventory { key: filters.key()? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Which row layout a statement produces, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Template,
    SeatMap,
    SeatMapJson,
    Holds,
    Booked,
    Inventory,
    HoldReceipt,
    BookingReceipt,
}

impl Command {
    pub fn result_shape(&self) -> Option<ResultShape> {
        match self {
            Command::SelectTemplate => Some(ResultShape::Template),
            Command::SelectSeatMap { .. } => Some(ResultShape::SeatMap),
            Command::SelectSeatMapJson { .. } => Some(ResultShape::SeatMapJson),
            Command::SelectHolds { .. } => Some(ResultShape::Holds),
            Command::SelectBooked { .. } => Some(ResultShape::Booked),
            Command::SelectInventory { .. } => Some(ResultShape::Inventory),
            Command::HoldSeats { returning: true, .. } => Some(ResultShape::HoldReceipt),
            Command::ConfirmBooking { returning: true, .. } => Some(ResultShape::BookingReceipt),
            Command::HoldSeats { .. }
            | Command::ConfirmBooking { .. }
            | Command::ProvisionSeats { .. }
            | Command::ReleaseSeats { .. } => None,
        }
    }
}

/// Row layout of a statement that may still hold `$n` placeholders. Looks
/// only at the statement kind, table and RETURNING clause, never at values.
pub fn describe(sql: &str) -> Option<ResultShape> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            match table.as_str() {
                "seat_templates" => Some(ResultShape::Template),
                "seat_map" => Some(ResultShape::SeatMap),
                "seat_map_json" => Some(ResultShape::SeatMapJson),
                "seat_holds" => Some(ResultShape::Holds),
                "booked_seats" => Some(ResultShape::Booked),
                "seat_inventory" => Some(ResultShape::Inventory),
                _ => None,
            }
        }
        Statement::Insert(insert) if insert.returning.is_some() => {
            match insert_table_name(insert).ok()?.as_str() {
                "seat_holds" => Some(ResultShape::HoldReceipt),
                "booked_seats" => Some(ResultShape::BookingReceipt),
                _ => None,
            }
        }
        _ => None,
    }
}

// ── INSERT rows ───────────────────────────────────────────────

/// VALUES rows of an INSERT with their column names. An INSERT without a
/// column list takes as many of the table's declared columns, in order, as
/// each row has values, so trailing optional columns may be left out.
struct InsertRows<'a> {
    table: &'static str,
    columns: Vec<String>,
    /// No column list was given; `columns` is the declared order.
    positional: bool,
    rows: &'a [Vec<Expr>],
}

struct Row<'a> {
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> InsertRows<'a> {
    fn new(table: &'static str, insert: &'a ast::Insert, declared: &[&str]) -> Result<Self, SqlError> {
        let positional = insert.columns.is_empty();
        let columns: Vec<String> = if positional {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self { table, columns, positional, rows: insert_rows(insert)? })
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn iter(&self) -> impl Iterator<Item = Result<Row<'_>, SqlError>> {
        self.rows.iter().map(|values| {
            let fits = if self.positional {
                values.len() <= self.columns.len()
            } else {
                values.len() == self.columns.len()
            };
            if !fits {
                return Err(SqlError::WrongArity(self.table, self.columns.len(), values.len()));
            }
            Ok(Row { columns: &self.columns[..values.len()], values })
        })
    }
}

impl Row<'_> {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// Hold or booking rows folded into one batch. Every row must name the same
/// trip, date, user and (for bookings) booking code.
#[derive(Debug)]
struct SeatBatch {
    key: TripDateKey,
    seat_codes: Vec<String>,
    user_id: Option<String>,
    booking_code: Option<String>,
}

impl SeatBatch {
    fn collect(rows: &InsertRows<'_>, with_booking_code: bool) -> Result<Self, SqlError> {
        let mut batch: Option<SeatBatch> = None;
        for row in rows.iter() {
            let row = row?;
            let key = TripDateKey::new(
                parse_u64(row.required("trip_id")?)?,
                parse_date(row.required("travel_date")?)?,
            );
            let seat_code = parse_string(row.required("seat_code")?)?;
            let user_id = row.get("user_id").map(parse_opt_string).transpose()?.flatten();
            let booking_code = if with_booking_code {
                Some(parse_string(row.required("booking_code")?)?)
            } else {
                None
            };

            match &mut batch {
                None => {
                    batch = Some(SeatBatch { key, seat_codes: vec![seat_code], user_id, booking_code });
                }
                Some(b) => {
                    if b.key != key || b.user_id != user_id || b.booking_code != booking_code {
                        return Err(SqlError::InvalidValue(format!(
                            "all rows of one {} insert must share trip_id, travel_date{}",
                            rows.table,
                            if with_booking_code { ", booking_code and user_id" } else { " and user_id" }
                        )));
                    }
                    b.seat_codes.push(seat_code);
                }
            }
        }
        batch.ok_or_else(|| SqlError::Parse("empty VALUES".into()))
    }
}

// ── WHERE filters ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct Filters {
    trip_id: Option<TripId>,
    travel_date: Option<NaiveDate>,
    seat_codes: Vec<String>,
    user_id: Option<String>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    /// Walk an AND-tree of `col = value` and `seat_code IN (...)` terms.
    /// Columns this table does not filter on are ignored; any other shape of
    /// condition (OR, NOT IN, `<>`, ...) is rejected.
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner)?,
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                self.collect(left)?;
                self.collect(right)?;
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                match expr_column_name(left).as_deref() {
                    Some("trip_id") => self.trip_id = Some(parse_u64(right)?),
                    Some("travel_date") => self.travel_date = Some(parse_date(right)?),
                    Some("seat_code") => self.seat_codes.push(parse_string(right)?),
                    Some("user_id") => self.user_id = parse_opt_string(right)?,
                    _ => {}
                }
            }
            Expr::InList { expr, list, negated: false } => {
                if expr_column_name(expr).as_deref() == Some("seat_code") {
                    for item in list {
                        self.seat_codes.push(parse_string(item)?);
                    }
                }
            }
            other => {
                return Err(SqlError::Unsupported(format!("WHERE condition: {other}")));
            }
        }
        Ok(())
    }

    fn key(&self) -> Result<TripDateKey, SqlError> {
        Ok(TripDateKey::new(
            self.trip_id.ok_or(SqlError::MissingFilter("trip_id"))?,
            self.travel_date.ok_or(SqlError::MissingFilter("travel_date"))?,
        ))
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

fn insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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

fn expect_value(expr: &Expr) -> Result<&Value, SqlError> {
    extract_value(expr).ok_or_else(|| SqlError::Parse(format!("expected value, got {expr}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64(expr)?);
    }
    match expect_value(expr)? {
        Value::Number(s, _) | Value::SingleQuotedString(s) => s
            .trim()
            .parse()
            .map_err(|_| SqlError::InvalidValue(format!("expected integer, got {s:?}"))),
        other => Err(SqlError::InvalidValue(format!("expected integer, got {other}"))),
    }
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} is negative")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of i32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match expect_value(expr)? {
        Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(s.clone()),
        other => Err(SqlError::InvalidValue(format!("expected string, got {other}"))),
    }
}

fn parse_opt_string(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expect_value(expr)? {
        Value::Null => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let raw = parse_string(expr)?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::InvalidValue(format!("bad date {raw:?}, expected YYYY-MM-DD")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the table cannot accept.
    InvalidValue(String),
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
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn key7() -> TripDateKey {
        TripDateKey::new(7, NaiveDate::from_ymd_opt(2025, 12, 1).unwrap())
    }

    #[test]
    fn parse_provision_template() {
        let sql = "INSERT INTO seat_templates (seat_code, deck, sort_order) VALUES ('A1', 'LOWER', 1), ('B1', 'upper', 2)";
        match parse_sql(sql).unwrap() {
            Command::ProvisionSeats { seats } => {
                assert_eq!(seats.len(), 2);
                assert_eq!(seats[0], SeatTemplate { code: "A1".into(), deck: Deck::Lower, sort_order: 1 });
                assert_eq!(seats[1].deck, Deck::Upper);
            }
            other => panic!("expected ProvisionSeats, got {other:?}"),
        }
    }

    #[test]
    fn provision_rejects_unknown_deck() {
        let sql = "INSERT INTO seat_templates VALUES ('A1', 'ROOF', 1)";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn parse_hold_batch() {
        let sql = "INSERT INTO seat_holds (trip_id, travel_date, seat_code, user_id) \
                   VALUES (7, '2025-12-01', 'a1', 'u1'), (7, '2025-12-01', 'A2', 'u1') RETURNING *";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::HoldSeats {
                key: key7(),
                seat_codes: vec!["a1".into(), "A2".into()],
                user_id: Some("u1".into()),
                returning: true,
            }
        );
    }

    #[test]
    fn hold_without_column_list_uses_declared_order() {
        let sql = "INSERT INTO seat_holds VALUES (7, '2025-12-01', 'A1')";
        match parse_sql(sql).unwrap() {
            Command::HoldSeats { key, seat_codes, user_id, returning } => {
                assert_eq!(key, key7());
                assert_eq!(seat_codes, vec!["A1".to_string()]);
                assert_eq!(user_id, None);
                assert!(!returning);
            }
            other => panic!("expected HoldSeats, got {other:?}"),
        }
    }

    #[test]
    fn hold_rows_must_share_key() {
        let sql = "INSERT INTO seat_holds (trip_id, travel_date, seat_code) \
                   VALUES (7, '2025-12-01', 'A1'), (8, '2025-12-01', 'A2')";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn hold_rejects_bad_date() {
        let sql = "INSERT INTO seat_holds (trip_id, travel_date, seat_code) VALUES (7, '01/12/2025', 'A1')";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn hold_rejects_arity_mismatch() {
        let sql = "INSERT INTO seat_holds (trip_id, travel_date, seat_code) VALUES (7, '2025-12-01')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity("seat_holds", 3, 2))));
    }

    #[test]
    fn hold_rejects_unknown_column() {
        let sql = "INSERT INTO seat_holds (trip_id, travel_date, seat_code, colour) VALUES (7, '2025-12-01', 'A1', 'red')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn(c)) if c == "colour"));
    }

    #[test]
    fn parse_confirm_batch() {
        let sql = "INSERT INTO booked_seats (trip_id, travel_date, seat_code, booking_code) \
                   VALUES (7, '2025-12-01', 'A1', 'BK1'), (7, '2025-12-01', 'A2', 'BK1')";
        match parse_sql(sql).unwrap() {
            Command::ConfirmBooking { key, seat_codes, booking_code, user_id, returning } => {
                assert_eq!(key, key7());
                assert_eq!(seat_codes.len(), 2);
                assert_eq!(booking_code, "BK1");
                assert_eq!(user_id, None);
                assert!(!returning);
            }
            other => panic!("expected ConfirmBooking, got {other:?}"),
        }
    }

    #[test]
    fn confirm_rows_must_share_booking_code() {
        let sql = "INSERT INTO booked_seats (trip_id, travel_date, seat_code, booking_code) \
                   VALUES (7, '2025-12-01', 'A1', 'BK1'), (7, '2025-12-01', 'A2', 'BK2')";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn confirm_requires_booking_code_column() {
        let sql = "INSERT INTO booked_seats (trip_id, travel_date, seat_code) VALUES (7, '2025-12-01', 'A1')";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingColumn("booking_code"))));
    }

    #[test]
    fn parse_release_with_in_list() {
        let sql = "DELETE FROM seat_holds WHERE trip_id = 7 AND travel_date = '2025-12-01' \
                   AND seat_code IN ('A1', 'A2') AND user_id = 'u1'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::ReleaseSeats {
                key: key7(),
                seat_codes: vec!["A1".into(), "A2".into()],
                user_id: Some("u1".into()),
            }
        );
    }

    #[test]
    fn release_needs_seat_filter() {
        let sql = "DELETE FROM seat_holds WHERE trip_id = 7 AND travel_date = '2025-12-01'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("seat_code"))));
    }

    #[test]
    fn parse_seat_map_selects() {
        let sql = "SELECT * FROM seat_map WHERE trip_id = 7 AND travel_date = '2025-12-01'";
        assert_eq!(parse_sql(sql).unwrap(), Command::SelectSeatMap { key: key7() });

        let sql = "SELECT * FROM seat_map_json WHERE (trip_id = '7') AND travel_date = '2025-12-01'";
        assert_eq!(parse_sql(sql).unwrap(), Command::SelectSeatMapJson { key: key7() });
    }

    #[test]
    fn seat_map_without_date_is_missing_filter() {
        let sql = "SELECT * FROM seat_map WHERE trip_id = 7";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("travel_date"))));
    }

    #[test]
    fn parse_listing_selects() {
        let wh = "WHERE trip_id = 7 AND travel_date = '2025-12-01'";
        assert_eq!(
            parse_sql(&format!("SELECT * FROM seat_holds {wh}")).unwrap(),
            Command::SelectHolds { key: key7() }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM booked_seats {wh}")).unwrap(),
            Command::SelectBooked { key: key7() }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM seat_inventory {wh}")).unwrap(),
            Command::SelectInventory { key: key7() }
        );
        assert_eq!(parse_sql("SELECT * FROM seat_templates").unwrap(), Command::SelectTemplate);
    }

    #[test]
    fn negative_trip_id_rejected() {
        let sql = "SELECT * FROM seat_map WHERE trip_id = -1 AND travel_date = '2025-12-01'";
        assert!(matches!(parse_sql(sql), Err(SqlError::InvalidValue(_))));
    }

    #[test]
    fn unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM trips WHERE trip_id = 1"),
            Err(SqlError::UnknownTable(t)) if t == "trips"
        ));
    }

    #[test]
    fn syntax_error_is_parse_error() {
        assert!(matches!(parse_sql("SELEKT nope"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn describe_sees_through_placeholders() {
        assert_eq!(
            describe("SELECT * FROM seat_map WHERE trip_id = $1 AND travel_date = $2"),
            Some(ResultShape::SeatMap)
        );
        assert_eq!(
            describe("INSERT INTO seat_holds (trip_id, travel_date, seat_code) VALUES ($1, $2, $3) RETURNING *"),
            Some(ResultShape::HoldReceipt)
        );
        assert_eq!(
            describe("INSERT INTO seat_holds (trip_id, travel_date, seat_code) VALUES ($1, $2, $3)"),
            None
        );
        assert_eq!(describe("DELETE FROM seat_holds WHERE seat_code = $1"), None);
    }

    #[test]
    fn command_shape_matches_describe() {
        let sql = "INSERT INTO booked_seats (trip_id, travel_date, seat_code, booking_code) \
                   VALUES (7, '2025-12-01', 'A1', 'BK1') RETURNING *";
        assert_eq!(parse_sql(sql).unwrap().result_shape(), describe(sql));
        assert_eq!(describe(sql), Some(ResultShape::BookingReceipt));
    }

    #[test]
    fn booking_without_column_list_may_omit_user() {
        let sql = "INSERT INTO booked_seats VALUES (7, '2025-12-01', 'A1', 'BK1')";
        match parse_sql(sql).unwrap() {
            Command::ConfirmBooking { booking_code, user_id, .. } => {
                assert_eq!(booking_code, "BK1");
                assert_eq!(user_id, None);
            }
            other => panic!("expected ConfirmBooking, got {other:?}"),
        }
        let sql = "INSERT INTO booked_seats VALUES (7, '2025-12-01', 'A1', 'BK1', 'u1')";
        match parse_sql(sql).unwrap() {
            Command::ConfirmBooking { user_id, .. } => assert_eq!(user_id.as_deref(), Some("u1")),
            other => panic!("expected ConfirmBooking, got {other:?}"),
        }
    }

    #[test]
    fn positional_insert_with_too_many_values_errors() {
        let sql = "INSERT INTO seat_holds VALUES (7, '2025-12-01', 'A1', 'u1', 'extra')";
        assert_eq!(parse_sql(sql), Err(SqlError::WrongArity("seat_holds", 4, 5)));
    }

    #[test]
    fn positional_insert_missing_required_column_errors() {
        let sql = "INSERT INTO seat_holds VALUES (7, '2025-12-01')";
        assert_eq!(parse_sql(sql), Err(SqlError::MissingColumn("seat_code")));
    }

    #[test]
    fn unsupported_where_shapes_are_rejected() {
        for sql in [
            "DELETE FROM seat_holds WHERE trip_id = 7 AND travel_date = '2025-12-01' \
             AND seat_code IN ('A1') AND seat_code NOT IN ('A1')",
            "DELETE FROM seat_holds WHERE trip_id = 7 AND travel_date = '2025-12-01' \
             AND (seat_code = 'A1' OR seat_code = 'A2')",
            "SELECT * FROM seat_map WHERE trip_id = 7 AND travel_date <> '2025-12-01'",
        ] {
            assert!(
                matches!(parse_sql(sql), Err(SqlError::Unsupported(_))),
                "{sql}"
            );
        }
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
