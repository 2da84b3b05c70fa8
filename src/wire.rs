use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ResultShape, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SeatlockFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SeatlockHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SeatlockQueryParser>,
}

impl SeatlockHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SeatlockQueryParser),
        }
    }

    /// The database name picks the tenant.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn execute(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::ProvisionSeats { seats } => {
            let n = engine.provision_seats(seats).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(n)))
        }
        Command::SelectTemplate => {
            let schema = Arc::new(template_schema());
            let rows: Vec<PgWireResult<_>> = engine
                .template()
                .await
                .into_iter()
                .map(|seat| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&seat.code)?;
                    encoder.encode_field(&seat.deck.as_str())?;
                    encoder.encode_field(&seat.sort_order)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectSeatMap { key } => {
            let map = engine.seat_map(key).await.map_err(engine_err)?;
            let schema = Arc::new(seat_map_schema());
            let trip_id = trip_id_i64(map.trip_id)?;
            let date = map.date.to_string();
            let total = map.total_seats as i64;
            let hold_minutes = map.hold_minutes as i32;
            let rows: Vec<PgWireResult<_>> = map
                .decks
                .iter()
                .map(|(deck, seat)| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&trip_id)?;
                    encoder.encode_field(&date)?;
                    encoder.encode_field(&deck.as_str())?;
                    encoder.encode_field(&seat.code)?;
                    encoder.encode_field(&seat.status.as_str())?;
                    encoder.encode_field(&seat.sort_order)?;
                    encoder.encode_field(&total)?;
                    encoder.encode_field(&hold_minutes)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectSeatMapJson { key } => {
            let map = engine.seat_map(key).await.map_err(engine_err)?;
            let json = serde_json::to_string(&map)
                .map_err(|e| user_error("XX000", format!("seat map encoding failed: {e}")))?;
            let schema = Arc::new(vec![field("seat_map", Type::TEXT)]);
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&json)?;
            let rows = vec![Ok(encoder.take_row())];
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::HoldSeats {
            key,
            seat_codes,
            user_id,
            returning,
        } => {
            let receipt = engine
                .hold_seats(key, &seat_codes, user_id)
                .await
                .map_err(engine_err)?;
            if !returning {
                return Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(receipt.seat_codes.len()),
                ));
            }
            let schema = Arc::new(hold_receipt_schema());
            let trip_id = trip_id_i64(receipt.trip_id)?;
            let date = receipt.date.to_string();
            let hold_minutes = receipt.hold_minutes as i32;
            let rows: Vec<PgWireResult<_>> = receipt
                .seat_codes
                .iter()
                .map(|code| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&trip_id)?;
                    encoder.encode_field(&date)?;
                    encoder.encode_field(code)?;
                    encoder.encode_field(&receipt.user_id)?;
                    encoder.encode_field(&receipt.expires_at)?;
                    encoder.encode_field(&hold_minutes)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::ReleaseSeats {
            key,
            seat_codes,
            user_id,
        } => {
            let released = engine
                .release_seats(key, &seat_codes, user_id)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(released.len())))
        }
        Command::ConfirmBooking {
            key,
            seat_codes,
            booking_code,
            user_id,
            returning,
        } => {
            let receipt = engine
                .confirm_booking(key, &seat_codes, &booking_code, user_id)
                .await
                .map_err(engine_err)?;
            if !returning {
                return Ok(Response::Execution(
                    Tag::new("INSERT").with_rows(receipt.seat_codes.len()),
                ));
            }
            let schema = Arc::new(booking_receipt_schema());
            let trip_id = trip_id_i64(receipt.trip_id)?;
            let date = receipt.date.to_string();
            let rows: Vec<PgWireResult<_>> = receipt
                .seat_codes
                .iter()
                .map(|code| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&trip_id)?;
                    encoder.encode_field(&date)?;
                    encoder.encode_field(code)?;
                    encoder.encode_field(&receipt.booking_code)?;
                    encoder.encode_field(&receipt.user_id)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectHolds { key } => {
            let schema = Arc::new(holds_schema());
            let trip_id = trip_id_i64(key.trip_id)?;
            let date = key.travel_date.to_string();
            let rows: Vec<PgWireResult<_>> = engine
                .holds(key)
                .await
                .into_iter()
                .map(|hold| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&hold.id.to_string())?;
                    encoder.encode_field(&trip_id)?;
                    encoder.encode_field(&date)?;
                    encoder.encode_field(&hold.seat_code)?;
                    encoder.encode_field(&hold.user_id)?;
                    encoder.encode_field(&hold.expires_at)?;
                    encoder.encode_field(&hold.status.as_str())?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectBooked { key } => {
            let schema = Arc::new(booked_schema());
            let trip_id = trip_id_i64(key.trip_id)?;
            let date = key.travel_date.to_string();
            let rows: Vec<PgWireResult<_>> = engine
                .booked_seats(key)
                .await
                .into_iter()
                .map(|seat| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&trip_id)?;
                    encoder.encode_field(&date)?;
                    encoder.encode_field(&seat.seat_code)?;
                    encoder.encode_field(&seat.booking_code)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectInventory { key } => {
            let schema = Arc::new(inventory_schema());
            let trip_id = trip_id_i64(key.trip_id)?;
            let date = key.travel_date.to_string();
            let rows: Vec<PgWireResult<_>> = engine
                .inventory(key)
                .await
                .into_iter()
                .map(|counter| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&trip_id)?;
                    encoder.encode_field(&date)?;
                    encoder.encode_field(&(counter.reserved_seats as i64))?;
                    encoder.encode_field(&(counter.locked_seats as i64))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
    }
}

fn trip_id_i64(trip_id: TripId) -> PgWireResult<i64> {
    i64::try_from(trip_id).map_err(|_| user_error("22003", format!("trip_id {trip_id} out of range")))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn template_schema() -> Vec<FieldInfo> {
    vec![
        field("seat_code", Type::VARCHAR),
        field("deck", Type::VARCHAR),
        field("sort_order", Type::INT4),
    ]
}

fn seat_map_schema() -> Vec<FieldInfo> {
    vec![
        field("trip_id", Type::INT8),
        field("travel_date", Type::VARCHAR),
        field("deck", Type::VARCHAR),
        field("seat_code", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("sort_order", Type::INT4),
        field("total_seats", Type::INT8),
        field("hold_minutes", Type::INT4),
    ]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        field("hold_id", Type::VARCHAR),
        field("trip_id", Type::INT8),
        field("travel_date", Type::VARCHAR),
        field("seat_code", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("expires_at", Type::INT8),
        field("status", Type::VARCHAR),
    ]
}

fn hold_receipt_schema() -> Vec<FieldInfo> {
    vec![
        field("trip_id", Type::INT8),
        field("travel_date", Type::VARCHAR),
        field("seat_code", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("expires_at", Type::INT8),
        field("hold_minutes", Type::INT4),
    ]
}

fn booked_schema() -> Vec<FieldInfo> {
    vec![
        field("trip_id", Type::INT8),
        field("travel_date", Type::VARCHAR),
        field("seat_code", Type::VARCHAR),
        field("booking_code", Type::VARCHAR),
    ]
}

fn booking_receipt_schema() -> Vec<FieldInfo> {
    let mut schema = booked_schema();
    schema.push(field("user_id", Type::VARCHAR));
    schema
}

fn inventory_schema() -> Vec<FieldInfo> {
    vec![
        field("trip_id", Type::INT8),
        field("travel_date", Type::VARCHAR),
        field("reserved_seats", Type::INT8),
        field("locked_seats", Type::INT8),
    ]
}

fn schema_for(shape: Option<ResultShape>) -> Vec<FieldInfo> {
    match shape {
        Some(ResultShape::Template) => template_schema(),
        Some(ResultShape::SeatMap) => seat_map_schema(),
        Some(ResultShape::SeatMapJson) => vec![field("seat_map", Type::TEXT)],
        Some(ResultShape::Holds) => holds_schema(),
        Some(ResultShape::Booked) => booked_schema(),
        Some(ResultShape::Inventory) => inventory_schema(),
        Some(ResultShape::HoldReceipt) => hold_receipt_schema(),
        Some(ResultShape::BookingReceipt) => booking_receipt_schema(),
        None => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SeatlockHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SeatlockQueryParser;

#[async_trait]
impl QueryParser for SeatlockQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(sql::describe(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SeatlockHandler {
    type Statement = String;
    type QueryParser = SeatlockQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute(&engine, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        let fields = schema_for(sql::describe(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, fields))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let fields = schema_for(sql::describe(&target.statement.statement));
        Ok(DescribePortalResponse::new(fields))
    }
}

enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` into literal text and `$N` placeholders. Placeholders inside
/// quoted strings or identifiers stay text.
fn scan_params(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut i = 0;
    let mut text_start = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    pieces.push(Piece::Text(&sql[text_start..i]));
                    pieces.push(Piece::Param(n));
                    i = end;
                    text_start = end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    pieces.push(Piece::Text(&sql[text_start..]));
    pieces
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    scan_params(sql)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Replace `$1, $2, ...` with the bound values as quoted literals. Values
/// are taken as text; a missing or NULL parameter becomes `NULL`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    for piece in scan_params(sql) {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Param(n) => match n.checked_sub(1).and_then(|i| params.get(i)) {
                Some(Some(bytes)) => {
                    let text = String::from_utf8_lossy(bytes.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                _ => out.push_str("NULL"),
            },
        }
    }
    out
}

// ── Auth + factory ───────────────────────────────────────────────

/// One shared password for every user and tenant.
#[derive(Debug)]
pub struct SeatlockAuthSource {
    password: String,
}

#[async_trait]
impl AuthSource for SeatlockAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct SeatlockFactory {
    handler: Arc<SeatlockHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SeatlockAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SeatlockFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SeatlockHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SeatlockAuthSource { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SeatlockFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInput(_)
        | EngineError::UnknownSeats(_)
        | EngineError::LimitExceeded(_) => "22023",
        EngineError::AlreadyBooked(_)
        | EngineError::AlreadyHeld(_)
        | EngineError::AlreadyExists(_) => "23505",
        EngineError::HoldMissing { .. } => "55000",
        EngineError::LockTimeout(_) => "55P03",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::Parse(_) | SqlError::Empty | SqlError::Unsupported(_) => "42601",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_)
        | SqlError::WrongArity(..)
        | SqlError::MissingColumn(_)
        | SqlError::MissingFilter(_)
        | SqlError::InvalidValue(_) => "22023",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_inside_quotes_are_left_alone() {
        let sql = "SELECT * FROM seat_map WHERE trip_id = $1 AND travel_date = '$2'";
        assert_eq!(count_params(sql), 1);
        let out = substitute_params(sql, &[Some(b"7".to_vec())]);
        assert_eq!(out, "SELECT * FROM seat_map WHERE trip_id = '7' AND travel_date = '$2'");
    }

    #[test]
    fn ten_params_do_not_clobber_each_other() {
        let sql = "VALUES ($1, $10)";
        let params: Vec<Option<Vec<u8>>> =
            (1..=10).map(|i| Some(format!("v{i}").into_bytes())).collect();
        assert_eq!(count_params(sql), 10);
        assert_eq!(substitute_params(sql, &params), "VALUES ('v1', 'v10')");
    }

    #[test]
    fn substituted_values_are_escaped() {
        let out = substitute_params("VALUES ($1, $2)", &[Some(b"O'Brien".to_vec()), None]);
        assert_eq!(out, "VALUES ('O''Brien', NULL)");
    }

    #[test]
    fn sqlstate_per_failure_class() {
        assert_eq!(engine_sqlstate(&EngineError::AlreadyHeld(vec!["A1".into()])), "23505");
        assert_eq!(
            engine_sqlstate(&EngineError::HoldMissing { held: vec![], requested: vec![] }),
            "55000"
        );
        assert_eq!(engine_sqlstate(&EngineError::InvalidInput("x".into())), "22023");
        assert_eq!(sql_sqlstate(&SqlError::MissingFilter("travel_date")), "22023");
        assert_eq!(sql_sqlstate(&SqlError::UnknownTable("buses".into())), "42P01");
    }

    #[test]
    fn describe_schema_for_returning_insert() {
        let fields = schema_for(sql::describe(
            "INSERT INTO seat_holds (trip_id, travel_date, seat_code) VALUES ($1, $2, $3) RETURNING *",
        ));
        let names: Vec<_> = fields.iter().map(|f| f.name().to_string()).collect();
        assert_eq!(
            names,
            ["trip_id", "travel_date", "seat_code", "user_id", "expires_at", "hold_minutes"]
        );
    }
}
