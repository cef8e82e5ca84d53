use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use tracing::debug;

use crate::auth::{ChairbookAuthSource, Roles};
use crate::engine::{DayOccupancy, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::shop::ShopRegistry;
use crate::sql::{self, Command, SqlError};

/// Who is running a statement: the login user and the role it maps to.
struct Caller {
    id: String,
    actor: Actor,
}

pub struct ChairbookHandler {
    registry: Arc<ShopRegistry>,
    roles: Arc<Roles>,
    query_parser: Arc<ChairbookQueryParser>,
}

impl ChairbookHandler {
    pub fn new(registry: Arc<ShopRegistry>, roles: Arc<Roles>) -> Self {
        Self {
            registry,
            roles,
            query_parser: Arc::new(ChairbookQueryParser),
        }
    }

    async fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let shop = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.registry.get_or_create(&shop).await.map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("shop error: {e}"),
            )))
        })
    }

    fn caller<C: ClientInfo>(&self, client: &C) -> Caller {
        let id = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_default();
        let actor = self.roles.actor_for(&id);
        Caller { id, actor }
    }

    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client).await?;
        let caller = self.caller(client);
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, &caller, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        caller: &Caller,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        if cmd.requires_operator() && caller.actor != Actor::Operator {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            debug!(user = %caller.id, command = observability::command_label(&cmd), "operator statement refused");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "42501".into(),
                format!(
                    "forbidden: {} requires the operator role",
                    observability::command_label(&cmd)
                ),
            ))));
        }

        match cmd {
            Command::Book {
                id,
                date,
                start,
                service_id,
                owner_name,
                owner_email,
            } => {
                let owner = Owner::new(caller.id.clone(), owner_name, owner_email);
                engine
                    .book(id, &owner, Slot::new(date, start), &service_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::Modify { id, date, start } => {
                engine
                    .modify(id, &caller.id, Slot::new(date, start))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::Complete { id } => {
                engine.complete(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::Cancel { id } => {
                engine
                    .cancel(id, &caller.id, caller.actor)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::Enroll {
                id,
                date,
                start,
                service_id,
                waiter_name,
                waiter_email,
            } => {
                let waiter = Owner::new(caller.id.clone(), waiter_name, waiter_email);
                engine
                    .enroll(id, &waiter, Slot::new(date, start), &service_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::Withdraw { id } => {
                engine.withdraw(id, &caller.id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::BlockDate { id, date, reason } => {
                engine
                    .block_date(id, date, &reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UnblockDate { id } => {
                engine.unblock_date(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::UpsertService {
                id,
                name,
                duration_minutes,
                price,
                active,
            } => {
                let service = Service {
                    id,
                    name,
                    duration_minutes,
                    price,
                    active,
                };
                engine.upsert_service(service).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::RetireService { id } => {
                engine.retire_service(&id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectAvailability { date } => {
                let schema = Arc::new(availability_schema());
                let day = date.format(DATE_FORMAT).to_string();
                let rows: Vec<PgWireResult<_>> = engine
                    .list_available_slots(date)
                    .into_iter()
                    .map(|start| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&start.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAppointments { date } => {
                let appointments = match date {
                    Some(date) => engine.list_day(date),
                    None => engine.list_active_appointments(&caller.id),
                };
                let schema = Arc::new(appointments_schema());
                let rows: Vec<PgWireResult<_>> = appointments
                    .iter()
                    .map(|a| encode_appointment(&schema, a))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectWaitlist => {
                let schema = Arc::new(waitlist_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_waitlist(&caller.id)
                    .iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&w.slot.date.format(DATE_FORMAT).to_string())?;
                        encoder.encode_field(&w.slot.start.to_string())?;
                        encoder.encode_field(&w.service_id)?;
                        encoder.encode_field(&w.notified)?;
                        encoder.encode_field(&w.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectOccupancy { year, month } => {
                let days = engine.month_occupancy(year, month).map_err(engine_err)?;
                let schema = Arc::new(occupancy_schema());
                let rows: Vec<PgWireResult<_>> = days
                    .iter()
                    .map(|d: &DayOccupancy| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&d.date.format(DATE_FORMAT).to_string())?;
                        encoder.encode_field(&(d.booked as i32))?;
                        encoder.encode_field(&(d.capacity as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBlockedDates => {
                let schema = Arc::new(blocked_dates_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_blocked_dates()
                    .iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.date.format(DATE_FORMAT).to_string())?;
                        encoder.encode_field(&b.reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectServices => {
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_services()
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id)?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&(s.duration_minutes as i32))?;
                        encoder.encode_field(&(s.price as i64))?;
                        encoder.encode_field(&s.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

fn query_response(
    schema: Arc<Vec<FieldInfo>>,
    rows: Vec<PgWireResult<pgwire::messages::data::DataRow>>,
) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_appointment(
    schema: &Arc<Vec<FieldInfo>>,
    a: &Appointment,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.slot.date.format(DATE_FORMAT).to_string())?;
    encoder.encode_field(&a.slot.start.to_string())?;
    encoder.encode_field(&a.service.service_id)?;
    encoder.encode_field(&a.service.name)?;
    encoder.encode_field(&(a.service.duration_minutes as i32))?;
    encoder.encode_field(&(a.service.price as i64))?;
    encoder.encode_field(&a.status.as_str().to_string())?;
    encoder.encode_field(&a.owner_id)?;
    encoder.encode_field(&a.owner_name)?;
    encoder.encode_field(&(a.modification_count as i32))?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("date"), text("start_time")]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("date"),
        text("start_time"),
        text("service_id"),
        text("service_name"),
        typed("duration_minutes", Type::INT4),
        typed("price", Type::INT8),
        text("status"),
        text("owner_id"),
        text("owner_name"),
        typed("modification_count", Type::INT4),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("date"),
        text("start_time"),
        text("service_id"),
        typed("notified", Type::BOOL),
        typed("created_at", Type::INT8),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        text("date"),
        typed("booked", Type::INT4),
        typed("capacity", Type::INT4),
    ]
}

fn blocked_dates_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("date"), text("reason")]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        typed("duration_minutes", Type::INT4),
        typed("price", Type::INT8),
        typed("active", Type::BOOL),
    ]
}

/// Row shape of a statement, judged from its text so `$n` placeholders need no binding.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    let mut tokens = upper.split_whitespace();
    if tokens.next() != Some("SELECT") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "FROM")
        .nth(1)
        .map(|t| t.trim_end_matches(';').to_string());
    match table.as_deref() {
        Some("AVAILABILITY") => availability_schema(),
        Some("APPOINTMENTS") => appointments_schema(),
        Some("WAITLIST") => waitlist_schema(),
        Some("OCCUPANCY") => occupancy_schema(),
        Some("BLOCKED_DATES") => blocked_dates_schema(),
        Some("SERVICES") => services_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ChairbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChairbookQueryParser;

#[async_trait]
impl QueryParser for ChairbookQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ChairbookHandler {
    type Statement = String;
    type QueryParser = ChairbookQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        responses
            .pop()
            .ok_or_else(|| PgWireError::ApiError("statement produced no response".into()))
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so `$1` never eats `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChairbookFactory {
    handler: Arc<ChairbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ChairbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ChairbookFactory {
    pub fn new(registry: Arc<ShopRegistry>, roles: Arc<Roles>, password: String) -> Self {
        Self {
            handler: Arc::new(ChairbookHandler::new(registry, roles)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ChairbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChairbookFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    registry: Arc<ShopRegistry>,
    roles: Arc<Roles>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ChairbookFactory::new(registry, roles, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        format!("{}: {e}", e.kind()),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let (code, message) = match &e {
        SqlError::InvalidValue(_) => ("22023", e.to_string()),
        _ => ("42601", format!("syntax: {e}")),
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}
