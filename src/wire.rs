use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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

use crate::auth::{AgendaAuthSource, Caller, StaffDirectory};
use crate::engine::{format_instant, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, AppointmentFilter, Command, ResultShape};
use crate::tenant::TenantManager;

pub struct AgendaHandler {
    tenant_manager: Arc<TenantManager>,
    staff: Arc<StaffDirectory>,
    query_parser: Arc<AgendaQueryParser>,
}

impl AgendaHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, staff: Arc<StaffDirectory>) -> Self {
        Self {
            tenant_manager,
            staff,
            query_parser: Arc::new(AgendaQueryParser),
        }
    }

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

    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        match client.metadata().get("user") {
            Some(user) if !user.is_empty() => Ok(self.staff.caller(user)),
            _ => Err(user_error("28000", "connection has no user name".into())),
        }
    }

    /// Parse, execute and record one statement.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let caller = self.resolve_caller(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

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
    ) -> PgWireResult<Response> {
        let offset = engine.offset();
        match cmd {
            Command::UpsertService {
                id,
                name,
                duration_min,
                price_cents,
                active,
            } => {
                require_staff(caller, "manage services")?;
                engine
                    .upsert_service(id, name, duration_min, price_cents, active)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpsertProfessional { id, name, specialty } => {
                require_staff(caller, "manage professionals")?;
                engine
                    .upsert_professional(id, name, specialty)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetBusinessHours { weekday, hours } => {
                require_staff(caller, "manage business hours")?;
                engine
                    .set_business_hours(weekday, hours)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertAppointment {
                service_id,
                professional_id,
                start,
            } => {
                let info = engine
                    .create_appointment(&caller.client_id, service_id, professional_id, &start)
                    .await
                    .map_err(engine_err)?;
                Ok(appointment_rows(vec![info], offset))
            }
            Command::DeleteAppointment { id } => {
                // Staff cancel through the lifecycle; clients must own the appointment.
                let info = if caller.is_staff() {
                    engine
                        .set_status(id, AppointmentStatus::Cancelled.as_str())
                        .await
                } else {
                    engine.cancel_appointment(id, &caller.client_id).await
                }
                .map_err(engine_err)?;
                Ok(appointment_rows(vec![info], offset))
            }
            Command::SetAppointmentStatus { id, status } => {
                require_staff(caller, "change appointment status")?;
                let info = engine.set_status(id, &status).await.map_err(engine_err)?;
                Ok(appointment_rows(vec![info], offset))
            }
            Command::SelectSlots {
                date,
                service_id,
                professional_id,
            } => {
                let slots = engine
                    .list_slots(date, service_id, professional_id)
                    .await
                    .map_err(engine_err)?;
                Ok(slot_rows(&date.to_string(), slots))
            }
            Command::SelectAppointments { filter } => {
                let infos = match filter {
                    AppointmentFilter::Id(id) => {
                        let info = engine.get_appointment(id).await.map_err(engine_err)?;
                        if !caller.is_staff() && info.client_id != caller.client_id {
                            return Err(engine_err(EngineError::Forbidden(format!(
                                "appointment {id} belongs to another client"
                            ))));
                        }
                        vec![info]
                    }
                    AppointmentFilter::Client(client_id) => {
                        if !caller.is_staff() && client_id != caller.client_id {
                            return Err(engine_err(EngineError::Forbidden(
                                "clients may only list their own appointments".into(),
                            )));
                        }
                        engine
                            .list_client_appointments(&client_id)
                            .await
                            .map_err(engine_err)?
                    }
                    AppointmentFilter::All if caller.is_staff() => {
                        engine.list_appointments().await.map_err(engine_err)?
                    }
                    AppointmentFilter::All => engine
                        .list_client_appointments(&caller.client_id)
                        .await
                        .map_err(engine_err)?,
                };
                Ok(appointment_rows(infos, offset))
            }
            Command::SelectServices => {
                let services = engine.list_services(caller.is_staff());
                Ok(service_rows(services))
            }
            Command::SelectProfessionals => {
                Ok(professional_rows(engine.list_professionals()))
            }
            Command::SelectBusinessHours => {
                Ok(business_hours_rows(engine.business_hours()))
            }
        }
    }
}

fn require_staff(caller: &Caller, action: &str) -> PgWireResult<()> {
    if caller.is_staff() {
        return Ok(());
    }
    Err(engine_err(EngineError::Forbidden(format!(
        "only staff may {action}"
    ))))
}

// ── Row shapes ───────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("client_id", Type::VARCHAR),
        text_field("service_id", Type::VARCHAR),
        text_field("service_name", Type::VARCHAR),
        text_field("duration", Type::INT4),
        text_field("price", Type::INT8),
        text_field("professional_id", Type::VARCHAR),
        text_field("professional_name", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::INT8),
        text_field("updated_at", Type::INT8),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
    ]
}

fn service_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("duration", Type::INT4),
        text_field("price", Type::INT8),
        text_field("active", Type::BOOL),
    ]
}

fn professional_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("specialty", Type::VARCHAR),
    ]
}

fn business_hours_schema() -> Vec<FieldInfo> {
    vec![
        text_field("weekday", Type::VARCHAR),
        text_field("open", Type::BOOL),
        text_field("opens_at", Type::VARCHAR),
        text_field("closes_at", Type::VARCHAR),
    ]
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Appointments => appointment_schema(),
        ResultShape::Slots => slot_schema(),
        ResultShape::Services => service_schema(),
        ResultShape::Professionals => professional_schema(),
        ResultShape::BusinessHours => business_hours_schema(),
        ResultShape::Empty => vec![],
    }
}

fn appointment_rows(infos: Vec<AppointmentInfo>, offset: chrono::FixedOffset) -> Response {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = infos
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.client_id)?;
            encoder.encode_field(&a.service_id.to_string())?;
            encoder.encode_field(&a.service_name)?;
            encoder.encode_field(&(a.duration_min as i32))?;
            encoder.encode_field(&a.price_cents)?;
            encoder.encode_field(&a.professional_id.map(|p| p.to_string()))?;
            encoder.encode_field(&a.professional_name)?;
            encoder.encode_field(&format_instant(a.start, offset))?;
            encoder.encode_field(&format_instant(a.end, offset))?;
            encoder.encode_field(&a.status.as_str())?;
            encoder.encode_field(&a.created_at)?;
            encoder.encode_field(&a.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn slot_rows(date: &str, slots: Vec<String>) -> Response {
    let schema = Arc::new(slot_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|start| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&date)?;
            encoder.encode_field(&start)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn service_rows(services: Vec<Service>) -> Response {
    let schema = Arc::new(service_schema());
    let rows: Vec<PgWireResult<_>> = services
        .into_iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id.to_string())?;
            encoder.encode_field(&s.name)?;
            encoder.encode_field(&(s.duration_min as i32))?;
            encoder.encode_field(&s.price_cents)?;
            encoder.encode_field(&s.active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn professional_rows(professionals: Vec<Professional>) -> Response {
    let schema = Arc::new(professional_schema());
    let rows: Vec<PgWireResult<_>> = professionals
        .into_iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.id.to_string())?;
            encoder.encode_field(&p.name)?;
            encoder.encode_field(&p.specialty)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn business_hours_rows(rows: Vec<HoursInfo>) -> Response {
    let schema = Arc::new(business_hours_schema());
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            let (opens_at, closes_at) = if r.hours.open {
                (
                    Some(r.hours.opens_at.format("%H:%M").to_string()),
                    Some(r.hours.closes_at.format("%H:%M").to_string()),
                )
            } else {
                (None, None)
            };
            encoder.encode_field(&r.weekday.to_string())?;
            encoder.encode_field(&r.hours.open)?;
            encoder.encode_field(&opens_at)?;
            encoder.encode_field(&closes_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for AgendaHandler {
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
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AgendaQueryParser;

#[async_trait]
impl QueryParser for AgendaQueryParser {
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
        Ok(schema_for(sql::result_shape(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AgendaHandler {
    type Statement = String;
    type QueryParser = AgendaQueryParser;

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
        self.run(client, &sql).await
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
        let schema = schema_for(sql::result_shape(&target.statement));
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let schema = schema_for(sql::result_shape(&target.statement.statement));
        Ok(DescribePortalResponse::new(schema))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
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

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Replace each `$n` with the n-th bound value as a quoted literal, or `NULL`.
/// One left-to-right pass, so inlined text is never rescanned. Placeholders with
/// no bound value are left as written.
fn inline_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(value)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AgendaFactory {
    handler: Arc<AgendaHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AgendaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AgendaFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        staff: Arc<StaffDirectory>,
        password: String,
    ) -> Self {
        Self {
            handler: Arc::new(AgendaHandler::new(tenant_manager, staff)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                AgendaAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AgendaFactory {
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
    factory: Arc<AgendaFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine error kind.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ServiceNotFound(_)
        | EngineError::ProfessionalNotFound(_)
        | EngineError::AppointmentNotFound(_) => "P0002",
        EngineError::InvalidInput(_) => "22023",
        EngineError::OutsideBusinessHours(_) => "23514",
        EngineError::SlotConflict(_) => "23P01",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::MissingBusinessHours(_) => "F0000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(_) | EngineError::MissingBusinessHours(_) = e {
        tracing::error!("{e}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match e {
        sql::SqlError::BadValue(_) => "22P02",
        sql::SqlError::UnknownTable(_) => "42P01",
        sql::SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
