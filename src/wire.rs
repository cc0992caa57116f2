use std::fmt::Debug;
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{AdminAllowlist, PasswordAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::partition::PartitionManager;
use crate::sql::{self, BookingScope, Command, SqlError};

pub struct ChairtimeHandler {
    partitions: Arc<PartitionManager>,
    admins: Arc<AdminAllowlist>,
    query_parser: Arc<ChairtimeQueryParser>,
}

impl ChairtimeHandler {
    pub fn new(partitions: Arc<PartitionManager>, admins: Arc<AdminAllowlist>) -> Self {
        Self {
            partitions,
            admins,
            query_parser: Arc::new(ChairtimeQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.partitions.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("partition error: {e}"))
        })
    }

    /// Parse, authorize and run one statement, recording query metrics.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.authorize_and_execute(client, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn authorize_and_execute<C: ClientInfo>(
        &self,
        client: &C,
        cmd: Command,
    ) -> PgWireResult<Response> {
        if cmd.requires_admin() {
            let user = client.metadata().get("user").map(String::as_str);
            if !self.admins.is_admin(user) {
                tracing::warn!(user = user.unwrap_or(""), "administrative command refused");
                return Err(engine_err(EngineError::Forbidden(
                    "administrative command requires an allowlisted user",
                )));
            }
        }
        let engine = self.resolve_engine(client)?;
        execute_command(&engine, cmd).await
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertTenant {
            id,
            name,
            utc_offset_minutes,
            grid,
        } => {
            engine
                .create_tenant(id, name, utc_offset_minutes, grid)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::DeleteTenant { id } => {
            engine.delete_tenant(id).await.map_err(engine_err)?;
            Ok(deleted(1))
        }
        Command::SelectTenants => {
            let schema = Arc::new(tenants_schema());
            let rows: Vec<PgWireResult<DataRow>> = engine
                .list_tenants()
                .await
                .into_iter()
                .map(|t| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&t.id.to_string())?;
                    encoder.encode_field(&t.name)?;
                    encoder.encode_field(&t.utc_offset_minutes)?;
                    encoder.encode_field(&t.grid.start.to_string())?;
                    encoder.encode_field(&t.grid.end.to_string())?;
                    encoder.encode_field(&i32::from(t.grid.step_minutes))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::InsertStaff {
            id,
            tenant_id,
            name,
        } => {
            engine
                .add_staff(id, tenant_id, name)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::SetStaffActive { staff_id, active } => {
            engine
                .set_staff_active(staff_id, active)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::DeleteStaff { id } => {
            engine.remove_staff(id).await.map_err(engine_err)?;
            Ok(deleted(1))
        }
        Command::SelectStaff { tenant_id } => {
            let schema = Arc::new(staff_schema());
            let rows: Vec<PgWireResult<DataRow>> = engine
                .list_staff(tenant_id)
                .await
                .into_iter()
                .map(|s| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&s.id.to_string())?;
                    encoder.encode_field(&s.tenant_id.to_string())?;
                    encoder.encode_field(&s.name)?;
                    encoder.encode_field(&s.active)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::InsertService {
            id,
            tenant_id,
            name,
            duration_minutes,
            price_cents,
        } => {
            engine
                .add_service(id, tenant_id, name, duration_minutes, price_cents)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::DeleteService { id } => {
            engine.remove_service(id).await.map_err(engine_err)?;
            Ok(deleted(1))
        }
        Command::SelectServices { tenant_id } => {
            let schema = Arc::new(services_schema());
            let rows: Vec<PgWireResult<DataRow>> = engine
                .list_services(tenant_id)
                .into_iter()
                .map(|s| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&s.id.to_string())?;
                    encoder.encode_field(&s.tenant_id.to_string())?;
                    encoder.encode_field(&s.name)?;
                    encoder.encode_field(&(s.duration_minutes as i64))?;
                    encoder.encode_field(&s.price_cents)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::ReplaceBusinessHours { tenant_id, hours } => {
            let count = hours.len();
            engine
                .replace_business_hours(tenant_id, hours)
                .await
                .map_err(engine_err)?;
            Ok(inserted(count))
        }
        Command::ClearBusinessHours { tenant_id } => {
            let count = engine
                .list_business_hours(tenant_id)
                .await
                .map_err(engine_err)?
                .len();
            engine
                .replace_business_hours(tenant_id, Vec::new())
                .await
                .map_err(engine_err)?;
            Ok(deleted(count))
        }
        Command::SelectBusinessHours { tenant_id } => {
            let schema = Arc::new(business_hours_schema());
            let rows: Vec<PgWireResult<DataRow>> = engine
                .list_business_hours(tenant_id)
                .await
                .map_err(engine_err)?
                .into_iter()
                .map(|h| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&tenant_id.to_string())?;
                    encoder.encode_field(&i32::from(h.day_of_week))?;
                    encoder.encode_field(&h.is_open)?;
                    encoder.encode_field(&h.open_time.map(|t| t.to_string()))?;
                    encoder.encode_field(&h.close_time.map(|t| t.to_string()))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::InsertBooking(candidate) => {
            engine.create_booking(candidate).await.map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::SetBookingStatus { booking_id, status } => {
            engine
                .set_booking_status(booking_id, status)
                .await
                .map_err(engine_err)?;
            Ok(inserted(1))
        }
        Command::CancelBooking { id } => {
            engine.cancel_booking(id).await.map_err(engine_err)?;
            Ok(deleted(1))
        }
        Command::ClearBookingHistory { tenant_id, before } => {
            let removed = engine
                .clear_booking_history(tenant_id, before)
                .await
                .map_err(engine_err)?;
            Ok(deleted(removed))
        }
        Command::SelectBookings { scope, date } => {
            let bookings = match scope {
                BookingScope::Staff(staff_id) => engine.bookings_for_staff(staff_id, date).await,
                BookingScope::Tenant(tenant_id) => {
                    engine.bookings_for_tenant(tenant_id, date).await
                }
            };
            let schema = Arc::new(bookings_schema());
            let rows: Vec<PgWireResult<DataRow>> = bookings
                .iter()
                .map(|b| encode_booking(&schema, b))
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectAvailability { staff_id, date } => {
            let slots = engine
                .compute_available_slots(staff_id, date)
                .await
                .map_err(engine_err)?;

            let schema = Arc::new(availability_schema());
            let staff_str = staff_id.to_string();
            let date_str = date.to_string();
            let rows: Vec<PgWireResult<DataRow>> = slots
                .into_iter()
                .map(|slot| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&staff_str)?;
                    encoder.encode_field(&date_str)?;
                    encoder.encode_field(&slot.to_string())?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
    }
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, b: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.tenant_id.to_string())?;
    encoder.encode_field(&b.staff_id.to_string())?;
    encoder.encode_field(&b.service_id.to_string())?;
    encoder.encode_field(&b.date.to_string())?;
    encoder.encode_field(&b.time.to_string())?;
    encoder.encode_field(&b.status.as_str().to_string())?;
    encoder.encode_field(&b.payment.as_str().to_string())?;
    encoder.encode_field(&b.client.name)?;
    encoder.encode_field(&b.client.phone)?;
    encoder.encode_field(&b.client.email)?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&b.created_at)?;
    Ok(encoder.take_row())
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn tenants_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        typed("utc_offset_minutes", Type::INT4),
        text("grid_start"),
        text("grid_end"),
        typed("grid_step_minutes", Type::INT4),
    ]
}

fn staff_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tenant_id"),
        text("name"),
        typed("active", Type::BOOL),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tenant_id"),
        text("name"),
        typed("duration_minutes", Type::INT8),
        typed("price_cents", Type::INT8),
    ]
}

fn business_hours_schema() -> Vec<FieldInfo> {
    vec![
        text("tenant_id"),
        typed("day_of_week", Type::INT4),
        typed("is_open", Type::BOOL),
        text("open_time"),
        text("close_time"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("tenant_id"),
        text("staff_id"),
        text("service_id"),
        text("date"),
        text("time"),
        text("status"),
        text("payment"),
        text("client_name"),
        text("client_phone"),
        text("client_email"),
        text("notes"),
        typed("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("staff_id"), text("date"), text("time")]
}

/// Row shape of a statement, judged from its text alone: statements sent for
/// describe may still carry `$n` placeholders that do not parse as values.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';' || c == '(' || c == ')' || c == ',')
        .filter(|w| !w.is_empty());
    if words.next() != Some("select") {
        return vec![];
    }
    let table = words
        .by_ref()
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches('"').rsplit('.').next().unwrap_or("").to_string());
    match table.as_deref() {
        Some("tenants") => tenants_schema(),
        Some("staff") => staff_schema(),
        Some("services") => services_schema(),
        Some("business_hours") => business_hours_schema(),
        Some("bookings") => bookings_schema(),
        Some("availability") => availability_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ChairtimeHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
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
pub struct ChairtimeQueryParser;

#[async_trait]
impl QueryParser for ChairtimeQueryParser {
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
impl ExtendedQueryHandler for ChairtimeHandler {
    type Statement = String;
    type QueryParser = ChairtimeQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
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

/// Highest `$N` placeholder outside quoted literals.
fn count_params(sql: &str) -> usize {
    let mut highest = 0;
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '$' => {
                let mut digits = String::new();
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    digits.push(d);
                }
                if let Ok(n) = digits.parse::<usize>() {
                    highest = highest.max(n);
                }
            }
            None => {}
        }
    }
    highest
}

/// Inline bound text-format parameters as quoted literals in one left-to-right
/// pass. `$N` inside a quoted literal or identifier is left alone, and so is
/// text that came from a bound value.
fn substitute_params(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                result.push(c);
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                result.push(c);
            }
            None if c == '$' => {
                let mut digits = String::new();
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    digits.push(d);
                }
                let param = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| params.get(i));
                match param {
                    Some(Some(bytes)) => {
                        result.push('\'');
                        result.push_str(&String::from_utf8_lossy(bytes).replace('\'', "''"));
                        result.push('\'');
                    }
                    Some(None) => result.push_str("NULL"),
                    None => {
                        result.push('$');
                        result.push_str(&digits);
                    }
                }
            }
            None => result.push(c),
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChairtimeFactory {
    handler: Arc<ChairtimeHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<PasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ChairtimeFactory {
    pub fn new(
        partitions: Arc<PartitionManager>,
        password: String,
        admins: Arc<AdminAllowlist>,
    ) -> Self {
        Self {
            handler: Arc::new(ChairtimeHandler::new(partitions, admins.clone())),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PasswordAuthSource::new(password, admins),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChairtimeFactory {
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
    partitions: Arc<PartitionManager>,
    password: String,
    admins: Arc<AdminAllowlist>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(ChairtimeFactory::new(partitions, password, admins));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) | EngineError::AlreadyExists(_) => "23505",
        EngineError::Validation(_) => "23514",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::HasBookings(_) | EngineError::Unavailable(_) | EngineError::WalError(_) => {
            "P0001"
        }
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
