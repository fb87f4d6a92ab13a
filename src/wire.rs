use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::auth::{Directory, DirectoryAuth};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::session::BookingSession;
use crate::sql::{self, Command, SqlError};

/// A LISTEN on one date's change feed.
struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Event>,
}

/// Per-connection query handler. The booking session is opened on the first
/// query, for the user pgwire authenticated at startup.
pub struct SlotbookHandler {
    engine: Arc<Engine>,
    directory: Arc<Directory>,
    session: Mutex<Option<BookingSession>>,
    listening: Mutex<Vec<Subscription>>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, directory: Arc<Directory>) -> Self {
        Self {
            engine,
            directory,
            session: Mutex::new(None),
            listening: Mutex::new(Vec::new()),
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn open_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<BookingSession> {
        let name = client.metadata().get("user").cloned().unwrap_or_default();
        let user = self
            .directory
            .lookup(&name)
            .ok_or_else(|| user_error("28P01", format!("unknown user {name:?}")))?;
        debug!("session opened for {} ({:?})", user.name, user.role);
        Ok(BookingSession::new(self.engine.clone(), user))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = self.execute(client, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute<C: ClientInfo>(&self, client: &C, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::Listen { channel } => return self.listen(channel).await,
            Command::Unlisten { channel } => {
                self.listening.lock().await.retain(|s| s.channel != channel);
                return Ok(Response::Execution(Tag::new("UNLISTEN")));
            }
            Command::UnlistenAll => {
                self.listening.lock().await.clear();
                return Ok(Response::Execution(Tag::new("UNLISTEN")));
            }
            _ => {}
        }

        let mut guard = self.session.lock().await;
        let session = match &mut *guard {
            Some(session) => session,
            empty @ None => empty.insert(self.open_session(client)?),
        };
        execute_command(&self.engine, session, cmd).await
    }

    async fn listen(&self, channel: String) -> PgWireResult<Response> {
        let date = sql::channel_date(&channel).map_err(sql_err)?;
        let mut listening = self.listening.lock().await;
        if !listening.iter().any(|s| s.channel == channel) {
            listening.push(Subscription {
                rx: self.engine.notify.subscribe(date),
                channel,
            });
        }
        Ok(Response::Execution(Tag::new("LISTEN")))
    }

    /// Deliver change-feed events queued since the last statement, as JSON.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listening = self.listening.lock().await;
            for sub in listening.iter_mut() {
                loop {
                    match sub.rx.try_recv() {
                        Ok(event) => match serde_json::to_string(&event) {
                            Ok(payload) => pending.push((sub.channel.clone(), payload)),
                            Err(e) => warn!("cannot encode {} event: {e}", event.kind()),
                        },
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            warn!("{}: dropped {n} events for a slow listener", sub.channel);
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }
}

async fn execute_command(
    engine: &Engine,
    session: &mut BookingSession,
    cmd: Command,
) -> PgWireResult<Response> {
    match cmd {
        Command::SelectProviders => {
            let schema = Arc::new(providers_schema());
            let rows: Vec<PgWireResult<_>> = engine
                .list_providers()
                .into_iter()
                .map(|p| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&p.id.to_string())?;
                    encoder.encode_field(&p.name)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::InsertProvider { id, name } => {
            let id = id.unwrap_or(session.user().id);
            session
                .register_provider(id, name)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::SelectAvailability { provider_id } => {
            let windows = engine
                .get_availability(provider_id)
                .await
                .map_err(engine_err)?;
            Ok(availability_response(windows))
        }
        Command::InsertAvailability {
            provider_id,
            date,
            start,
            end,
            timezone,
        } => {
            let tz = timezone.unwrap_or(session.timezone());
            session
                .publish_availability(provider_id, date, start, end, tz)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::DeleteAvailability { provider_id, date } => {
            session
                .withdraw_availability(provider_id, date)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectSlots {
            date,
            provider_id,
            timezone,
        } => {
            let slots = session
                .view(date, filter_of(provider_id), timezone)
                .await
                .map_err(engine_err)?;
            Ok(slots_response(slots))
        }
        Command::SelectReservations { date } => {
            Ok(reservations_response(session.my_reservations(date).await))
        }
        Command::InsertHold {
            date,
            slot,
            provider_id,
        } => {
            session
                .view(date, filter_of(provider_id), None)
                .await
                .map_err(engine_err)?;
            let r = session.hold(slot).await.map_err(engine_err)?;
            Ok(reservations_response(vec![r]))
        }
        Command::InsertAssignment {
            reservation_id,
            provider_id,
        } => {
            let r = session
                .choose_provider(reservation_id, provider_id)
                .await
                .map_err(engine_err)?;
            Ok(reservations_response(vec![r]))
        }
        Command::InsertBooking { reservation_id } => {
            let r = session.confirm(reservation_id).await.map_err(engine_err)?;
            Ok(reservations_response(vec![r]))
        }
        Command::DeleteReservation { id } => {
            session.cancel(id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::Listen { .. } | Command::Unlisten { .. } | Command::UnlistenAll => {
            Err(user_error("XX000", "change feed commands are handled per connection".into()))
        }
    }
}

fn filter_of(provider_id: Option<ulid::Ulid>) -> ProviderFilter {
    provider_id.map_or(ProviderFilter::All, ProviderFilter::Only)
}

fn ulid_list(ids: &[ulid::Ulid]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn providers_schema() -> Vec<FieldInfo> {
    vec![text_field("id", Type::VARCHAR), text_field("name", Type::VARCHAR)]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("provider_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("timezone", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("tooltip", Type::VARCHAR),
        text_field("providers", Type::VARCHAR),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("client_id", Type::VARCHAR),
        text_field("provider_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("timer", Type::INT4),
        text_field("expires_at", Type::INT8),
        text_field("eligible", Type::VARCHAR),
    ]
}

fn availability_response(windows: Vec<AvailabilityWindow>) -> Response {
    let schema = Arc::new(availability_schema());
    let rows: Vec<PgWireResult<_>> = windows
        .into_iter()
        .map(|w| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&w.provider_id.to_string())?;
            encoder.encode_field(&format_date(w.date))?;
            encoder.encode_field(&format_time(w.span.start))?;
            encoder.encode_field(&format_time(w.span.end))?;
            encoder.encode_field(&w.timezone.name())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn slots_response(slots: &[Slot]) -> Response {
    let schema = Arc::new(slots_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&format_time(s.span.start))?;
            encoder.encode_field(&format_time(s.span.end))?;
            encoder.encode_field(&s.status.as_str())?;
            encoder.encode_field(&s.tooltip)?;
            encoder.encode_field(&ulid_list(&s.providers))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservations_response(reservations: Vec<Reservation>) -> Response {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.client_id.to_string())?;
            encoder.encode_field(&r.provider_id.map(|p| p.to_string()))?;
            encoder.encode_field(&format_date(r.date))?;
            encoder.encode_field(&format_time(r.slot.start))?;
            encoder.encode_field(&format_time(r.slot.end))?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.timer.map(|t| t as i32))?;
            encoder.encode_field(&r.expires_at)?;
            encoder.encode_field(&ulid_list(&r.eligible))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Columns a statement returns, judged from its verb and target table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_ascii_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .copied()
    };
    match words.first().copied() {
        Some("SELECT") => match after("FROM") {
            Some("PROVIDERS") => providers_schema(),
            Some("AVAILABILITY") => availability_schema(),
            Some("SLOTS") => slots_schema(),
            Some("RESERVATIONS") => reservations_schema(),
            _ => vec![],
        },
        Some("INSERT") => match after("INTO") {
            Some("HOLDS" | "ASSIGNMENTS" | "BOOKINGS") => reservations_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(client, query).await;
        self.flush_notifications(client).await?;
        Ok(vec![response?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let response = self.run(client, &sql).await;
        self.flush_notifications(client).await?;
        response
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

/// Highest `$N` placeholder in `sql`.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let digits = bytes[i + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
            max = max.max(n);
        }
        i += 1 + digits;
    }
    max
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never eats the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookServer {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<DirectoryAuth, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookServer {
    pub fn new(engine: Arc<Engine>, directory: Arc<Directory>) -> Self {
        let auth_source = DirectoryAuth(directory.clone());
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, directory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookServer {
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

/// Serve one client connection to completion. Each connection gets its own
/// handler, so its booking session and LISTENs end with it.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    directory: Arc<Directory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let server = Arc::new(SlotbookServer::new(engine, directory));
    pgwire::tokio::process_socket(socket, tls, server).await
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
        EngineError::SlotUnavailable { .. } => "23505",
        EngineError::InvalidRange { .. } | EngineError::InvalidProvider { .. } => "22023",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::BadChannel(_) => "42000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
