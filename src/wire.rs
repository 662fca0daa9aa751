use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, SecondsFormat};
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
use tracing::debug;
use ulid::Ulid;

use crate::auth::FreeslotAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, Relation};
use crate::tenant::TenantManager;

pub struct FreeslotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FreeslotQueryParser>,
}

impl FreeslotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FreeslotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(engine, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertService { id, owner_id, name } => {
                engine
                    .register_service(ServiceInfo { id, owner_id, name })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectServices { owner_id } => {
                let services = engine.list_services(owner_id);
                Ok(vec![rows_response(Relation::Services, &services, encode_service)])
            }
            Command::SaveSchedule { owner_id, date, ranges } => {
                let date = date_arg(&date).map_err(engine_err)?;
                let saved = engine
                    .save_day_schedule(owner_id, date, &ranges)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows_response(Relation::Schedule, &saved, encode_interval)])
            }
            Command::SelectSchedule { owner_id, date, days } => {
                let date = date_arg(&date).map_err(engine_err)?;
                let intervals: Vec<FreeInterval> = match days {
                    None => engine.get_day_schedule(owner_id, date).await,
                    Some(days) => engine
                        .get_range_schedule(owner_id, date, days)
                        .await
                        .map_err(engine_err)?
                        .into_values()
                        .flatten()
                        .collect(),
                };
                Ok(vec![rows_response(Relation::Schedule, &intervals, encode_interval)])
            }
            Command::InsertAppointment {
                owner_id,
                service_id,
                date,
                start,
                end,
                customer,
            } => {
                let request = BookingRequest {
                    owner_id,
                    service_id,
                    date: date_arg(&date).map_err(engine_err)?,
                    start: time_arg(&start).map_err(engine_err)?,
                    end: time_arg(&end).map_err(engine_err)?,
                    customer,
                };
                let appointment = engine.book_appointment(request).await.map_err(engine_err)?;
                Ok(vec![rows_response(
                    Relation::Appointments,
                    std::slice::from_ref(&appointment),
                    encode_appointment,
                )])
            }
            Command::SelectAppointments { owner_id } => {
                let appointments = engine.list_appointments(owner_id).await;
                Ok(vec![rows_response(Relation::Appointments, &appointments, encode_appointment)])
            }
            Command::DeleteAppointment { id, owner_id } => {
                let id = appointment_id_arg(&id).map_err(engine_err)?;
                engine.cancel_appointment(id, owner_id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
        }
    }
}

fn date_arg(text: &str) -> Result<NaiveDate, EngineError> {
    parse_date(text).ok_or_else(|| EngineError::MalformedDate(text.to_string()))
}

/// Text that is not a ULID cannot name any appointment.
fn appointment_id_arg(text: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(text).map_err(|_| EngineError::UnknownAppointmentId(text.to_string()))
}

fn time_arg(text: &str) -> Result<NaiveTime, EngineError> {
    parse_time_of_day(text).ok_or_else(|| EngineError::MalformedTime(text.to_string()))
}

// ── Result rows ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

pub fn schema_for(relation: Relation) -> Vec<FieldInfo> {
    match relation {
        Relation::Services => vec![int_field("id"), int_field("owner_id"), text_field("name")],
        Relation::Schedule => vec![
            text_field("id"),
            int_field("owner_id"),
            text_field("date"),
            text_field("start_time"),
            text_field("end_time"),
        ],
        Relation::Appointments => vec![
            text_field("id"),
            int_field("owner_id"),
            int_field("service_id"),
            text_field("date"),
            text_field("start_time"),
            text_field("end_time"),
            text_field("first_name"),
            text_field("last_name"),
            text_field("email"),
            text_field("phone"),
            text_field("handle"),
            text_field("created_at"),
        ],
    }
}

fn rows_response<T>(
    relation: Relation,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema_for(relation));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_service(encoder: &mut DataRowEncoder, service: &ServiceInfo) -> PgWireResult<()> {
    encoder.encode_field(&service.id)?;
    encoder.encode_field(&service.owner_id)?;
    encoder.encode_field(&service.name)
}

fn encode_interval(encoder: &mut DataRowEncoder, interval: &FreeInterval) -> PgWireResult<()> {
    encoder.encode_field(&interval.id.to_string())?;
    encoder.encode_field(&interval.owner_id)?;
    encoder.encode_field(&interval.date.to_string())?;
    encoder.encode_field(&format_time(interval.span.start))?;
    encoder.encode_field(&format_time(interval.span.end))
}

fn encode_appointment(encoder: &mut DataRowEncoder, appt: &Appointment) -> PgWireResult<()> {
    encoder.encode_field(&appt.id.to_string())?;
    encoder.encode_field(&appt.owner_id)?;
    encoder.encode_field(&appt.service_id)?;
    encoder.encode_field(&appt.date.to_string())?;
    encoder.encode_field(&format_time(appt.span.start))?;
    encoder.encode_field(&format_time(appt.span.end))?;
    encoder.encode_field(&appt.customer.first_name)?;
    encoder.encode_field(&appt.customer.last_name)?;
    encoder.encode_field(&appt.customer.email)?;
    encoder.encode_field(&appt.customer.phone)?;
    encoder.encode_field(&appt.customer.handle)?;
    encoder.encode_field(&appt.created_at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[async_trait]
impl SimpleQueryHandler for FreeslotHandler {
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
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FreeslotQueryParser;

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    sql::returned_relation(sql).map(schema_for).unwrap_or_default()
}

#[async_trait]
impl QueryParser for FreeslotQueryParser {
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
impl ExtendedQueryHandler for FreeslotHandler {
    type Statement = String;
    type QueryParser = FreeslotQueryParser;

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
        let sql = bind_text_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
        Ok(responses.remove(0))
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

/// A statement split at its `$N` placeholders.
#[derive(Debug, PartialEq, Eq)]
enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split SQL into text and `$N` placeholders in one left-to-right pass.
/// Anything inside a single-quoted literal is text.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled '' inside a literal toggles twice and stays in it.
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                let end = i + 1 + digits;
                match sql[i + 1..end].parse::<usize>() {
                    Ok(n) if n > 0 => {
                        if text_start < i {
                            pieces.push(Piece::Text(&sql[text_start..i]));
                        }
                        pieces.push(Piece::Param(n));
                        text_start = end;
                    }
                    _ => {}
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    if text_start < sql.len() {
        pieces.push(Piece::Text(&sql[text_start..]));
    }
    pieces
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Bound values are emitted once and never scanned again.
fn bind_text_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            Piece::Text(text) => result.push_str(text),
            Piece::Param(n) => match params.get(n - 1) {
                Some(Some(bytes)) => {
                    let text = String::from_utf8_lossy(bytes.as_ref());
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                Some(None) => result.push_str("NULL"),
                None => {
                    result.push('$');
                    result.push_str(&n.to_string());
                }
            },
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FreeslotFactory {
    handler: Arc<FreeslotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FreeslotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FreeslotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FreeslotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FreeslotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FreeslotFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = FreeslotFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each error class.
pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::MalformedTime => "22007",
        ErrorKind::InvalidRange => "22023",
        ErrorKind::Overlap => "22000",
        ErrorKind::NotFound => "P0002",
        ErrorKind::NoAvailableSlot => "23P01",
        ErrorKind::LimitExceeded => "54000",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = sqlstate(e.kind());
    debug!(code, "request rejected: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM schedule WHERE owner_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("VALUES ($3, $1, $12)"), 12);
        assert_eq!(count_params("SELECT '$' FROM services"), 0);
    }

    #[test]
    fn binds_params_as_quoted_text() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"7".as_slice()), Some(b"O'Brien".as_slice()), None];
        let sql = bind_text_params("VALUES ($1, $2, $3)", &params);
        assert_eq!(sql, "VALUES ('7', 'O''Brien', NULL)");
    }

    #[test]
    fn binds_ten_or_more_params() {
        let mut params: Vec<Option<&[u8]>> = vec![Some(b"x".as_slice()); 10];
        params[9] = Some(b"ten".as_slice());
        let sql = bind_text_params("$1 $10", &params);
        assert_eq!(sql, "'x' 'ten'");
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"7".as_slice()), Some(b"vip$1".as_slice())];
        let sql = bind_text_params("INSERT INTO t (a, b) VALUES ($1, $2)", &params);
        assert_eq!(sql, "INSERT INTO t (a, b) VALUES ('7', 'vip$1')");

        let params: Vec<Option<&[u8]>> = vec![Some(b"$2 and $1".as_slice()), Some(b"x".as_slice())];
        let sql = bind_text_params("VALUES ($2, $1)", &params);
        assert_eq!(sql, "VALUES ('x', '$2 and $1')");
    }

    #[test]
    fn placeholders_inside_literals_are_left_alone() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"a".as_slice())];
        assert_eq!(bind_text_params("SELECT '$1', $1", &params), "SELECT '$1', 'a'");
        assert_eq!(bind_text_params("SELECT 'it''s $1', $1", &params), "SELECT 'it''s $1', 'a'");
        assert_eq!(count_params("SELECT '$4' FROM services WHERE owner_id = $1"), 1);
    }

    #[test]
    fn unbound_or_bare_dollars_pass_through() {
        let params: Vec<Option<&[u8]>> = vec![Some(b"a".as_slice())];
        assert_eq!(bind_text_params("$1 $2 $ $0", &params), "'a' $2 $ $0");
    }

    #[test]
    fn every_error_kind_has_a_distinct_sqlstate() {
        let kinds = [
            ErrorKind::MalformedTime,
            ErrorKind::InvalidRange,
            ErrorKind::Overlap,
            ErrorKind::NotFound,
            ErrorKind::NoAvailableSlot,
            ErrorKind::LimitExceeded,
            ErrorKind::Internal,
        ];
        let mut codes: Vec<_> = kinds.iter().map(|k| sqlstate(*k)).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert_eq!(sqlstate(ErrorKind::NoAvailableSlot), "23P01");
    }

    #[test]
    fn date_and_time_args_classify_as_malformed_time() {
        assert_eq!(date_arg("2025-02-30").unwrap_err().kind(), ErrorKind::MalformedTime);
        assert_eq!(time_arg("7pm").unwrap_err().kind(), ErrorKind::MalformedTime);
        assert_eq!(time_arg("19:00").unwrap(), NaiveTime::from_hms_opt(19, 0, 0).unwrap());
    }

    #[test]
    fn malformed_appointment_id_is_not_found() {
        let err = appointment_id_arg("not-a-ulid").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(sqlstate(err.kind()), "P0002");
        let id = Ulid::new();
        assert_eq!(appointment_id_arg(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn schema_matches_statement() {
        assert_eq!(result_schema("SELECT * FROM appointments WHERE owner_id = $1").len(), 12);
        assert_eq!(result_schema("INSERT INTO schedule (owner_id, date, start_time, end_time) VALUES ($1, $2, $3, $4)").len(), 5);
        assert!(result_schema("DELETE FROM appointments WHERE id = $1 AND owner_id = $2").is_empty());
    }
}
