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
use tokio::net::TcpStream;

use crate::auth::{AccessPolicy, Principal, SpotdAuthSource};
use crate::engine::{Engine, EngineError, ErrorClass};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ReservationFilter};

pub struct SpotdHandler {
    engine: Arc<Engine>,
    policy: Arc<AccessPolicy>,
    query_parser: Arc<SpotdQueryParser>,
}

impl SpotdHandler {
    pub fn new(engine: Arc<Engine>, policy: Arc<AccessPolicy>) -> Self {
        Self {
            engine,
            policy,
            query_parser: Arc::new(SpotdQueryParser),
        }
    }

    /// The login user name, already vetted by the startup handler.
    fn resolve_principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let user = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or_default();
        self.policy.principal_for(user).map_err(engine_err)
    }

    async fn run(&self, principal: &Principal, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(principal, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, principal: &Principal, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertPool { day } => {
                principal.require_admin().map_err(engine_err)?;
                let pool = engine.create_pool(&day).await.map_err(engine_err)?;
                Ok(vec![pool_rows(vec![pool])?])
            }
            Command::SelectPools { day } => {
                let pools = engine.list_pools(day.as_deref()).await;
                Ok(vec![pool_rows(pools)?])
            }
            Command::InsertReservation {
                pool_id,
                spot_number,
                claimant_id,
                date,
            } => {
                let reservation = engine
                    .admit_reservation(pool_id, spot_number, claimant_id, principal, date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(vec![reservation])?])
            }
            Command::UpdateReservation { id, patch } => {
                let reservation = engine
                    .update_reservation(id, patch, principal)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(vec![reservation])?])
            }
            Command::DeleteReservation { id } => {
                let released = if principal.is_admin() {
                    engine.admin_release_reservation(id, principal).await
                } else {
                    engine.release_reservation(id, principal).await
                };
                released.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectReservations { filter } => {
                let reservations = match filter {
                    ReservationFilter::All => engine.list_reservations(principal),
                    ReservationFilter::Id(id) => {
                        let scope = (!principal.is_admin()).then_some(principal.requester_id);
                        vec![engine.get_reservation(id, scope).map_err(engine_err)?]
                    }
                    ReservationFilter::Claimant(claimant_id) => {
                        engine.reservations_for_claimant(claimant_id, principal)
                    }
                    ReservationFilter::Everyone => engine.list_reservations_anonymized(),
                };
                Ok(vec![reservation_rows(reservations)?])
            }
        }
    }
}

fn pool_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("day".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("capacity".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("slot_numbers".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("reserved_slots".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("reserved_count".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("pool_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("spot_number".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("claimant_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("requester_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("date".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

/// Slot lists travel as JSON arrays in a text column.
fn json_slots(slots: &[u32]) -> PgWireResult<String> {
    serde_json::to_string(slots).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

fn pool_rows(pools: Vec<PoolInfo>) -> PgWireResult<Response> {
    let schema = Arc::new(pool_schema());
    let mut rows = Vec::with_capacity(pools.len());
    for pool in pools {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&pool.id.to_string())?;
        encoder.encode_field(&pool.day.as_str())?;
        encoder.encode_field(&i64::from(pool.capacity))?;
        encoder.encode_field(&json_slots(&pool.slot_numbers)?)?;
        encoder.encode_field(&json_slots(&pool.reserved_slots)?)?;
        encoder.encode_field(&i64::from(pool.reserved_count))?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservation_rows(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let mut rows = Vec::with_capacity(reservations.len());
    for r in reservations {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&r.id.to_string())?;
        encoder.encode_field(&r.pool_id.to_string())?;
        encoder.encode_field(&i64::from(r.slot_number))?;
        encoder.encode_field(&r.claimant_id.to_string())?;
        encoder.encode_field(&r.requester_id.to_string())?;
        encoder.encode_field(&r.date)?;
        encoder.encode_field(&r.created_at)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Columns a statement will return, judged from its text alone.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("DELETE") {
        vec![]
    } else if upper.contains("POOLS") {
        pool_schema()
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SpotdHandler {
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
        let principal = self.resolve_principal(client)?;
        self.run(&principal, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpotdQueryParser;

#[async_trait]
impl QueryParser for SpotdQueryParser {
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
impl ExtendedQueryHandler for SpotdHandler {
    type Statement = String;
    type QueryParser = SpotdQueryParser;

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
        let principal = self.resolve_principal(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&principal, &sql).await?;
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
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

pub struct SpotdFactory {
    handler: Arc<SpotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SpotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SpotdFactory {
    pub fn new(engine: Arc<Engine>, policy: Arc<AccessPolicy>, password: String) -> Self {
        let auth_source = SpotdAuthSource::new(password, policy.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SpotdHandler::new(engine, policy)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpotdFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, factory: Arc<SpotdFactory>) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

/// SQLSTATE for an engine error, by class.
fn sqlstate(e: &EngineError) -> &'static str {
    match e.class() {
        ErrorClass::InputValidation => "22023",
        ErrorClass::Conflict => "23505",
        ErrorClass::NotFound => "P0002",
        ErrorClass::Authorization => "42501",
        ErrorClass::Infrastructure => match e {
            EngineError::PartialFailure(_) => "XX000",
            _ => "58030",
        },
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
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
