use std::fmt::Debug;
use std::sync::Arc;

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
use tracing::debug;
use ulid::Ulid;

use crate::auth::TemporaAuthSource;
use crate::engine::{ConflictKind, EngineError};
use crate::model::*;
use crate::observability::{command_label, STATEMENTS_TOTAL};
use crate::permission::Caller;
use crate::service::SchedulerService;
use crate::sql::{self, Command, Table, TableFilter};

pub struct TemporaHandler {
    service: Arc<SchedulerService>,
    query_parser: Arc<TemporaQueryParser>,
}

impl TemporaHandler {
    pub fn new(service: Arc<SchedulerService>) -> Self {
        Self {
            service,
            query_parser: Arc::new(TemporaQueryParser),
        }
    }

    /// The login name is the caller identity.
    fn caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        client
            .metadata()
            .get("user")
            .map(|user| Caller::new(user.as_str()))
            .ok_or_else(|| user_error("28000", "no user in startup message".into()))
    }

    async fn execute(&self, caller: Caller, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let result = self.execute_command(caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(STATEMENTS_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, caller: Caller, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::Insert { table, rows, returning } => {
                let missing = rows.iter().filter(|r| r.id.is_none()).count();
                let mut fresh = self.service.allocate(table.kind(), missing).into_iter();
                let mut intents = Vec::with_capacity(rows.len());
                for row in rows {
                    let id = row
                        .id
                        .or_else(|| fresh.next())
                        .ok_or_else(|| engine_err(EngineError::Invalid("no id available".into())))?;
                    let mut payload = row.payload;
                    // Reservations inserted without an owner belong to whoever inserted them.
                    if let Payload::Reservation(r) = &mut payload
                        && r.owner.is_none()
                    {
                        r.owner = Some(caller.name().to_string());
                    }
                    intents.push(WriteIntent::insert(id, payload));
                }
                let stored = self.service.write(&caller, intents).await.map_err(engine_err)?;
                if returning {
                    Ok(rows_response(table, &stored))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(stored.len())))
                }
            }
            Command::Update { table, id, expected, patch, returning } => {
                let current = self.service.engine().get(&id).await.ok_or_else(|| {
                    engine_err(EngineError::OptimisticConflict { id, kind: ConflictKind::TargetGone })
                })?;
                check_table(table, &current)?;
                let payload = sql::apply_patch(&current.payload, &patch).map_err(sql_err)?;
                let stored = self
                    .service
                    .write(&caller, vec![WriteIntent::update(id, expected, payload)])
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(rows_response(table, &stored))
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(stored.len())))
                }
            }
            Command::Delete { table, id, expected } => {
                if let Some(current) = self.service.engine().get(&id).await {
                    check_table(table, &current)?;
                }
                self.service
                    .write(&caller, vec![WriteIntent::delete(id, expected)])
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectEvents { request } => {
                let service = self.service.clone();
                // The bridge blocks; keep it off the runtime workers.
                let records = tokio::task::spawn_blocking(move || service.list_events(&caller, request))
                    .await
                    .map_err(|e| engine_err(EngineError::QueryFailure(e.to_string())))?
                    .map_err(engine_err)?;
                debug!("events query returned {} reservation(s)", records.len());
                Ok(rows_response(Table::Reservations, &records))
            }
            Command::SelectTable { table, filter } => {
                let records = match (table, filter) {
                    (_, TableFilter::Id(id)) => match self.service.get(&caller, &id).await {
                        Ok(record) if record.kind() == table.kind() => vec![record],
                        Ok(_) | Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    (Table::Resources, _) => self.service.list_resources(&caller).await,
                    (Table::Reservations, _) => self.service.list_reservations(&caller).await,
                    (Table::Appointments, TableFilter::Reservation(rid)) => self
                        .service
                        .appointments_of(&caller, &rid)
                        .await
                        .map_err(engine_err)?,
                    (Table::Appointments, TableFilter::All) => {
                        return Err(user_error(
                            "0A000",
                            "appointments must be selected by id or reservation_id".into(),
                        ));
                    }
                };
                Ok(rows_response(table, &records))
            }
        }
    }
}

fn check_table(table: Table, record: &Record) -> PgWireResult<()> {
    if record.kind() != table.kind() {
        return Err(engine_err(EngineError::kind_mismatch(record.id, table.kind(), record.kind())));
    }
    Ok(())
}

// ── Row encoding ─────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn table_schema(table: Table) -> Vec<FieldInfo> {
    let mut fields = vec![field("id", Type::VARCHAR), field("last_modified", Type::INT8)];
    match table {
        Table::Resources => {
            fields.push(field("name", Type::VARCHAR));
            fields.push(field("resource_type", Type::VARCHAR));
        }
        Table::Reservations => {
            fields.push(field("name", Type::VARCHAR));
            fields.push(field("event_type", Type::VARCHAR));
            fields.push(field("owner", Type::VARCHAR));
            fields.push(field("annotations", Type::VARCHAR));
        }
        Table::Appointments => {
            fields.push(field("reservation_id", Type::VARCHAR));
            fields.push(field("start", Type::INT8));
            fields.push(field("end", Type::INT8));
            fields.push(field("resources", Type::VARCHAR));
            fields.push(field("comment", Type::VARCHAR));
        }
    }
    fields
}

fn rows_response(table: Table, records: &[Record]) -> Response {
    let schema = Arc::new(table_schema(table));
    let rows: Vec<PgWireResult<_>> = records
        .iter()
        .map(|record| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&record.id.to_string())?;
            encoder.encode_field(&record.last_modified)?;
            match &record.payload {
                Payload::Resource(r) => {
                    encoder.encode_field(&r.name)?;
                    encoder.encode_field(&r.resource_type)?;
                }
                Payload::Reservation(r) => {
                    encoder.encode_field(&r.name)?;
                    encoder.encode_field(&r.event_type)?;
                    encoder.encode_field(&r.owner)?;
                    let annotations = serde_json::to_string(&r.annotations)
                        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                    encoder.encode_field(&annotations)?;
                }
                Payload::Appointment(a) => {
                    encoder.encode_field(&a.reservation_id.to_string())?;
                    encoder.encode_field(&a.span.start)?;
                    encoder.encode_field(&a.span.end)?;
                    let resources: Vec<String> = a.resources.iter().map(Ulid::to_string).collect();
                    encoder.encode_field(&resources.join(","))?;
                    encoder.encode_field(&a.display_comment().map(str::to_owned))?;
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns a statement will produce, judged from its text (parameters unbound).
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") && !upper.contains("RETURNING") {
        return vec![];
    }
    if upper.contains("EVENTS") {
        table_schema(Table::Reservations)
    } else if upper.contains("APPOINTMENTS") {
        table_schema(Table::Appointments)
    } else if upper.contains("RESERVATIONS") {
        table_schema(Table::Reservations)
    } else if upper.contains("RESOURCES") {
        table_schema(Table::Resources)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TemporaHandler {
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
        let caller = self.caller(client)?;
        Ok(vec![self.execute(caller, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TemporaQueryParser;

#[async_trait]
impl QueryParser for TemporaQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TemporaHandler {
    type Statement = String;
    type QueryParser = TemporaQueryParser;

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
        let caller = self.caller(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.execute(caller, &sql).await
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
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

/// Inline bound text parameters as quoted literals, highest index first so `$1` never
/// clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TemporaFactory {
    handler: Arc<TemporaHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TemporaAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TemporaFactory {
    pub fn new(service: Arc<SchedulerService>, password: String) -> Self {
        Self {
            handler: Arc::new(TemporaHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                TemporaAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TemporaFactory {
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
    service: Arc<SchedulerService>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(TemporaFactory::new(service, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure. Conflicts use 40001 so drivers treat them as retryable.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::OptimisticConflict { .. } => "40001",
        EngineError::DuplicateIdentity(_) => "23505",
        EngineError::DependentRecordsExist { .. } | EngineError::MissingParent { .. } => "23503",
        EngineError::Unauthorized { .. } => "42501",
        EngineError::DeadlineExceeded(_) => "57014",
        EngineError::NotFound(_) => "P0002",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::QueryFailure(_) => "XX000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
