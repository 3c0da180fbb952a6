use std::fmt::Debug;
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
use ulid::Ulid;

use crate::auth::VelocitaAuthSource;
use crate::engine::{checked_span, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, AvailabilityTarget, Command, ReservationLookup, SqlError};
use crate::storefront::StorefrontManager;

pub struct VelocitaHandler {
    storefronts: Arc<StorefrontManager>,
    query_parser: Arc<VelocitaQueryParser>,
}

impl VelocitaHandler {
    pub fn new(storefronts: Arc<StorefrontManager>) -> Self {
        Self {
            storefronts,
            query_parser: Arc::new(VelocitaQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.storefronts
            .get_or_create(&db)
            .map_err(|e| user_error("3D000", format!("storefront error: {e}")))
    }

    /// Run one command and record query metrics for it.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertVehicle { vehicle } => {
                engine.register_vehicle(vehicle).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteVehicle { id } => {
                engine.remove_vehicle(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAddOn { add_on } => {
                engine.register_add_on(add_on).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteAddOn { id } => {
                engine.remove_add_on(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                vehicle_id,
                customer_id,
                start,
                end,
                add_on_ids,
            } => {
                let span = checked_span(start, end).map_err(engine_err)?;
                engine
                    .create_reservation(NewReservation {
                        id,
                        vehicle_id,
                        customer_id,
                        span,
                        add_on_ids,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertHistory {
                reservation_id,
                action,
                note,
            } => {
                engine
                    .apply_transition(reservation_id, action, note)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectVehicles {
                category,
                max_price_per_day,
                start,
                end,
            } => {
                let window = match (start, end) {
                    (None, None) => None,
                    (Some(s), Some(e)) => Some(checked_span(s, e).map_err(engine_err)?),
                    _ => return Err(sql_err(SqlError::MissingFilter("start and \"end\" together"))),
                };
                let filter = VehicleFilter {
                    category,
                    max_price_per_day,
                    window,
                };
                let vehicles = engine.search_vehicles(&filter).await.map_err(engine_err)?;
                Ok(rows_response(vehicle_schema(), &vehicles, encode_vehicle))
            }
            Command::SelectAddOns => {
                let add_ons = engine.list_add_ons();
                Ok(rows_response(add_on_schema(), &add_ons, encode_add_on))
            }
            Command::SelectReservations { lookup } => {
                let reservations = match lookup {
                    ReservationLookup::ById(id) => match engine.get_reservation(id).await {
                        Ok(r) => vec![r],
                        Err(e) if e.is_not_found() => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    ReservationLookup::ByVehicle(vehicle_id) => {
                        engine.list_reservations(vehicle_id).await.map_err(engine_err)?
                    }
                };
                Ok(rows_response(reservation_schema(), &reservations, encode_reservation))
            }
            Command::SelectHistory { reservation_id } => {
                let history = engine.history(reservation_id).await.map_err(engine_err)?;
                Ok(rows_response(history_schema(), &history, encode_history))
            }
            Command::SelectAvailability { target, start, end } => {
                let window = checked_span(start, end).map_err(engine_err)?;
                let (key, free) = match target {
                    AvailabilityTarget::Vehicle(vehicle_id) => (
                        vehicle_id.to_string(),
                        engine.free_windows(vehicle_id, window).await.map_err(engine_err)?,
                    ),
                    AvailabilityTarget::Category(category) => {
                        let free = engine
                            .category_free_windows(&category, window)
                            .await
                            .map_err(engine_err)?;
                        (category, free)
                    }
                };
                Ok(rows_response(availability_schema(), &free, |enc, span| {
                    enc.encode_field(&key)?;
                    enc.encode_field(&span.start)?;
                    enc.encode_field(&span.end)
                }))
            }
            Command::SelectQuote {
                vehicle_id,
                start,
                end,
                add_on_ids,
            } => {
                let span = checked_span(start, end).map_err(engine_err)?;
                let quote = engine
                    .quote(vehicle_id, span, &add_on_ids)
                    .await
                    .map_err(engine_err)?;
                let vid = vehicle_id.to_string();
                Ok(rows_response(quote_schema(), std::slice::from_ref(&quote), |enc, q| {
                    enc.encode_field(&vid)?;
                    enc.encode_field(&i64::from(q.days))?;
                    enc.encode_field(&q.base_cost.to_string())?;
                    enc.encode_field(&q.add_ons_total.to_string())?;
                    enc.encode_field(&q.deposit.to_string())?;
                    enc.encode_field(&q.total.to_string())?;
                    enc.encode_field(&ids_json(&q.add_on_ids)?)
                }))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
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

fn encode_vehicle(enc: &mut DataRowEncoder, v: &Vehicle) -> PgWireResult<()> {
    enc.encode_field(&v.id.to_string())?;
    enc.encode_field(&v.name)?;
    enc.encode_field(&v.category)?;
    enc.encode_field(&v.price_per_day.to_string())?;
    enc.encode_field(&v.deposit.to_string())?;
    enc.encode_field(&v.available)
}

fn encode_add_on(enc: &mut DataRowEncoder, a: &AddOn) -> PgWireResult<()> {
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.name)?;
    enc.encode_field(&a.price.to_string())
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.vehicle_id.to_string())?;
    enc.encode_field(&r.customer_id)?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&r.status.as_str().to_string())?;
    enc.encode_field(&i64::from(r.days))?;
    enc.encode_field(&r.base_cost.to_string())?;
    enc.encode_field(&r.add_ons_total.to_string())?;
    enc.encode_field(&r.deposit_amount.to_string())?;
    enc.encode_field(&r.total.to_string())?;
    enc.encode_field(&ids_json(&r.add_on_ids)?)?;
    enc.encode_field(&r.created_at)
}

fn encode_history(enc: &mut DataRowEncoder, h: &HistoryRecord) -> PgWireResult<()> {
    enc.encode_field(&h.id.to_string())?;
    enc.encode_field(&h.reservation_id.to_string())?;
    enc.encode_field(&h.action.as_str().to_string())?;
    enc.encode_field(&h.timestamp)?;
    enc.encode_field(&h.note.clone().unwrap_or_default())
}

fn ids_json(ids: &[Ulid]) -> PgWireResult<String> {
    serde_json::to_string(ids).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn vehicle_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("category", Type::VARCHAR),
        text_field("price_per_day", Type::VARCHAR),
        text_field("deposit", Type::VARCHAR),
        text_field("available", Type::BOOL),
    ]
}

fn add_on_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("price", Type::VARCHAR),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("vehicle_id", Type::VARCHAR),
        text_field("customer_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("days", Type::INT8),
        text_field("base_cost", Type::VARCHAR),
        text_field("add_ons_total", Type::VARCHAR),
        text_field("deposit", Type::VARCHAR),
        text_field("total", Type::VARCHAR),
        text_field("add_on_ids", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn history_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("reservation_id", Type::VARCHAR),
        text_field("action", Type::VARCHAR),
        text_field("timestamp", Type::INT8),
        text_field("note", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("target", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
    ]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        text_field("vehicle_id", Type::VARCHAR),
        text_field("days", Type::INT8),
        text_field("base_cost", Type::VARCHAR),
        text_field("add_ons_total", Type::VARCHAR),
        text_field("deposit", Type::VARCHAR),
        text_field("total", Type::VARCHAR),
        text_field("add_on_ids", Type::VARCHAR),
    ]
}

/// Row shape of a SELECT, judged from its FROM table. Empty for anything else.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut tokens = lower.split_whitespace();
    if tokens.next() != Some("select") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "from")
        .nth(1)
        .map(|t| t.trim_matches(|c: char| c == ';' || c == '"'));
    match table {
        Some("vehicles") => vehicle_schema(),
        Some("add_ons") => add_on_schema(),
        Some("reservations") => reservation_schema(),
        Some("history") => history_schema(),
        Some("availability") => availability_schema(),
        Some("quote") => quote_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for VelocitaHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VelocitaQueryParser;

#[async_trait]
impl QueryParser for VelocitaQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for VelocitaHandler {
    type Statement = String;
    type QueryParser = VelocitaQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the SQL string.
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

/// Inline text-format parameters as quoted literals in one left-to-right
/// pass. Inserted values are never rescanned, so a `$1` inside a bound
/// value stays literal text. Placeholders with no bound value are kept.
fn inline_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let slot = sql[start + 1..i]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        let Some(param) = slot else { continue };

        out.push_str(&sql[copied..start]);
        match param {
            Some(value) => {
                let text = String::from_utf8_lossy(value.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = i;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct VelocitaFactory {
    handler: Arc<VelocitaHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<VelocitaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VelocitaFactory {
    pub fn new(storefronts: Arc<StorefrontManager>, password: String) -> Self {
        let auth_source = VelocitaAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VelocitaHandler::new(storefronts)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VelocitaFactory {
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
    storefronts: Arc<StorefrontManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = VelocitaFactory::new(storefronts, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM add_ons"), 0);
        assert_eq!(count_params("SELECT * FROM reservations WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO history VALUES ($2, $1, $10)"), 10);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO reservations (id, vehicle_id, customer_id) VALUES ($1, $2, $3)";
        let params = [Some("A"), Some("B"), Some("vip$1 o'hara")];
        assert_eq!(
            inline_params(sql, &params),
            "INSERT INTO reservations (id, vehicle_id, customer_id) VALUES ('A', 'B', 'vip$1 o''hara')"
        );
    }

    #[test]
    fn placeholders_resolve_by_full_index() {
        let params: Vec<Option<String>> = (1..=10).map(|n| Some(format!("v{n}"))).collect();
        assert_eq!(inline_params("($1, $10)", &params), "('v1', 'v10')");

        let sparse = [Some("x"), None];
        assert_eq!(inline_params("$2 $1 $3 $ $0", &sparse), "NULL 'x' $3 $ $0");
    }

    #[test]
    fn schema_follows_from_table() {
        assert_eq!(result_schema("SELECT * FROM vehicles").len(), 6);
        assert_eq!(result_schema("select * from quote where vehicle_id = $1").len(), 7);
        assert_eq!(result_schema("SELECT * FROM reservations;").len(), 13);
        assert!(result_schema("INSERT INTO vehicles VALUES ($1)").is_empty());
    }

    #[test]
    fn engine_errors_carry_sqlstate() {
        let e = engine_err(EngineError::DateRangeConflict {
            vehicle_id: Ulid::new(),
            reservation_id: Ulid::new(),
        });
        match e {
            PgWireError::UserError(info) => assert!(format!("{info:?}").contains("23P01")),
            other => panic!("expected UserError, got {other:?}"),
        }
    }
}
