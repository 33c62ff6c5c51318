use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::{NoticeResponse, NotificationResponse};
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use ulid::Ulid;

use crate::auth::{Role, SlotLedgerAuthSource};
use crate::engine::{Engine, EngineError, LedgerError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::timeofday::format_time_of_day;
use crate::venue::VenueManager;

/// One `LISTEN resource_{id}` subscription held by a connection.
struct Listener {
    resource_id: Ulid,
    engine: Arc<Engine>,
    rx: broadcast::Receiver<Event>,
}

/// Per-connection handler: the venue comes from the database name, the role
/// from the user name, and LISTEN subscriptions live as long as the
/// connection does.
pub struct SlotLedgerHandler {
    venues: Arc<VenueManager>,
    query_parser: Arc<SlotLedgerQueryParser>,
    listeners: Mutex<HashMap<String, Listener>>,
    pid: i32,
}

impl SlotLedgerHandler {
    pub fn new(venues: Arc<VenueManager>) -> Self {
        Self {
            venues,
            query_parser: Arc::new(SlotLedgerQueryParser),
            listeners: Mutex::new(HashMap::new()),
            pid: std::process::id() as i32,
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.venues.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("venue error: {e}"),
            )))
        })
    }

    fn user<C: ClientInfo>(client: &C) -> String {
        client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Parse, authorize and execute one statement, recording query metrics.
    async fn run<C>(&self, client: &mut C, sql: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let user = Self::user(client);
        let role = Role::for_user(Some(&user));
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        if !role.permits(&cmd) {
            metrics::counter!(observability::PERMISSION_DENIED_TOTAL, "command" => label).increment(1);
            return Err(user_error(
                "42501",
                format!("{} role may not run {label}", role.label()),
            ));
        }

        let started = Instant::now();
        let result = self.execute_command(client, &engine, &user, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());

        self.deliver_notifications(client).await?;
        result
    }

    async fn execute_command<C>(
        &self,
        client: &mut C,
        engine: &Arc<Engine>,
        user: &str,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        match cmd {
            Command::InsertResource {
                id,
                name,
                hourly_rate,
                base_coins,
                slot_minutes,
            } => {
                engine
                    .create_resource(id, name, hourly_rate, base_coins, slot_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource {
                id,
                name,
                hourly_rate,
                base_coins,
                slot_minutes,
                active,
            } => {
                let mut changed = false;
                if name.is_some() || hourly_rate.is_some() || base_coins.is_some() || slot_minutes.is_some() {
                    let current = engine.resource(id).await.map_err(engine_err)?;
                    engine
                        .update_resource(
                            id,
                            name.unwrap_or(current.name),
                            hourly_rate.unwrap_or(current.hourly_rate),
                            base_coins.unwrap_or(current.base_coins_per_session),
                            slot_minutes.unwrap_or(current.slot_minutes),
                        )
                        .await
                        .map_err(engine_err)?;
                    changed = true;
                }
                if let Some(active) = active {
                    changed |= engine.set_resource_active(id, active).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(changed as usize))])
            }
            Command::InsertReservation {
                id,
                resource_id,
                date,
                slot_start,
                customer_key,
                customer_name,
            } => {
                let receipt = engine
                    .create_reservation(id, resource_id, date, slot_start, customer_key, customer_name)
                    .await
                    .map_err(engine_err)?;
                send_warnings(client, &receipt.warnings).await?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateReservationStatus { id, status } => {
                let changed = engine
                    .set_reservation_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(changed as usize))])
            }
            Command::InsertCounterBooking(new) => {
                let receipt = engine.create_counter_booking(new).await.map_err(engine_err)?;
                send_warnings(client, &receipt.warnings).await?;
                let schema = Arc::new(receipt_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&receipt.id.to_string())?;
                encoder.encode_field(&i64::from(receipt.serial))?;
                encoder.encode_field(&receipt.settlement.label())?;
                encoder.encode_field(&(receipt.warnings.len() as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::UpdateCounterTimes { id, start, end } => {
                let current = engine.counter_booking(id).await.map_err(engine_err)?;
                let span = Span::new(start.unwrap_or(current.span.start), end.unwrap_or(current.span.end));
                let warnings = engine.update_counter_times(id, span).await.map_err(engine_err)?;
                send_warnings(client, &warnings).await?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateCounterPayment { id, update } => {
                engine
                    .update_counter_payment(id, update)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CloseCounterSession { id } => {
                let changed = engine.close_counter_session(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(changed as usize))])
            }
            Command::DeleteCounterBooking { id } => {
                engine.delete_counter_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::ImportLegacy { records } => {
                let report = engine
                    .migrate_legacy_counter_bookings(records)
                    .await
                    .map_err(engine_err)?;
                for (id, reason) in &report.skipped {
                    send_notice(client, format!("legacy booking {id} skipped: {reason}")).await?;
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(report.migrated.len()))])
            }
            Command::InsertAdjustment {
                operation_id,
                customer_key,
                coins,
                reason,
            } => {
                let ctx = ActorContext::new(user);
                let result = engine
                    .adjust_balance(&ctx, operation_id, &customer_key, coins, &reason)
                    .await
                    .map_err(ledger_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(result.applied as usize))])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.hourly_rate)?;
                        encoder.encode_field(&i64::from(r.base_coins_per_session))?;
                        encoder.encode_field(&i64::from(r.slot_minutes))?;
                        encoder.encode_field(&r.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability {
                resource_id,
                date,
                slot_start,
                duration,
            } => {
                let resource = engine.resource(resource_id).await.map_err(engine_err)?;
                let duration = duration.unwrap_or(resource.slot_minutes);
                let slots: Vec<(u32, bool)> = match slot_start {
                    Some(start) => {
                        let free = engine
                            .is_available(resource_id, date, start, duration)
                            .await
                            .map_err(engine_err)?;
                        vec![(start, free)]
                    }
                    None => engine
                        .free_slots(resource_id, date)
                        .await
                        .map_err(engine_err)?
                        .into_iter()
                        .map(|start| (start, true))
                        .collect(),
                };

                let schema = Arc::new(availability_schema());
                let rid_str = resource_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|(start, free)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&format_time_of_day(start))?;
                        encoder.encode_field(&i64::from(duration))?;
                        encoder.encode_field(&free)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectConflicts {
                resource_id,
                date,
                span,
                exclude,
            } => {
                let entries = engine
                    .conflicts(resource_id, date, span, exclude)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(conflicts_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.booking_id.to_string())?;
                        encoder.encode_field(&c.channel.label())?;
                        encoder.encode_field(&c.customer_name)?;
                        encoder.encode_field(&format_time_of_day(c.start))?;
                        encoder.encode_field(&format_time_of_day(c.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectReservations { resource_id, date } => {
                let bookings = engine.reservations(resource_id, date).await.map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&r.date.to_string())?;
                        encoder.encode_field(&format_time_of_day(r.slot.start))?;
                        encoder.encode_field(&format_time_of_day(r.slot.end))?;
                        encoder.encode_field(&r.customer_key)?;
                        encoder.encode_field(&r.customer_name)?;
                        encoder.encode_field(&r.status.label())?;
                        encoder.encode_field(&r.awarded)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectCounterBookings { date } => {
                let bookings = engine.counter_bookings(date).await;
                let schema = Arc::new(counter_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&i64::from(c.serial))?;
                        encoder.encode_field(&c.resource_id.to_string())?;
                        encoder.encode_field(&c.date.to_string())?;
                        encoder.encode_field(&format_time_of_day(c.span.start))?;
                        encoder.encode_field(&format_time_of_day(c.span.end))?;
                        encoder.encode_field(&c.customer_name)?;
                        encoder.encode_field(&c.customer_key)?;
                        encoder.encode_field(&c.payment.amount)?;
                        encoder.encode_field(&c.payment.discount)?;
                        encoder.encode_field(&c.payment.cash_paid)?;
                        encoder.encode_field(&c.payment.digital_paid)?;
                        encoder.encode_field(&c.settlement().label())?;
                        encoder.encode_field(&c.session.label())?;
                        encoder.encode_field(&c.awarded)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectCustomer { customer_key } => {
                let schema = Arc::new(customer_schema());
                let projection = engine.lookup_customer(&customer_key).await;
                let rows: Vec<PgWireResult<_>> = projection
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.display_name)?;
                        encoder.encode_field(&p.has_balance)?;
                        encoder.encode_field(&(p.booking_count as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAccount { customer_key } => {
                let schema = Arc::new(account_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .account(&customer_key)
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.customer_key)?;
                        encoder.encode_field(&a.display_name)?;
                        encoder.encode_field(&a.balance)?;
                        encoder.encode_field(&a.updated_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAudit { customer_key } => {
                let schema = Arc::new(audit_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .audit_log(customer_key.as_deref())
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.kind.label())?;
                        encoder.encode_field(&a.customer_key)?;
                        encoder.encode_field(&a.coins)?;
                        encoder.encode_field(&a.balance_after)?;
                        encoder.encode_field(&a.booking_id.map(|id| id.to_string()))?;
                        encoder.encode_field(&a.reason)?;
                        encoder.encode_field(&a.actor)?;
                        encoder.encode_field(&a.at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { channel } => {
                let resource_id = parse_channel(&channel)?;
                let mut listeners = self.listeners.lock().await;
                if !listeners.contains_key(&channel) {
                    let rx = engine.notify.subscribe(resource_id);
                    listeners.insert(channel, Listener { resource_id, engine: engine.clone(), rx });
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                if let Some(listener) = self.listeners.lock().await.remove(&channel) {
                    release(listener);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                let drained: Vec<Listener> = self.listeners.lock().await.drain().map(|(_, l)| l).collect();
                drained.into_iter().for_each(release);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Forward events committed since the last statement to this connection's
    /// LISTEN channels. Delivery happens at statement boundaries; an idle
    /// listener picks them up with its next command.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut listeners = self.listeners.lock().await;
            let mut pending = Vec::new();
            for (channel, listener) in listeners.iter_mut() {
                loop {
                    match listener.rx.try_recv() {
                        Ok(event) => pending.push((channel.clone(), event)),
                        Err(TryRecvError::Lagged(missed)) => {
                            tracing::warn!("listener on {channel} lagged, {missed} notifications dropped");
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }
            }
            pending
        };
        for (channel, event) in pending {
            let payload = notification_payload(&event);
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    self.pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }
}

impl Drop for SlotLedgerHandler {
    fn drop(&mut self) {
        for (_, listener) in self.listeners.get_mut().drain() {
            release(listener);
        }
    }
}

fn release(listener: Listener) {
    let Listener { resource_id, engine, rx } = listener;
    drop(rx);
    engine.notify.prune(&resource_id);
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let resource_id_str = channel.strip_prefix("resource_").ok_or_else(|| {
        user_error("42000", format!("invalid channel: {channel} (expected resource_{{id}})"))
    })?;
    Ulid::from_string(resource_id_str).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

/// `{"event": "<kind>", "data": {...}}`
pub fn notification_payload(event: &Event) -> String {
    serde_json::json!({ "event": event.kind(), "data": event }).to_string()
}

async fn send_notice<C>(client: &mut C, message: String) -> PgWireResult<()>
where
    C: Sink<PgWireBackendMessage> + Unpin + Send,
    C::Error: Debug,
    PgWireError: From<C::Error>,
{
    let notice = NoticeResponse::new(vec![
        (b'S', "WARNING".to_string()),
        (b'V', "WARNING".to_string()),
        (b'C', "01000".to_string()),
        (b'M', message),
    ]);
    client.send(PgWireBackendMessage::NoticeResponse(notice)).await?;
    Ok(())
}

/// Overlaps accepted under the advisory policy go back as notices.
async fn send_warnings<C>(client: &mut C, warnings: &[ConflictEntry]) -> PgWireResult<()>
where
    C: Sink<PgWireBackendMessage> + Unpin + Send,
    C::Error: Debug,
    PgWireError: From<C::Error>,
{
    for warning in warnings {
        send_notice(client, warning.to_string()).await?;
    }
    Ok(())
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn flag(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![text("id"), int("serial"), text("settlement"), int("warnings")]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        int("hourly_rate"),
        int("base_coins"),
        int("slot_minutes"),
        flag("active"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text("resource_id"),
        text("date"),
        text("slot_start"),
        int("duration"),
        flag("available"),
    ]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        text("booking_id"),
        text("channel"),
        text("customer_name"),
        text("start_time"),
        text("end_time"),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("resource_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        text("customer_key"),
        text("customer_name"),
        text("status"),
        flag("awarded"),
    ]
}

fn counter_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        int("serial"),
        text("resource_id"),
        text("date"),
        text("start_time"),
        text("end_time"),
        text("customer_name"),
        text("customer_key"),
        int("amount"),
        int("discount"),
        int("cash_paid"),
        int("digital_paid"),
        text("settlement"),
        text("session"),
        flag("awarded"),
    ]
}

fn customer_schema() -> Vec<FieldInfo> {
    vec![text("display_name"), flag("has_balance"), int("booking_count")]
}

fn account_schema() -> Vec<FieldInfo> {
    vec![text("customer_key"), text("display_name"), int("balance"), int("updated_at")]
}

fn audit_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("kind"),
        text("customer_key"),
        int("coins"),
        int("balance_after"),
        text("booking_id"),
        text("reason"),
        text("actor"),
        int("at"),
    ]
}

/// Result columns for a statement, judged from its text alone so it works on
/// unbound `$n` statements too.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|w| w.trim_end_matches(';').trim_matches('"'))
    };
    match words.first().copied() {
        Some("SELECT") => match after("FROM") {
            Some("RESOURCES") => resources_schema(),
            Some("AVAILABILITY") => availability_schema(),
            Some("CONFLICTS") => conflicts_schema(),
            Some("RESERVATIONS") => reservations_schema(),
            Some("COUNTER_BOOKINGS") => counter_schema(),
            Some("CUSTOMERS") => customer_schema(),
            Some("ACCOUNTS") => account_schema(),
            Some("AUDIT_LOG") => audit_schema(),
            _ => vec![],
        },
        Some("INSERT") if after("INTO").is_some_and(|t| t.starts_with("COUNTER_BOOKINGS")) => receipt_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotLedgerHandler {
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
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotLedgerQueryParser;

#[async_trait]
impl QueryParser for SlotLedgerQueryParser {
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
impl ExtendedQueryHandler for SlotLedgerHandler {
    type Statement = String;
    type QueryParser = SlotLedgerQueryParser;

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
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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
        Ok(DescribeStatementResponse::new(param_types, statement_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(statement_schema(&target.statement.statement)))
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

    // Highest index first so `$1` never clobbers the prefix of `$10`.
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

pub struct SlotLedgerFactory {
    handler: Arc<SlotLedgerHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotLedgerAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotLedgerFactory {
    pub fn new(venues: Arc<VenueManager>, auth_source: SlotLedgerAuthSource) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotLedgerHandler::new(venues)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotLedgerFactory {
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

/// Serve one client connection. The factory, and with it every LISTEN
/// subscription, lives exactly as long as the socket.
pub async fn process_connection(
    socket: TcpStream,
    venues: Arc<VenueManager>,
    auth_source: SlotLedgerAuthSource,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotLedgerFactory::new(venues, auth_source));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

pub fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) | EngineError::UnknownResourceName(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::DuplicateName(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::Immutable { .. } | EngineError::Inactive(_) => "55000",
        EngineError::Validation(_) | EngineError::BadTime(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

pub fn ledger_sqlstate(e: &LedgerError) -> &'static str {
    match e {
        LedgerError::Validation(_) => "22023",
        LedgerError::NotFound(_) => "P0002",
        LedgerError::InsufficientBalance { .. } => "23514",
        LedgerError::Transient(_) => "40001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn ledger_err(e: LedgerError) -> PgWireError {
    user_error(ledger_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
