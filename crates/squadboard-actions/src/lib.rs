//! Entity repository, session store, view cache and the mutation pipeline.
//!
//! A user-triggered write flows through [`MutationPipeline::dispatch`]:
//! capability check, validation, repository call, view invalidation. Only
//! authorization failures escape as `Err`; everything else becomes an
//! [`ActionResult`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::Serialize;
use serde_json::Value;
use squadboard_core::{
    validate, Access, AuthError, Authenticator, AuthorizationError, Capability, ClientStorage,
    EntityKind, EntityRecord, FieldViolation, NormalizedRecord, OrderBy, RawInput, RecordId,
    RepositoryError, RowFilter, RowQuery, RowStore, Session, StoreFailure, ValidationMode,
    SESSION_STORAGE_KEY,
};
use squadboard_policy::{authorize, required_capability};

/// Per-kind CRUD façade over a [`RowStore`]. Holds no cache.
#[derive(Debug)]
pub struct EntityRepository<S> {
    store: S,
}

impl<S: RowStore> EntityRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Lists every record of `kind`, in `order` or the kind's default order.
    ///
    /// # Errors
    /// Returns [`RepositoryError::InvalidQuery`] for an unknown ordering
    /// column and [`RepositoryError::Persistence`] when the store fails.
    pub fn list(
        &self,
        kind: EntityKind,
        order: Option<OrderBy>,
    ) -> Result<Vec<EntityRecord>, RepositoryError> {
        self.query(kind, Vec::new(), order)
    }

    /// Lists records of `kind` whose `column` equals `value`.
    ///
    /// # Errors
    /// Returns [`RepositoryError::InvalidQuery`] for an unknown filter or
    /// ordering column and [`RepositoryError::Persistence`] when the store
    /// fails.
    pub fn list_where(
        &self,
        kind: EntityKind,
        column: &str,
        value: Value,
        order: Option<OrderBy>,
    ) -> Result<Vec<EntityRecord>, RepositoryError> {
        let filter = RowFilter {
            column: column.to_string(),
            value,
        };
        self.query(kind, vec![filter], order)
    }

    fn query(
        &self,
        kind: EntityKind,
        filters: Vec<RowFilter>,
        order: Option<OrderBy>,
    ) -> Result<Vec<EntityRecord>, RepositoryError> {
        let schema = kind.schema();
        let order = order.unwrap_or_else(|| kind.default_order());

        if !schema.is_queryable(&order.column) {
            return Err(RepositoryError::InvalidQuery(format!(
                "{} cannot be ordered by {}",
                kind.table(),
                order.column
            )));
        }
        if let Some(filter) = filters.iter().find(|item| !schema.is_queryable(&item.column)) {
            return Err(RepositoryError::InvalidQuery(format!(
                "{} cannot be filtered by {}",
                kind.table(),
                filter.column
            )));
        }

        let query = RowQuery {
            filters,
            order: Some(order),
        };
        let rows = self.store.fetch_all(kind.table(), &query)?;
        rows.iter()
            .map(|row| EntityRecord::from_row(kind, row).map_err(RepositoryError::from))
            .collect()
    }

    /// # Errors
    /// Returns [`RepositoryError::NotFound`] when no row has `id`.
    pub fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<EntityRecord, RepositoryError> {
        let row = self
            .store
            .fetch_one(kind.table(), id)?
            .ok_or_else(|| not_found(kind, id))?;
        Ok(EntityRecord::from_row(kind, &row)?)
    }

    /// # Errors
    /// Returns [`RepositoryError::Persistence`] wrapping the store's
    /// rejection.
    pub fn create(&mut self, record: &NormalizedRecord) -> Result<EntityRecord, RepositoryError> {
        let kind = record.kind();
        let row = self.store.insert(kind.table(), record.fields())?;
        Ok(EntityRecord::from_row(kind, &row)?)
    }

    /// Applies a validated partial record to the row with `id`.
    ///
    /// # Errors
    /// Returns [`RepositoryError::NotFound`] when no row has `id` and
    /// [`RepositoryError::Persistence`] when the store rejects the change.
    pub fn update(
        &mut self,
        id: &str,
        partial: &NormalizedRecord,
    ) -> Result<EntityRecord, RepositoryError> {
        let kind = partial.kind();
        let row = self
            .store
            .update(kind.table(), id, partial.fields())?
            .ok_or_else(|| not_found(kind, id))?;
        Ok(EntityRecord::from_row(kind, &row)?)
    }

    /// Deletes the row with `id` and returns it as it was.
    ///
    /// # Errors
    /// Returns [`RepositoryError::NotFound`] when no row has `id`, including
    /// a row deleted earlier.
    pub fn delete(&mut self, kind: EntityKind, id: &str) -> Result<EntityRecord, RepositoryError> {
        let row = self
            .store
            .delete(kind.table(), id)?
            .ok_or_else(|| not_found(kind, id))?;
        Ok(EntityRecord::from_row(kind, &row)?)
    }
}

fn not_found(kind: EntityKind, id: &str) -> RepositoryError {
    RepositoryError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("session storage error: {0}")]
    Storage(#[from] StoreFailure),
    #[error("failed to encode session: {0}")]
    Encode(String),
}

/// Single owner of the current session and its persisted copy.
#[derive(Debug)]
pub struct SessionStore<C> {
    storage: C,
    current: Option<Session>,
}

impl<C: ClientStorage> SessionStore<C> {
    /// Restores the persisted session. Missing, unreadable or malformed
    /// state starts logged out.
    pub fn init(storage: C) -> Self {
        let current = match storage.read(SESSION_STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => Some(session),
                Err(err) => {
                    tracing::warn!(error = %err, "discarding unreadable persisted session");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "session storage unavailable; starting logged out");
                None
            }
        };

        Self { storage, current }
    }

    #[must_use]
    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.current.is_some()
    }

    /// Authenticates and persists the new session.
    ///
    /// # Errors
    /// Returns [`SessionError::Auth`] for rejected credentials and
    /// [`SessionError::Storage`] or [`SessionError::Encode`] when the session
    /// cannot be persisted. On any error the persisted copy is removed too,
    /// so the store is left logged out.
    pub fn login<A: Authenticator>(
        &mut self,
        authenticator: &A,
        email: &str,
        password: &str,
    ) -> Result<&Session, SessionError> {
        self.current = None;

        let session = match self.authenticate_and_persist(authenticator, email, password) {
            Ok(session) => session,
            Err(err) => {
                if let Err(storage_err) = self.storage.remove(SESSION_STORAGE_KEY) {
                    tracing::warn!(error = %storage_err, "failed to clear persisted session");
                }
                return Err(err);
            }
        };

        tracing::info!(user_id = %session.user_id, role = %session.role, "signed in");
        Ok(self.current.insert(session))
    }

    fn authenticate_and_persist<A: Authenticator>(
        &mut self,
        authenticator: &A,
        email: &str,
        password: &str,
    ) -> Result<Session, SessionError> {
        let session = authenticator.authenticate(email, password)?;
        let payload =
            serde_json::to_string(&session).map_err(|err| SessionError::Encode(err.to_string()))?;
        self.storage.write(SESSION_STORAGE_KEY, &payload)?;
        Ok(session)
    }

    /// Clears the session in memory first, then removes the persisted copy.
    ///
    /// # Errors
    /// Returns [`SessionError::Storage`] when the persisted copy cannot be
    /// removed.
    pub fn logout(&mut self) -> Result<(), SessionError> {
        if let Some(session) = self.current.take() {
            tracing::info!(user_id = %session.user_id, "signed out");
        }
        self.storage.remove(SESSION_STORAGE_KEY)?;
        Ok(())
    }

    /// Drops the session for a reason other than an explicit logout.
    ///
    /// # Errors
    /// Returns [`SessionError::Storage`] when the persisted copy cannot be
    /// removed.
    pub fn invalidate(&mut self, reason: &str) -> Result<(), SessionError> {
        if let Some(session) = self.current.take() {
            tracing::warn!(user_id = %session.user_id, reason, "session invalidated");
        }
        self.storage.remove(SESSION_STORAGE_KEY)?;
        Ok(())
    }

    /// Ends the store's lifetime and hands back the storage.
    pub fn teardown(self) -> C {
        self.storage
    }
}

/// Logical address of a view that reads entity data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize)]
#[serde(into = "String")]
pub enum ViewKey {
    Collection(EntityKind),
    Detail(EntityKind, RecordId),
}

impl ViewKey {
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::Collection(kind) => kind.collection_path().to_string(),
            Self::Detail(kind, id) => format!("{}/{id}", kind.collection_path()),
        }
    }
}

impl Display for ViewKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

impl From<ViewKey> for String {
    fn from(value: ViewKey) -> Self {
        value.path()
    }
}

/// Receiver of invalidation signals; the core only emits keys.
pub trait InvalidationSink {
    fn invalidate(&mut self, key: &ViewKey);
}

/// Sink that keeps the emitted keys in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSink {
    keys: Vec<ViewKey>,
}

impl RecordingSink {
    #[must_use]
    pub fn keys(&self) -> &[ViewKey] {
        &self.keys
    }

    pub fn take(&mut self) -> Vec<ViewKey> {
        std::mem::take(&mut self.keys)
    }
}

impl InvalidationSink for RecordingSink {
    fn invalidate(&mut self, key: &ViewKey) {
        self.keys.push(key.clone());
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CachedView {
    List(Vec<EntityRecord>),
    Detail(EntityRecord),
}

/// Read-through cache of list and detail views.
///
/// Entries are served until invalidated; the next read after an
/// invalidation goes back to the repository.
#[derive(Debug, Default)]
pub struct ViewCache {
    entries: BTreeMap<ViewKey, CachedView>,
    invalidated: BTreeSet<ViewKey>,
}

impl ViewCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cached(&self, key: &ViewKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys invalidated since the cache was created or last drained.
    pub fn drain_invalidated(&mut self) -> Vec<ViewKey> {
        std::mem::take(&mut self.invalidated).into_iter().collect()
    }

    /// Collection view in the kind's default order.
    ///
    /// # Errors
    /// Propagates repository failures; nothing is cached on failure.
    pub fn read_list<S: RowStore>(
        &mut self,
        repository: &EntityRepository<S>,
        kind: EntityKind,
    ) -> Result<Vec<EntityRecord>, RepositoryError> {
        let key = ViewKey::Collection(kind);
        if let Some(CachedView::List(records)) = self.entries.get(&key) {
            return Ok(records.clone());
        }

        let records = repository.list(kind, None)?;
        self.entries.insert(key, CachedView::List(records.clone()));
        Ok(records)
    }

    /// # Errors
    /// Propagates repository failures; nothing is cached on failure.
    pub fn read_detail<S: RowStore>(
        &mut self,
        repository: &EntityRepository<S>,
        kind: EntityKind,
        id: &str,
    ) -> Result<EntityRecord, RepositoryError> {
        let key = ViewKey::Detail(kind, RecordId::from(id));
        if let Some(CachedView::Detail(record)) = self.entries.get(&key) {
            return Ok(record.clone());
        }

        let record = repository.get_by_id(kind, id)?;
        self.entries.insert(key, CachedView::Detail(record.clone()));
        Ok(record)
    }
}

impl InvalidationSink for ViewCache {
    fn invalidate(&mut self, key: &ViewKey) {
        self.entries.remove(key);
        self.invalidated.insert(key.clone());
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Validating,
    Persisting,
    Invalidating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationAction {
    Create {
        kind: EntityKind,
        input: RawInput,
    },
    Update {
        kind: EntityKind,
        id: String,
        input: RawInput,
    },
    Delete {
        kind: EntityKind,
        id: String,
    },
}

impl MutationAction {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Create { kind, .. } | Self::Update { kind, .. } | Self::Delete { kind, .. } => {
                *kind
            }
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionError {
    Validation { violations: Vec<FieldViolation> },
    NotFound { message: String },
    Persistence { message: String },
}

impl ActionError {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Validation { violations } => violations
                .iter()
                .map(|item| format!("{}: {}", item.field, item.message))
                .collect::<Vec<_>>()
                .join("; "),
            Self::NotFound { message } | Self::Persistence { message } => message.clone(),
        }
    }
}

/// Uniform outcome of one action: `{success, data}` or `{success, error}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EntityRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    #[serde(skip)]
    pub stages: Vec<PipelineStage>,
}

impl ActionResult {
    fn completed(data: EntityRecord, stages: Vec<PipelineStage>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            stages,
        }
    }

    fn failed(error: ActionError, stages: Vec<PipelineStage>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            stages,
        }
    }
}

struct StageTrace {
    action: &'static str,
    kind: EntityKind,
    stages: Vec<PipelineStage>,
}

impl StageTrace {
    fn start(action: &'static str, kind: EntityKind) -> Self {
        Self {
            action,
            kind,
            stages: vec![PipelineStage::Idle],
        }
    }

    fn enter(&mut self, stage: PipelineStage) {
        tracing::debug!(action = self.action, kind = %self.kind, ?stage, "pipeline stage");
        self.stages.push(stage);
    }

    fn fail(mut self, error: ActionError) -> ActionResult {
        self.enter(PipelineStage::Failed);
        ActionResult::failed(error, self.stages)
    }

    fn complete(mut self, record: EntityRecord) -> ActionResult {
        self.enter(PipelineStage::Completed);
        ActionResult::completed(record, self.stages)
    }
}

/// Orchestrates validate → persist → invalidate for each write.
///
/// Invocations are independent. Two writes to the same id are not
/// coordinated; the store keeps the last one.
#[derive(Debug)]
pub struct MutationPipeline<S, I> {
    repository: EntityRepository<S>,
    sink: I,
}

impl<S: RowStore, I: InvalidationSink> MutationPipeline<S, I> {
    pub fn new(repository: EntityRepository<S>, sink: I) -> Self {
        Self { repository, sink }
    }

    pub fn repository(&self) -> &EntityRepository<S> {
        &self.repository
    }

    pub fn sink(&self) -> &I {
        &self.sink
    }

    /// Borrows the repository and sink together, for read-through views.
    pub fn views(&mut self) -> (&EntityRepository<S>, &mut I) {
        (&self.repository, &mut self.sink)
    }

    pub fn into_parts(self) -> (EntityRepository<S>, I) {
        (self.repository, self.sink)
    }

    /// Runs one action for `session`.
    ///
    /// # Errors
    /// Returns [`AuthorizationError`] when the session lacks the write
    /// capability for the action's kind. Nothing is validated, persisted or
    /// invalidated in that case. Every other failure is reported through
    /// the returned [`ActionResult`].
    pub fn dispatch(
        &mut self,
        session: Option<&Session>,
        action: MutationAction,
    ) -> Result<ActionResult, AuthorizationError> {
        let kind = action.kind();
        let capability: Capability = required_capability(kind, Access::Write);
        if let Err(err) = authorize(session, capability) {
            tracing::error!(action = action.name(), %kind, error = %err, "unauthorized mutation rejected");
            return Err(err);
        }

        let mut trace = StageTrace::start(action.name(), kind);
        let mut stale_elsewhere = Vec::new();
        let persisted = match action {
            MutationAction::Create { kind, input } => {
                trace.enter(PipelineStage::Validating);
                let record = match validate(kind, &input, ValidationMode::Create) {
                    Ok(record) => record,
                    Err(err) => {
                        return Ok(trace.fail(ActionError::Validation {
                            violations: err.violations,
                        }))
                    }
                };
                trace.enter(PipelineStage::Persisting);
                self.repository.create(&record)
            }
            MutationAction::Update { kind, id, input } => {
                trace.enter(PipelineStage::Validating);
                let partial = match validate(kind, &input, ValidationMode::Patch) {
                    Ok(record) => record,
                    Err(err) => {
                        return Ok(trace.fail(ActionError::Validation {
                            violations: err.violations,
                        }))
                    }
                };
                trace.enter(PipelineStage::Persisting);
                stale_elsewhere.extend(self.previous_parent_view(kind, &id, &partial));
                self.repository.update(&id, &partial)
            }
            MutationAction::Delete { kind, id } => {
                trace.enter(PipelineStage::Persisting);
                stale_elsewhere = self.dependent_views(kind, &id);
                self.repository.delete(kind, &id)
            }
        };

        let record = match persisted {
            Ok(record) => record,
            Err(err) => return Ok(trace.fail(user_facing_error(&err))),
        };

        trace.enter(PipelineStage::Invalidating);
        let mut keys = affected_views(&record);
        for key in stale_elsewhere {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        for key in &keys {
            self.sink.invalidate(key);
        }

        tracing::info!(action = trace.action, %kind, id = %record.id, "mutation completed");
        Ok(trace.complete(record))
    }

    /// Detail view of the member that owned the record before `partial`
    /// moves it elsewhere.
    fn previous_parent_view(
        &self,
        kind: EntityKind,
        id: &str,
        partial: &NormalizedRecord,
    ) -> Option<ViewKey> {
        let field = kind.parent_reference()?;
        partial.get(field)?;
        match self.repository.get_by_id(kind, id) {
            Ok(previous) => previous
                .text(field)
                .map(|parent| ViewKey::Detail(EntityKind::Member, RecordId::from(parent))),
            Err(err) => {
                tracing::debug!(%kind, id, error = %err, "no previous owner to invalidate");
                None
            }
        }
    }

    /// Views of records the store removes along with `id`.
    fn dependent_views(&self, kind: EntityKind, id: &str) -> Vec<ViewKey> {
        let mut keys = Vec::new();
        for &dependent in kind.dependents() {
            keys.push(ViewKey::Collection(dependent));
            let Some(field) = dependent.parent_reference() else {
                continue;
            };
            match self
                .repository
                .list_where(dependent, field, Value::from(id), None)
            {
                Ok(records) => keys.extend(
                    records
                        .into_iter()
                        .map(|record| ViewKey::Detail(dependent, record.id)),
                ),
                Err(err) => {
                    tracing::warn!(kind = %dependent, error = %err, "could not list dependents before delete");
                }
            }
        }
        keys
    }
}

fn user_facing_error(err: &RepositoryError) -> ActionError {
    match err {
        RepositoryError::NotFound { .. } => ActionError::NotFound {
            message: err.to_string(),
        },
        RepositoryError::Persistence(cause) => {
            tracing::warn!(cause = %cause, "store rejected mutation");
            ActionError::Persistence {
                message: "the change could not be saved; please try again".to_string(),
            }
        }
        RepositoryError::InvalidQuery(message) => {
            tracing::warn!(%message, "invalid repository query during mutation");
            ActionError::Persistence {
                message: "the change could not be saved; please try again".to_string(),
            }
        }
    }
}

/// Views that read the record: its collection, its detail view, and the
/// owning member's detail view when the kind has one.
fn affected_views(record: &EntityRecord) -> Vec<ViewKey> {
    let mut keys = vec![
        ViewKey::Collection(record.kind),
        ViewKey::Detail(record.kind, record.id.clone()),
    ];

    if let Some(parent) = record
        .kind
        .parent_reference()
        .and_then(|field| record.text(field))
    {
        keys.push(ViewKey::Detail(EntityKind::Member, RecordId::from(parent)));
    }

    keys
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReportError {
    #[error(transparent)]
    Unauthorized(#[from] AuthorizationError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceLine {
    pub session_id: RecordId,
    pub title: String,
    pub session_date: String,
    pub status: Option<String>,
    pub attendance_count: Option<i64>,
    pub attendance_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceReport {
    pub roster_size: usize,
    pub sessions: Vec<AttendanceLine>,
    pub average_rate: Option<f64>,
}

/// Attendance of each training session against the active roster.
///
/// # Errors
/// Returns [`ReportError::Unauthorized`] without `VIEW_REPORTS` and
/// [`ReportError::Repository`] when reads fail.
#[allow(clippy::cast_precision_loss)]
pub fn training_attendance_report<S: RowStore>(
    repository: &EntityRepository<S>,
    session: Option<&Session>,
) -> Result<AttendanceReport, ReportError> {
    authorize(session, Capability::ViewReports)?;

    let roster_size = repository
        .list_where(EntityKind::Member, "status", Value::from("active"), None)?
        .len();
    let trainings = repository.list(EntityKind::TrainingSession, None)?;

    let sessions: Vec<AttendanceLine> = trainings
        .iter()
        .map(|record| {
            let attendance_count = record.get("attendance_count").and_then(Value::as_i64);
            let attendance_rate = match attendance_count {
                Some(count) if roster_size > 0 => Some(count as f64 / roster_size as f64),
                _ => None,
            };
            AttendanceLine {
                session_id: record.id.clone(),
                title: record.text("title").unwrap_or_default().to_string(),
                session_date: record.text("session_date").unwrap_or_default().to_string(),
                status: record.text("status").map(str::to_string),
                attendance_count,
                attendance_rate,
            }
        })
        .collect();

    let rates: Vec<f64> = sessions
        .iter()
        .filter_map(|line| line.attendance_rate)
        .collect();
    let average_rate = if rates.is_empty() {
        None
    } else {
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    };

    Ok(AttendanceReport {
        roster_size,
        sessions,
        average_rate,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use squadboard_core::{Role, Row};
    use std::cell::Cell;
    use std::cmp::Ordering;
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[derive(Debug, Default)]
    struct MemoryRowStore {
        tables: BTreeMap<String, Vec<Row>>,
        fetches: Cell<usize>,
        inserts: usize,
        updates: usize,
        deletes: usize,
        reject_writes: Option<StoreFailure>,
        clock: u64,
    }

    impl MemoryRowStore {
        fn tick(&mut self) -> String {
            self.clock += 1;
            format!("2026-02-07T12:00:{:02}Z", self.clock % 60)
        }

        fn writes(&self) -> usize {
            self.inserts + self.updates + self.deletes
        }
    }

    fn compare_values(lhs: Option<&Value>, rhs: Option<&Value>) -> Ordering {
        match (lhs, rhs) {
            (Some(Value::Number(a)), Some(Value::Number(b))) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
            (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
            (None | Some(Value::Null), Some(_)) => Ordering::Less,
            (Some(_), None | Some(Value::Null)) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }

    impl RowStore for MemoryRowStore {
        fn fetch_one(&self, table: &str, id: &str) -> Result<Option<Row>, StoreFailure> {
            self.fetches.set(self.fetches.get() + 1);
            Ok(self.tables.get(table).and_then(|rows| {
                rows.iter()
                    .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
                    .cloned()
            }))
        }

        fn fetch_all(&self, table: &str, query: &RowQuery) -> Result<Vec<Row>, StoreFailure> {
            self.fetches.set(self.fetches.get() + 1);
            let mut rows: Vec<Row> = self
                .tables
                .get(table)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| {
                            query
                                .filters
                                .iter()
                                .all(|filter| row.get(&filter.column) == Some(&filter.value))
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if let Some(order) = &query.order {
                rows.sort_by(|a, b| {
                    let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                    if order.descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                });
            }
            Ok(rows)
        }

        fn insert(&mut self, table: &str, values: &Row) -> Result<Row, StoreFailure> {
            self.inserts += 1;
            if let Some(failure) = &self.reject_writes {
                return Err(failure.clone());
            }
            let now = self.tick();
            let mut row = values.clone();
            row.insert("id".to_string(), Value::from(Ulid::new().to_string()));
            row.insert("created_at".to_string(), Value::from(now.clone()));
            row.insert("updated_at".to_string(), Value::from(now));
            self.tables
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
            Ok(row)
        }

        fn update(
            &mut self,
            table: &str,
            id: &str,
            values: &Row,
        ) -> Result<Option<Row>, StoreFailure> {
            self.updates += 1;
            if let Some(failure) = &self.reject_writes {
                return Err(failure.clone());
            }
            let now = self.tick();
            let Some(row) = self.tables.get_mut(table).and_then(|rows| {
                rows.iter_mut()
                    .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
            }) else {
                return Ok(None);
            };
            for (column, value) in values {
                row.insert(column.clone(), value.clone());
            }
            row.insert("updated_at".to_string(), Value::from(now));
            Ok(Some(row.clone()))
        }

        fn delete(&mut self, table: &str, id: &str) -> Result<Option<Row>, StoreFailure> {
            self.deletes += 1;
            if let Some(failure) = &self.reject_writes {
                return Err(failure.clone());
            }
            let Some(rows) = self.tables.get_mut(table) else {
                return Ok(None);
            };
            let position = rows
                .iter()
                .position(|row| row.get("id").and_then(Value::as_str) == Some(id));
            Ok(position.map(|index| rows.remove(index)))
        }
    }

    #[derive(Debug, Default)]
    struct MemoryStorage {
        values: BTreeMap<String, String>,
        unavailable: bool,
        writes_fail: bool,
    }

    impl ClientStorage for MemoryStorage {
        fn read(&self, key: &str) -> Result<Option<String>, StoreFailure> {
            if self.unavailable {
                return Err(StoreFailure::connectivity("storage offline"));
            }
            Ok(self.values.get(key).cloned())
        }

        fn write(&mut self, key: &str, value: &str) -> Result<(), StoreFailure> {
            if self.unavailable || self.writes_fail {
                return Err(StoreFailure::connectivity("storage offline"));
            }
            self.values.insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn remove(&mut self, key: &str) -> Result<(), StoreFailure> {
            if self.unavailable {
                return Err(StoreFailure::connectivity("storage offline"));
            }
            self.values.remove(key);
            Ok(())
        }
    }

    struct FixedAuthenticator {
        email: &'static str,
        password: &'static str,
        role: Role,
    }

    impl Authenticator for FixedAuthenticator {
        fn authenticate(&self, email: &str, password: &str) -> Result<Session, AuthError> {
            if email != self.email || password != self.password {
                return Err(AuthError::InvalidCredentials);
            }
            Ok(session_for(self.role))
        }
    }

    fn session_for(role: Role) -> Session {
        Session {
            user_id: Ulid::new(),
            display_name: "Casey".to_string(),
            email: "casey@example.com".to_string(),
            role,
            member_id: None,
            avatar_url: None,
            signed_in_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn fixture_pipeline() -> MutationPipeline<MemoryRowStore, RecordingSink> {
        MutationPipeline::new(
            EntityRepository::new(MemoryRowStore::default()),
            RecordingSink::default(),
        )
    }

    fn member_input(name: &str) -> RawInput {
        RawInput::new().with("name", name)
    }

    fn create_member(
        pipeline: &mut MutationPipeline<MemoryRowStore, RecordingSink>,
        session: &Session,
        name: &str,
    ) -> EntityRecord {
        let result = must(pipeline.dispatch(
            Some(session),
            MutationAction::Create {
                kind: EntityKind::Member,
                input: member_input(name),
            },
        ));
        match result.data {
            Some(record) => record,
            None => panic!("expected created record, got {:?}", result.error),
        }
    }

    #[test]
    fn create_then_get_by_id_returns_normalized_fields() {
        let mut repository = EntityRepository::new(MemoryRowStore::default());
        let input = RawInput::new()
            .with("name", "A. Smith")
            .with("jersey_number", "7")
            .with("email", "a.smith@example.com");
        let record = must(validate(EntityKind::Member, &input, ValidationMode::Create));

        let created = must(repository.create(&record));
        let fetched = must(repository.get_by_id(EntityKind::Member, created.id.as_str()));

        for (field, value) in record.fields() {
            assert_eq!(fetched.get(field), Some(value), "field {field}");
        }
        assert_eq!(fetched, created);
    }

    #[test]
    fn get_update_and_delete_of_missing_id_are_not_found() {
        let mut repository = EntityRepository::new(MemoryRowStore::default());
        let partial = must(validate(
            EntityKind::Member,
            &member_input("X"),
            ValidationMode::Patch,
        ));

        assert!(matches!(
            repository.get_by_id(EntityKind::Member, "missing-id"),
            Err(RepositoryError::NotFound { .. })
        ));
        assert!(matches!(
            repository.update("missing-id", &partial),
            Err(RepositoryError::NotFound { .. })
        ));
        assert!(matches!(
            repository.delete(EntityKind::Member, "missing-id"),
            Err(RepositoryError::NotFound { .. })
        ));
    }

    #[test]
    fn deleting_twice_reports_not_found_the_second_time() {
        let mut repository = EntityRepository::new(MemoryRowStore::default());
        let record = must(validate(
            EntityKind::Member,
            &member_input("Del"),
            ValidationMode::Create,
        ));
        let created = must(repository.create(&record));

        must(repository.delete(EntityKind::Member, created.id.as_str()));
        let second = repository.delete(EntityKind::Member, created.id.as_str());

        assert_eq!(
            second,
            Err(RepositoryError::NotFound {
                kind: EntityKind::Member,
                id: created.id.to_string(),
            })
        );
    }

    #[test]
    fn list_is_empty_not_an_error_and_rejects_unknown_columns() {
        let repository = EntityRepository::new(MemoryRowStore::default());

        assert!(must(repository.list(EntityKind::TrainingSession, None)).is_empty());
        assert!(matches!(
            repository.list(EntityKind::Member, Some(OrderBy::ascending("password"))),
            Err(RepositoryError::InvalidQuery(_))
        ));
        assert!(matches!(
            repository.list_where(EntityKind::Member, "1=1; --", Value::Null, None),
            Err(RepositoryError::InvalidQuery(_))
        ));
    }

    #[test]
    fn list_uses_default_name_order() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);
        for name in ["Zed", "Amy", "Moe"] {
            create_member(&mut pipeline, &admin, name);
        }

        let names: Vec<String> = must(pipeline.repository().list(EntityKind::Member, None))
            .iter()
            .filter_map(|record| record.text("name").map(str::to_string))
            .collect();

        assert_eq!(names, vec!["Amy", "Moe", "Zed"]);
    }

    #[test]
    fn store_rejections_surface_as_persistence_errors() {
        let store = MemoryRowStore {
            reject_writes: Some(StoreFailure::constraint("FOREIGN KEY constraint failed")),
            ..MemoryRowStore::default()
        };
        let mut repository = EntityRepository::new(store);
        let record = must(validate(
            EntityKind::Member,
            &member_input("Fk"),
            ValidationMode::Create,
        ));

        let err = repository.create(&record);

        assert_eq!(
            err,
            Err(RepositoryError::Persistence(StoreFailure::constraint(
                "FOREIGN KEY constraint failed"
            )))
        );
    }

    #[test]
    fn missing_required_field_never_reaches_the_store_for_any_kind() {
        let admin = session_for(Role::Admin);
        for kind in EntityKind::ALL {
            let mut pipeline = fixture_pipeline();

            let created = must(pipeline.dispatch(
                Some(&admin),
                MutationAction::Create {
                    kind,
                    input: RawInput::new(),
                },
            ));
            let required = kind
                .schema()
                .fields
                .iter()
                .find(|spec| spec.required)
                .map(|spec| spec.name)
                .unwrap_or_default();
            let updated = must(pipeline.dispatch(
                Some(&admin),
                MutationAction::Update {
                    kind,
                    id: Ulid::new().to_string(),
                    input: RawInput::new().with(required, ""),
                },
            ));

            assert!(!created.success, "{kind}");
            assert!(!updated.success, "{kind}");
            assert!(matches!(created.error, Some(ActionError::Validation { .. })));
            assert_eq!(pipeline.repository().store().writes(), 0, "{kind}");
            assert!(pipeline.sink().keys().is_empty());
        }
    }

    #[test]
    fn blank_name_and_bad_email_short_circuit_before_the_store() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);

        let result = must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Create {
                kind: EntityKind::Member,
                input: RawInput::new().with("name", "").with("email", "bad"),
            },
        ));

        let Some(ActionError::Validation { violations }) = &result.error else {
            panic!("expected validation error, got {:?}", result.error);
        };
        let fields: Vec<&str> = violations.iter().map(|item| item.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "email"]);
        assert_eq!(
            result.stages,
            vec![
                PipelineStage::Idle,
                PipelineStage::Validating,
                PipelineStage::Failed
            ]
        );
        assert_eq!(pipeline.repository().store().writes(), 0);
        assert_eq!(pipeline.repository().store().fetches.get(), 0);
    }

    #[test]
    fn successful_create_injects_defaults_and_invalidates_views() {
        let mut pipeline = fixture_pipeline();
        let coach = session_for(Role::Coach);

        let result = must(pipeline.dispatch(
            Some(&coach),
            MutationAction::Create {
                kind: EntityKind::Member,
                input: RawInput::new()
                    .with("name", "A. Smith")
                    .with("jersey_number", "7")
                    .with_absent("status"),
            },
        ));

        assert!(result.success);
        let Some(record) = &result.data else {
            panic!("expected record");
        };
        assert_eq!(record.get("status"), Some(&Value::from("active")));
        assert_eq!(record.get("jersey_number"), Some(&Value::from(7)));
        assert_eq!(
            result.stages,
            vec![
                PipelineStage::Idle,
                PipelineStage::Validating,
                PipelineStage::Persisting,
                PipelineStage::Invalidating,
                PipelineStage::Completed
            ]
        );
        assert_eq!(
            pipeline.sink().keys(),
            &[
                ViewKey::Collection(EntityKind::Member),
                ViewKey::Detail(EntityKind::Member, record.id.clone()),
            ]
        );
    }

    #[test]
    fn update_of_missing_id_fails_without_invalidation() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);

        let result = must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Update {
                kind: EntityKind::Member,
                id: "missing-id".to_string(),
                input: member_input("X"),
            },
        ));

        assert!(!result.success);
        let Some(ActionError::NotFound { message }) = &result.error else {
            panic!("expected not found, got {:?}", result.error);
        };
        assert!(message.contains("not found"));
        assert_eq!(
            result.stages,
            vec![
                PipelineStage::Idle,
                PipelineStage::Validating,
                PipelineStage::Persisting,
                PipelineStage::Failed
            ]
        );
        assert!(pipeline.sink().keys().is_empty());
    }

    #[test]
    fn persistence_failures_return_a_generic_message() {
        let store = MemoryRowStore {
            reject_writes: Some(StoreFailure::connectivity("connection reset by peer")),
            ..MemoryRowStore::default()
        };
        let mut pipeline = MutationPipeline::new(EntityRepository::new(store), RecordingSink::default());
        let admin = session_for(Role::Admin);

        let result = must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Create {
                kind: EntityKind::Member,
                input: member_input("Net"),
            },
        ));

        let Some(ActionError::Persistence { message }) = &result.error else {
            panic!("expected persistence error, got {:?}", result.error);
        };
        assert!(!message.contains("connection reset"));
        assert!(pipeline.sink().keys().is_empty());
    }

    #[test]
    fn unauthorized_sessions_are_rejected_before_validation() {
        let mut pipeline = fixture_pipeline();
        let parent = session_for(Role::Parent);

        let logged_out = pipeline.dispatch(
            None,
            MutationAction::Create {
                kind: EntityKind::Member,
                input: member_input("No"),
            },
        );
        let forbidden = pipeline.dispatch(
            Some(&parent),
            MutationAction::Delete {
                kind: EntityKind::MedicalRecord,
                id: Ulid::new().to_string(),
            },
        );

        assert_eq!(
            logged_out,
            Err(AuthorizationError::Unauthenticated {
                capability: Capability::ManageMembers
            })
        );
        assert_eq!(
            forbidden,
            Err(AuthorizationError::Forbidden {
                role: Role::Parent,
                capability: Capability::ManageMedical
            })
        );
        assert_eq!(pipeline.repository().store().writes(), 0);
        assert!(pipeline.sink().keys().is_empty());
    }

    #[test]
    fn medical_record_changes_invalidate_the_member_detail_view() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);
        let member = create_member(&mut pipeline, &admin, "Injured");
        let _ = pipeline.views().1.take();

        let result = must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Create {
                kind: EntityKind::MedicalRecord,
                input: RawInput::new()
                    .with("member_id", member.id.as_str())
                    .with("record_type", "injury")
                    .with("description", "ankle sprain")
                    .with("record_date", "2026-10-01"),
            },
        ));

        assert!(result.success);
        assert!(pipeline
            .sink()
            .keys()
            .contains(&ViewKey::Detail(EntityKind::Member, member.id.clone())));
    }

    fn create_medical_record(
        pipeline: &mut MutationPipeline<MemoryRowStore, RecordingSink>,
        session: &Session,
        member: &EntityRecord,
    ) -> EntityRecord {
        let result = must(pipeline.dispatch(
            Some(session),
            MutationAction::Create {
                kind: EntityKind::MedicalRecord,
                input: RawInput::new()
                    .with("member_id", member.id.as_str())
                    .with("record_type", "checkup")
                    .with("description", "pre-season")
                    .with("record_date", "2026-08-01"),
            },
        ));
        match result.data {
            Some(record) => record,
            None => panic!("expected a created medical record, got {:?}", result.error),
        }
    }

    #[test]
    fn moving_a_record_to_another_member_invalidates_both_owners() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);
        let before = create_member(&mut pipeline, &admin, "Before");
        let after = create_member(&mut pipeline, &admin, "After");
        let record = create_medical_record(&mut pipeline, &admin, &before);
        let _ = pipeline.views().1.take();

        let result = must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Update {
                kind: EntityKind::MedicalRecord,
                id: record.id.to_string(),
                input: RawInput::new().with("member_id", after.id.as_str()),
            },
        ));

        assert!(result.success);
        let keys = pipeline.sink().keys();
        assert!(keys.contains(&ViewKey::Detail(EntityKind::Member, before.id.clone())));
        assert!(keys.contains(&ViewKey::Detail(EntityKind::Member, after.id.clone())));
    }

    #[test]
    fn updating_a_record_in_place_emits_each_view_once() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);
        let member = create_member(&mut pipeline, &admin, "Same");
        let record = create_medical_record(&mut pipeline, &admin, &member);
        let _ = pipeline.views().1.take();

        must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Update {
                kind: EntityKind::MedicalRecord,
                id: record.id.to_string(),
                input: RawInput::new().with("member_id", member.id.as_str()),
            },
        ));

        assert_eq!(
            pipeline.sink().keys(),
            &[
                ViewKey::Collection(EntityKind::MedicalRecord),
                ViewKey::Detail(EntityKind::MedicalRecord, record.id.clone()),
                ViewKey::Detail(EntityKind::Member, member.id.clone()),
            ]
        );
    }

    #[test]
    fn deleting_a_member_invalidates_its_dependent_views() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);
        let member = create_member(&mut pipeline, &admin, "Leaving");
        let record = create_medical_record(&mut pipeline, &admin, &member);
        let _ = pipeline.views().1.take();

        let result = must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Delete {
                kind: EntityKind::Member,
                id: member.id.to_string(),
            },
        ));

        assert!(result.success);
        let keys = pipeline.sink().keys();
        for expected in [
            ViewKey::Collection(EntityKind::Member),
            ViewKey::Collection(EntityKind::MedicalRecord),
            ViewKey::Detail(EntityKind::MedicalRecord, record.id.clone()),
            ViewKey::Collection(EntityKind::SkillAssessment),
        ] {
            assert!(keys.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn delete_skips_validation_and_returns_the_removed_record() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);
        let member = create_member(&mut pipeline, &admin, "Gone");

        let result = must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Delete {
                kind: EntityKind::Member,
                id: member.id.to_string(),
            },
        ));

        assert!(result.success);
        assert_eq!(result.data.map(|record| record.id), Some(member.id));
        assert_eq!(
            result.stages,
            vec![
                PipelineStage::Idle,
                PipelineStage::Persisting,
                PipelineStage::Invalidating,
                PipelineStage::Completed
            ]
        );
    }

    #[test]
    fn last_write_wins_for_the_same_id() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);
        let member = create_member(&mut pipeline, &admin, "Race");

        for name in ["First", "Second"] {
            let result = must(pipeline.dispatch(
                Some(&admin),
                MutationAction::Update {
                    kind: EntityKind::Member,
                    id: member.id.to_string(),
                    input: member_input(name),
                },
            ));
            assert!(result.success);
        }

        let stored = must(
            pipeline
                .repository()
                .get_by_id(EntityKind::Member, member.id.as_str()),
        );
        assert_eq!(stored.text("name"), Some("Second"));
    }

    #[test]
    fn view_cache_refetches_only_after_invalidation() {
        let mut pipeline = MutationPipeline::new(
            EntityRepository::new(MemoryRowStore::default()),
            ViewCache::new(),
        );
        let admin = session_for(Role::Admin);
        let create = |name: &str| MutationAction::Create {
            kind: EntityKind::Member,
            input: member_input(name),
        };
        must(pipeline.dispatch(Some(&admin), create("One")));

        let (repository, cache) = pipeline.views();
        assert_eq!(must(cache.read_list(repository, EntityKind::Member)).len(), 1);
        assert_eq!(must(cache.read_list(repository, EntityKind::Member)).len(), 1);
        assert_eq!(repository.store().fetches.get(), 1);

        must(pipeline.dispatch(Some(&admin), create("Two")));

        let (repository, cache) = pipeline.views();
        assert!(!cache.is_cached(&ViewKey::Collection(EntityKind::Member)));
        assert_eq!(must(cache.read_list(repository, EntityKind::Member)).len(), 2);
        assert_eq!(repository.store().fetches.get(), 2);
        assert!(cache
            .drain_invalidated()
            .contains(&ViewKey::Collection(EntityKind::Member)));
    }

    #[test]
    fn member_detail_is_refetched_after_a_child_record_changes() {
        let mut pipeline = MutationPipeline::new(
            EntityRepository::new(MemoryRowStore::default()),
            ViewCache::new(),
        );
        let coach = session_for(Role::Coach);
        let created = must(pipeline.dispatch(
            Some(&coach),
            MutationAction::Create {
                kind: EntityKind::Member,
                input: member_input("Parent"),
            },
        ));
        let Some(member) = created.data.map(|record| record.id) else {
            panic!("expected created member, got {:?}", created.error);
        };

        let (repository, cache) = pipeline.views();
        must(cache.read_detail(repository, EntityKind::Member, member.as_str()));
        must(cache.read_detail(repository, EntityKind::Member, member.as_str()));
        assert_eq!(repository.store().fetches.get(), 1);

        must(pipeline.dispatch(
            Some(&coach),
            MutationAction::Create {
                kind: EntityKind::SkillAssessment,
                input: RawInput::new()
                    .with("member_id", member.as_str())
                    .with("skill", "dribbling")
                    .with("score", "8")
                    .with("assessed_on", "2026-10-03"),
            },
        ));

        let (repository, cache) = pipeline.views();
        assert!(!cache.is_cached(&ViewKey::Detail(EntityKind::Member, member.clone())));
        must(cache.read_detail(repository, EntityKind::Member, member.as_str()));
        assert_eq!(repository.store().fetches.get(), 2);
    }

    #[test]
    fn view_keys_render_as_paths() {
        let id = RecordId::from("01J0SQQP7M70P6Y3R4T8D8G8M2");

        assert_eq!(ViewKey::Collection(EntityKind::TrainingSession).path(), "/training-sessions");
        assert_eq!(
            ViewKey::Detail(EntityKind::Member, id).to_string(),
            "/members/01J0SQQP7M70P6Y3R4T8D8G8M2"
        );
    }

    #[test]
    fn session_store_persists_login_and_restores_it() {
        let authenticator = FixedAuthenticator {
            email: "coach@example.com",
            password: "whistle",
            role: Role::Coach,
        };
        let mut store = SessionStore::init(MemoryStorage::default());
        assert!(store.current().is_none());

        let role = must(store.login(&authenticator, "coach@example.com", "whistle")).role;
        assert_eq!(role, Role::Coach);

        let restored = SessionStore::init(store.teardown());
        assert_eq!(restored.current().map(|session| session.role), Some(Role::Coach));
    }

    #[test]
    fn failed_login_leaves_the_store_logged_out() {
        let authenticator = FixedAuthenticator {
            email: "coach@example.com",
            password: "whistle",
            role: Role::Coach,
        };
        let mut store = SessionStore::init(MemoryStorage::default());
        must(store.login(&authenticator, "coach@example.com", "whistle"));

        let err = store.login(&authenticator, "coach@example.com", "wrong");

        assert!(matches!(err, Err(SessionError::Auth(AuthError::InvalidCredentials))));
        assert!(!store.is_authenticated());
        assert!(SessionStore::init(store.teardown()).current().is_none());
    }

    #[test]
    fn login_that_cannot_persist_does_not_resurrect_the_previous_user() {
        let coach = FixedAuthenticator {
            email: "coach@example.com",
            password: "whistle",
            role: Role::Coach,
        };
        let parent = FixedAuthenticator {
            email: "mum@example.com",
            password: "snacks",
            role: Role::Parent,
        };
        let mut store = SessionStore::init(MemoryStorage::default());
        must(store.login(&coach, "coach@example.com", "whistle"));

        let mut storage = store.teardown();
        storage.writes_fail = true;
        let mut store = SessionStore::init(storage);
        assert_eq!(store.current().map(|session| session.role), Some(Role::Coach));

        let err = store.login(&parent, "mum@example.com", "snacks");

        assert!(matches!(err, Err(SessionError::Storage(_))));
        assert!(!store.is_authenticated());
        let mut storage = store.teardown();
        assert!(storage.values.get(SESSION_STORAGE_KEY).is_none());
        storage.writes_fail = false;
        assert!(SessionStore::init(storage).current().is_none());
    }

    #[test]
    fn logout_clears_memory_and_persisted_state() {
        let authenticator = FixedAuthenticator {
            email: "doc@example.com",
            password: "stethoscope",
            role: Role::Medical,
        };
        let mut store = SessionStore::init(MemoryStorage::default());
        must(store.login(&authenticator, "doc@example.com", "stethoscope"));

        must(store.logout());

        assert!(store.current().is_none());
        let storage = store.teardown();
        assert!(storage.values.get(SESSION_STORAGE_KEY).is_none());
    }

    #[test]
    fn invalidate_drops_the_session() {
        let authenticator = FixedAuthenticator {
            email: "kid@example.com",
            password: "ball",
            role: Role::Player,
        };
        let mut store = SessionStore::init(MemoryStorage::default());
        must(store.login(&authenticator, "kid@example.com", "ball"));

        must(store.invalidate("account disabled"));

        assert!(!store.is_authenticated());
        assert!(SessionStore::init(store.teardown()).current().is_none());
    }

    #[test]
    fn malformed_or_unavailable_storage_starts_logged_out() {
        let mut garbage = MemoryStorage::default();
        garbage
            .values
            .insert(SESSION_STORAGE_KEY.to_string(), "{not json".to_string());
        let mut unknown_role = MemoryStorage::default();
        unknown_role.values.insert(
            SESSION_STORAGE_KEY.to_string(),
            r#"{"user_id":"01J0SQQP7M70P6Y3R4T8D8G8M2","display_name":"X","email":"x@example.com","role":"owner","member_id":null,"avatar_url":null,"signed_in_at":"2026-02-07T12:00:00Z"}"#.to_string(),
        );
        let offline = MemoryStorage {
            unavailable: true,
            ..MemoryStorage::default()
        };

        assert!(SessionStore::init(garbage).current().is_none());
        assert!(SessionStore::init(unknown_role).current().is_none());
        assert!(SessionStore::init(offline).current().is_none());
    }

    #[test]
    fn attendance_report_rates_sessions_against_active_roster() {
        let mut pipeline = fixture_pipeline();
        let admin = session_for(Role::Admin);
        for name in ["A", "B", "C", "D"] {
            create_member(&mut pipeline, &admin, name);
        }
        must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Create {
                kind: EntityKind::Member,
                input: member_input("Out").with("status", "injured"),
            },
        ));
        must(pipeline.dispatch(
            Some(&admin),
            MutationAction::Create {
                kind: EntityKind::TrainingSession,
                input: RawInput::new()
                    .with("title", "Set pieces")
                    .with("session_date", "2026-10-10")
                    .with("duration_minutes", "90")
                    .with("attendance_count", "3"),
            },
        ));

        let report = must(training_attendance_report(
            pipeline.repository(),
            Some(&admin),
        ));

        assert_eq!(report.roster_size, 4);
        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].attendance_rate, Some(0.75));
        assert_eq!(report.average_rate, Some(0.75));
    }

    #[test]
    fn attendance_report_requires_view_reports() {
        let pipeline = fixture_pipeline();
        let parent = session_for(Role::Parent);

        let result = training_attendance_report(pipeline.repository(), Some(&parent));

        assert!(matches!(result, Err(ReportError::Unauthorized(_))));
    }
}
