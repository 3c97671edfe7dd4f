//! Domain model shared by every `SquadBoard` crate.
//!
//! Holds the closed role and capability sets, the session shape, the entity
//! schemas with their validator, the error taxonomy, and the seams
//! ([`RowStore`], [`ClientStorage`], [`Authenticator`]) that storage backends
//! implement.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// A row as exchanged with a [`RowStore`]: column name to JSON value.
pub type Row = Map<String, Value>;

/// Key under which the current session is persisted in [`ClientStorage`].
pub const SESSION_STORAGE_KEY: &str = "squad.session";

#[allow(clippy::expect_used)]
static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[a-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-z0-9!#$%&'*+/=?^_`{|}~-]+)*@(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]*[a-z0-9])?$",
    )
    .expect("email pattern is a valid regex")
});

const MAX_EMAIL_LENGTH: usize = 254;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("validation failed: {}", describe_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

fn describe_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|item| item.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailureKind {
    Constraint,
    Connectivity,
    Malformed,
}

impl StoreFailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constraint => "constraint",
            Self::Connectivity => "connectivity",
            Self::Malformed => "malformed",
        }
    }
}

impl Display for StoreFailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection reported by a [`RowStore`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{kind} failure: {message}")]
pub struct StoreFailure {
    pub kind: StoreFailureKind,
    pub message: String,
}

impl StoreFailure {
    pub fn constraint(message: impl Into<String>) -> Self {
        Self {
            kind: StoreFailureKind::Constraint,
            message: message.into(),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self {
            kind: StoreFailureKind::Connectivity,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: StoreFailureKind::Malformed,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RepositoryError {
    #[error("{} {id} not found", kind_label(.kind))]
    NotFound { kind: EntityKind, id: String },
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreFailure),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

fn kind_label(kind: &EntityKind) -> &'static str {
    kind.label()
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuthorizationError {
    #[error("an active session is required for {capability}")]
    Unauthenticated { capability: Capability },
    #[error("role {role} is not granted {capability}")]
    Forbidden { role: Role, capability: Capability },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TimestampError {
    #[error("invalid RFC3339 timestamp: {0}")]
    Parse(String),
    #[error("timestamp MUST use UTC offset Z")]
    NotUtc,
    #[error("failed to format RFC3339 timestamp: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Coach,
    Medical,
    Player,
    Parent,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Self::Admin,
        Self::Coach,
        Self::Medical,
        Self::Player,
        Self::Parent,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Coach => "coach",
            Self::Medical => "medical",
            Self::Player => "player",
            Self::Parent => "parent",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "coach" => Some(Self::Coach),
            "medical" => Some(Self::Medical),
            "player" => Some(Self::Player),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    ViewMembers,
    ManageMembers,
    ViewMedical,
    ManageMedical,
    ViewTraining,
    ManageTraining,
    ViewAssessments,
    ManageAssessments,
    ViewReports,
    ManageUsers,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Self::ViewMembers,
        Self::ManageMembers,
        Self::ViewMedical,
        Self::ManageMedical,
        Self::ViewTraining,
        Self::ManageTraining,
        Self::ViewAssessments,
        Self::ManageAssessments,
        Self::ViewReports,
        Self::ManageUsers,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewMembers => "VIEW_MEMBERS",
            Self::ManageMembers => "MANAGE_MEMBERS",
            Self::ViewMedical => "VIEW_MEDICAL",
            Self::ManageMedical => "MANAGE_MEDICAL",
            Self::ViewTraining => "VIEW_TRAINING",
            Self::ManageTraining => "MANAGE_TRAINING",
            Self::ViewAssessments => "VIEW_ASSESSMENTS",
            Self::ManageAssessments => "MANAGE_ASSESSMENTS",
            Self::ViewReports => "VIEW_REPORTS",
            Self::ManageUsers => "MANAGE_USERS",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an operation reads or writes an entity collection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

/// Store-assigned record identifier.
///
/// Ids minted by the store are ULID text, but lookups accept any string so a
/// stale or mistyped id resolves to "not found" instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Authenticated identity of the current client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user_id: Ulid,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    pub member_id: Option<RecordId>,
    pub avatar_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub signed_in_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Member,
    MedicalRecord,
    TrainingSession,
    SkillAssessment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        Self::Member,
        Self::MedicalRecord,
        Self::TrainingSession,
        Self::SkillAssessment,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::MedicalRecord => "medical_record",
            Self::TrainingSession => "training_session",
            Self::SkillAssessment => "skill_assessment",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }

    /// Human-readable name used in user-facing messages.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::MedicalRecord => "medical record",
            Self::TrainingSession => "training session",
            Self::SkillAssessment => "skill assessment",
        }
    }

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::Member => "members",
            Self::MedicalRecord => "medical_records",
            Self::TrainingSession => "training_sessions",
            Self::SkillAssessment => "skill_assessments",
        }
    }

    /// Logical path of the collection view; detail views append `/<id>`.
    #[must_use]
    pub fn collection_path(self) -> &'static str {
        match self {
            Self::Member => "/members",
            Self::MedicalRecord => "/medical-records",
            Self::TrainingSession => "/training-sessions",
            Self::SkillAssessment => "/skill-assessments",
        }
    }

    /// Field that links a record to its owning member, if any.
    #[must_use]
    pub fn parent_reference(self) -> Option<&'static str> {
        match self {
            Self::MedicalRecord | Self::SkillAssessment => Some("member_id"),
            Self::Member | Self::TrainingSession => None,
        }
    }

    /// Kinds whose records reference this kind and are removed with it.
    #[must_use]
    pub fn dependents(self) -> &'static [EntityKind] {
        match self {
            Self::Member => &[Self::MedicalRecord, Self::SkillAssessment],
            Self::MedicalRecord | Self::TrainingSession | Self::SkillAssessment => &[],
        }
    }

    #[must_use]
    pub fn default_order(self) -> OrderBy {
        match self {
            Self::Member => OrderBy::ascending("name"),
            Self::MedicalRecord => OrderBy::descending("record_date"),
            Self::TrainingSession => OrderBy::descending("session_date"),
            Self::SkillAssessment => OrderBy::descending("assessed_on"),
        }
    }

    #[must_use]
    pub fn schema(self) -> EntitySchema {
        let fields = match self {
            Self::Member => MEMBER_FIELDS,
            Self::MedicalRecord => MEDICAL_RECORD_FIELDS,
            Self::TrainingSession => TRAINING_SESSION_FIELDS,
            Self::SkillAssessment => SKILL_ASSESSMENT_FIELDS,
        };
        EntitySchema { kind: self, fields }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldType {
    Text { max_len: usize },
    Email,
    Integer { min: i64, max: i64 },
    Number { min: f64, max: f64 },
    Enum(&'static [&'static str]),
    /// Calendar date in `YYYY-MM-DD` form.
    Date,
    /// Id of a record of the given kind.
    Reference(EntityKind),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<&'static str>,
}

impl FieldSpec {
    const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: true,
            default: None,
        }
    }

    const fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
            default: None,
        }
    }

    const fn with_default(self, value: &'static str) -> Self {
        Self {
            default: Some(value),
            ..self
        }
    }
}

const POSITIONS: &[&str] = &["goalkeeper", "defender", "midfielder", "forward"];
const MEMBER_STATUSES: &[&str] = &["active", "injured", "inactive"];
const MEDICAL_RECORD_TYPES: &[&str] = &["injury", "illness", "checkup", "vaccination", "other"];
const MEDICAL_SEVERITIES: &[&str] = &["low", "moderate", "high"];
const MEDICAL_STATUSES: &[&str] = &["open", "recovering", "resolved"];
const TRAINING_STATUSES: &[&str] = &["scheduled", "completed", "cancelled"];

const MEMBER_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("name", FieldType::Text { max_len: 120 }),
    FieldSpec::optional("email", FieldType::Email),
    FieldSpec::optional("phone", FieldType::Text { max_len: 40 }),
    FieldSpec::optional("position", FieldType::Enum(POSITIONS)),
    FieldSpec::optional("jersey_number", FieldType::Integer { min: 0, max: 99 }),
    FieldSpec::optional("date_of_birth", FieldType::Date),
    FieldSpec::optional("status", FieldType::Enum(MEMBER_STATUSES)).with_default("active"),
];

const MEDICAL_RECORD_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("member_id", FieldType::Reference(EntityKind::Member)),
    FieldSpec::required("record_type", FieldType::Enum(MEDICAL_RECORD_TYPES)),
    FieldSpec::required("description", FieldType::Text { max_len: 2_000 }),
    FieldSpec::required("record_date", FieldType::Date),
    FieldSpec::optional("severity", FieldType::Enum(MEDICAL_SEVERITIES)),
    FieldSpec::optional("treatment", FieldType::Text { max_len: 2_000 }),
    FieldSpec::optional("expected_return", FieldType::Date),
    FieldSpec::optional("status", FieldType::Enum(MEDICAL_STATUSES)).with_default("open"),
];

const TRAINING_SESSION_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("title", FieldType::Text { max_len: 200 }),
    FieldSpec::required("session_date", FieldType::Date),
    FieldSpec::required("duration_minutes", FieldType::Integer { min: 1, max: 600 }),
    FieldSpec::optional("location", FieldType::Text { max_len: 200 }),
    FieldSpec::optional("focus", FieldType::Text { max_len: 200 }),
    FieldSpec::optional("attendance_count", FieldType::Integer { min: 0, max: 1_000 }),
    FieldSpec::optional("notes", FieldType::Text { max_len: 4_000 }),
    FieldSpec::optional("status", FieldType::Enum(TRAINING_STATUSES)).with_default("scheduled"),
];

const SKILL_ASSESSMENT_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("member_id", FieldType::Reference(EntityKind::Member)),
    FieldSpec::required("skill", FieldType::Text { max_len: 120 }),
    FieldSpec::required("score", FieldType::Number { min: 0.0, max: 10.0 }),
    FieldSpec::required("assessed_on", FieldType::Date),
    FieldSpec::optional("assessor", FieldType::Text { max_len: 120 }),
    FieldSpec::optional("notes", FieldType::Text { max_len: 4_000 }),
];

/// Columns every table carries besides its schema fields.
const STORE_OWNED_COLUMNS: &[&str] = &["id", "created_at", "updated_at"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntitySchema {
    pub kind: EntityKind,
    pub fields: &'static [FieldSpec],
}

impl EntitySchema {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|item| item.name == name)
    }

    /// Columns that may be used for ordering or filtering.
    #[must_use]
    pub fn is_queryable(&self, column: &str) -> bool {
        STORE_OWNED_COLUMNS.contains(&column) || self.field(column).is_some()
    }

    /// Validates raw input against this schema.
    ///
    /// # Errors
    /// Returns [`ValidationError`] listing every violated field in schema
    /// order.
    pub fn validate(
        &self,
        input: &RawInput,
        mode: ValidationMode,
    ) -> Result<NormalizedRecord, ValidationError> {
        let mut fields = Map::new();
        let mut violations = Vec::new();

        for spec in self.fields {
            let supplied = input.supplies(spec.name);
            let value = input
                .value(spec.name)
                .map(str::trim)
                .filter(|raw| !raw.is_empty());

            let Some(raw) = value else {
                if spec.required && (mode == ValidationMode::Create || supplied) {
                    violations.push(FieldViolation::new(
                        spec.name,
                        format!("{} is required", spec.name),
                    ));
                    continue;
                }
                // A blank defaulted field resets to its default; the store
                // never holds null for it.
                let cleared = match (mode, spec.default) {
                    (ValidationMode::Patch, _) if !supplied => None,
                    (_, Some(default)) => Some(Value::String(default.to_string())),
                    (ValidationMode::Create, None) => None,
                    (ValidationMode::Patch, None) => Some(Value::Null),
                };
                if let Some(value) = cleared {
                    fields.insert(spec.name.to_string(), value);
                }
                continue;
            };

            match coerce_field(spec, raw) {
                Ok(coerced) => {
                    fields.insert(spec.name.to_string(), coerced);
                }
                Err(message) => violations.push(FieldViolation::new(spec.name, message)),
            }
        }

        if violations.is_empty() && mode == ValidationMode::Patch && fields.is_empty() {
            violations.push(FieldViolation::new(
                "record",
                "at least one field must be supplied",
            ));
        }

        if !violations.is_empty() {
            return Err(ValidationError { violations });
        }

        Ok(NormalizedRecord {
            kind: self.kind,
            fields,
        })
    }
}

fn coerce_field(spec: &FieldSpec, raw: &str) -> Result<Value, String> {
    let name = spec.name;
    match spec.field_type {
        FieldType::Text { max_len } => {
            if raw.chars().count() > max_len {
                return Err(format!("{name} must be at most {max_len} characters"));
            }
            Ok(Value::String(raw.to_string()))
        }
        FieldType::Email => {
            if raw.len() > MAX_EMAIL_LENGTH || !EMAIL_PATTERN.is_match(raw) {
                return Err(format!("{name} must be a valid email address"));
            }
            Ok(Value::String(raw.to_string()))
        }
        FieldType::Integer { min, max } => {
            let parsed = parse_whole_number(raw)
                .ok_or_else(|| format!("{name} must be a whole number"))?;
            if !(min..=max).contains(&parsed) {
                return Err(format!("{name} must be between {min} and {max}"));
            }
            Ok(Value::Number(parsed.into()))
        }
        FieldType::Number { min, max } => {
            let parsed = raw
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| format!("{name} must be a number"))?;
            if !(min..=max).contains(&parsed) {
                return Err(format!("{name} must be between {min} and {max}"));
            }
            Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| format!("{name} must be a number"))
        }
        FieldType::Enum(allowed) => {
            if !allowed.contains(&raw) {
                return Err(format!("{name} must be one of: {}", allowed.join(", ")));
            }
            Ok(Value::String(raw.to_string()))
        }
        FieldType::Date => {
            let date = parse_calendar_date(raw)
                .ok_or_else(|| format!("{name} must be a date in YYYY-MM-DD format"))?;
            Ok(Value::String(format_calendar_date(date)))
        }
        FieldType::Reference(kind) => {
            let id = Ulid::from_string(raw)
                .map_err(|_| format!("{name} must be a valid {} id", kind.label()))?;
            Ok(Value::String(id.to_string()))
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn parse_whole_number(raw: &str) -> Option<i64> {
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }

    // Accept "7.0" but not "7.5".
    let value = raw.parse::<f64>().ok().filter(|value| value.is_finite())?;
    if value.fract() != 0.0 || value.abs() > 9_007_199_254_740_992.0 {
        return None;
    }
    Some(value as i64)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Full record: required fields enforced, defaults injected.
    Create,
    /// Partial update: only supplied fields are checked.
    Patch,
}

/// Untyped form input: field name to raw string, possibly absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawInput {
    values: BTreeMap<String, Option<String>>,
}

impl RawInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(field.into(), Some(value.into()));
        self
    }

    /// Records a field that the form carried without a value.
    #[must_use]
    pub fn with_absent(mut self, field: impl Into<String>) -> Self {
        self.values.insert(field.into(), None);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Option<String>) {
        self.values.insert(field.into(), value);
    }

    #[must_use]
    pub fn value(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(Option::as_deref)
    }

    /// True when the field was given a value, even an empty one.
    #[must_use]
    pub fn supplies(&self, field: &str) -> bool {
        self.values.get(field).is_some_and(Option::is_some)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawInput {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let values = iter
            .into_iter()
            .map(|(key, value)| (key.into(), Some(value.into())))
            .collect();
        Self { values }
    }
}

/// Output of the validator; the only input a repository accepts for writes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    kind: EntityKind,
    fields: Map<String, Value>,
}

impl NormalizedRecord {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Validates raw input for `kind`; see [`EntitySchema::validate`].
///
/// # Errors
/// Returns [`ValidationError`] when any field rule is violated.
pub fn validate(
    kind: EntityKind,
    input: &RawInput,
    mode: ValidationMode,
) -> Result<NormalizedRecord, ValidationError> {
    kind.schema().validate(input, mode)
}

/// A persisted entity as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub id: RecordId,
    pub kind: EntityKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    /// Builds a record from a store row, keeping only schema fields.
    ///
    /// # Errors
    /// Returns a [`StoreFailureKind::Malformed`] failure when the row lacks
    /// the store-owned columns or carries values of the wrong shape.
    pub fn from_row(kind: EntityKind, row: &Row) -> Result<Self, StoreFailure> {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreFailure::malformed(format!("{} row without id", kind.table())))?;
        let created_at = row_timestamp(row, "created_at")?;
        let updated_at = row_timestamp(row, "updated_at")?;

        let mut fields = Map::new();
        for spec in kind.schema().fields {
            let Some(value) = row.get(spec.name).filter(|value| !value.is_null()) else {
                continue;
            };
            let value = match spec.field_type {
                FieldType::Integer { .. } => value
                    .as_i64()
                    .map(Value::from)
                    .ok_or_else(|| {
                        StoreFailure::malformed(format!("{} is not an integer", spec.name))
                    })?,
                FieldType::Number { .. } => value
                    .as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| {
                        StoreFailure::malformed(format!("{} is not a number", spec.name))
                    })?,
                _ => value.clone(),
            };
            fields.insert(spec.name.to_string(), value);
        }

        Ok(Self {
            id: RecordId::from(id),
            kind,
            created_at,
            updated_at,
            fields,
        })
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    #[must_use]
    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }
}

fn row_timestamp(row: &Row, column: &str) -> Result<OffsetDateTime, StoreFailure> {
    let raw = row
        .get(column)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreFailure::malformed(format!("row without {column}")))?;
    parse_rfc3339_utc(raw).map_err(|err| StoreFailure::malformed(format!("{column}: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// Equality filter on one column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowFilter {
    pub column: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RowQuery {
    pub filters: Vec<RowFilter>,
    pub order: Option<OrderBy>,
}

/// Generic row-level access to the relational store.
///
/// Implementations assign `id`, `created_at` and `updated_at` on insert and
/// refresh `updated_at` on update. Column names reaching a store have already
/// been checked against the entity schema.
pub trait RowStore {
    /// # Errors
    /// Returns [`StoreFailure`] when the store cannot be read.
    fn fetch_one(&self, table: &str, id: &str) -> Result<Option<Row>, StoreFailure>;

    /// # Errors
    /// Returns [`StoreFailure`] when the store cannot be read.
    fn fetch_all(&self, table: &str, query: &RowQuery) -> Result<Vec<Row>, StoreFailure>;

    /// Inserts a row and returns it as written.
    ///
    /// # Errors
    /// Returns [`StoreFailure`] when the store rejects the row.
    fn insert(&mut self, table: &str, values: &Row) -> Result<Row, StoreFailure>;

    /// Updates the named columns; `Ok(None)` when no row has `id`.
    ///
    /// # Errors
    /// Returns [`StoreFailure`] when the store rejects the change.
    fn update(&mut self, table: &str, id: &str, values: &Row) -> Result<Option<Row>, StoreFailure>;

    /// Deletes a row and returns it as it was; `Ok(None)` when no row has `id`.
    ///
    /// # Errors
    /// Returns [`StoreFailure`] when the store rejects the delete.
    fn delete(&mut self, table: &str, id: &str) -> Result<Option<Row>, StoreFailure>;
}

/// Client-local key/value persistence (the browser-storage analogue).
pub trait ClientStorage {
    /// # Errors
    /// Returns [`StoreFailure`] when storage is unreadable.
    fn read(&self, key: &str) -> Result<Option<String>, StoreFailure>;

    /// # Errors
    /// Returns [`StoreFailure`] when storage rejects the write.
    fn write(&mut self, key: &str, value: &str) -> Result<(), StoreFailure>;

    /// # Errors
    /// Returns [`StoreFailure`] when storage rejects the removal.
    fn remove(&mut self, key: &str) -> Result<(), StoreFailure>;
}

pub trait Authenticator {
    /// Verifies credentials and returns a fresh session.
    ///
    /// # Errors
    /// Returns [`AuthError::InvalidCredentials`] for an unknown email or a
    /// wrong password, and [`AuthError::Unavailable`] when the backend fails.
    fn authenticate(&self, email: &str, password: &str) -> Result<Session, AuthError>;
}

#[must_use]
pub fn parse_calendar_date(value: &str) -> Option<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]")).ok()
}

#[must_use]
pub fn format_calendar_date(value: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        value.year(),
        u8::from(value.month()),
        value.day()
    )
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`TimestampError`] when parsing fails or the offset is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TimestampError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError::Parse(err.to_string()))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TimestampError::NotUtc);
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TimestampError::Format`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TimestampError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError::Format(err.to_string()))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
