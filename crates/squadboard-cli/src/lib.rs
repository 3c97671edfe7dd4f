//! Command surface for the `squad` binary.
//!
//! Every invocation opens the `SQLite` database, restores the persisted
//! session and runs one command. Writes go through the mutation pipeline and
//! print its `{success, data|error}` result; a failed action exits non-zero.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use squadboard_actions::{
    training_attendance_report, AttendanceReport, EntityRepository, MutationAction,
    MutationPipeline, RecordingSink, SessionStore,
};
use squadboard_core::{
    Access, Capability, EntityKind, EntityRecord, OrderBy, RawInput, RecordId, Role, Session,
};
use squadboard_policy::{authorize, has_permission, required_capability, resolve_session};
use squadboard_store_sqlite::{NewAccount, SqliteStore};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "squad")]
#[command(about = "SquadBoard team management CLI")]
pub struct Cli {
    #[arg(long, global = true, default_value = "./squadboard.sqlite3")]
    db: PathBuf,

    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Login(LoginArgs),
    Logout,
    Whoami,
    /// Checks whether the signed-in user holds a capability.
    Can {
        capability: String,
    },
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    Member {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Medical {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Training {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Assessment {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
}

#[derive(Debug, Subcommand)]
pub enum AccountCommand {
    /// Creates an account. Open to anyone until the first account exists.
    Add(AccountAddArgs),
}

#[derive(Debug, Args)]
pub struct AccountAddArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    role: RoleArg,
    #[arg(long, value_parser = parse_member_id)]
    member_id: Option<String>,
    #[arg(long)]
    avatar_url: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum EntityCommand {
    List(ListArgs),
    Show(IdArgs),
    Add(FieldArgs),
    Edit(EditArgs),
    Delete(IdArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    order_by: Option<String>,
    #[arg(long)]
    desc: bool,
    #[arg(long, value_parser = parse_member_id)]
    member_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    id: String,
}

#[derive(Debug, Args)]
pub struct FieldArgs {
    #[arg(long = "field", value_name = "KEY=VALUE", value_parser = parse_field)]
    fields: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct EditArgs {
    id: String,
    #[arg(long = "field", value_name = "KEY=VALUE", value_parser = parse_field)]
    fields: Vec<(String, String)>,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Attendance,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Admin,
    Coach,
    Medical,
    Player,
    Parent,
}

struct Workspace {
    repository: EntityRepository<SqliteStore>,
    sessions: SessionStore<SqliteStore>,
}

impl Workspace {
    fn open(db_path: &Path) -> Result<Self> {
        let store = SqliteStore::open_and_migrate(db_path)?;
        let session_storage = SqliteStore::open(db_path)
            .context("failed to open session storage connection")?;
        Ok(Self {
            repository: EntityRepository::new(store),
            sessions: SessionStore::init(session_storage),
        })
    }

    fn session(&self) -> Option<&Session> {
        self.sessions.current()
    }
}

#[derive(Debug, Serialize)]
struct Identity<'a> {
    authenticated: bool,
    session: Option<&'a Session>,
    capabilities: Vec<Capability>,
}

#[derive(Debug, Serialize)]
struct CapabilityCheck {
    capability: Capability,
    granted: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the database cannot be opened, a read or report is
/// not authorized, or a command fails outside the mutation pipeline.
pub fn run_cli(cli: Cli) -> Result<ExitCode> {
    let mut workspace = Workspace::open(&cli.db)?;
    let json = cli.json;

    match cli.command {
        Command::Login(args) => run_login(&mut workspace, &args, json),
        Command::Logout => {
            workspace.sessions.logout()?;
            if json {
                print_json(&serde_json::json!({ "authenticated": false }))?;
            } else {
                println!("signed out");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Whoami => run_whoami(&workspace, json),
        Command::Can { capability } => run_can(&workspace, &capability, json),
        Command::Account { command } => match command {
            AccountCommand::Add(args) => run_account_add(&workspace, args, json),
        },
        Command::Member { command } => run_entity(EntityKind::Member, command, workspace, json),
        Command::Medical { command } => {
            run_entity(EntityKind::MedicalRecord, command, workspace, json)
        }
        Command::Training { command } => {
            run_entity(EntityKind::TrainingSession, command, workspace, json)
        }
        Command::Assessment { command } => {
            run_entity(EntityKind::SkillAssessment, command, workspace, json)
        }
        Command::Report { command } => match command {
            ReportCommand::Attendance => {
                let report = training_attendance_report(&workspace.repository, workspace.session())?;
                if json {
                    print_json(&report)?;
                } else {
                    print_attendance_report(&report);
                }
                Ok(ExitCode::SUCCESS)
            }
        },
    }
}

fn run_login(workspace: &mut Workspace, args: &LoginArgs, json: bool) -> Result<ExitCode> {
    let Workspace {
        repository,
        sessions,
    } = workspace;
    let session = sessions
        .login(repository.store(), &args.email, &args.password)
        .with_context(|| format!("login failed for {}", args.email))?;

    if json {
        print_json(session)?;
    } else {
        println!("signed in as {} ({})", session.display_name, session.role);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_whoami(workspace: &Workspace, json: bool) -> Result<ExitCode> {
    let session = workspace.session();
    let identity = Identity {
        authenticated: session.is_some(),
        session,
        capabilities: resolve_session(session).iter().collect(),
    };

    if json {
        print_json(&identity)?;
        return Ok(ExitCode::SUCCESS);
    }

    match identity.session {
        Some(session) => {
            println!(
                "{} <{}> role={}",
                session.display_name, session.email, session.role
            );
            let names = identity
                .capabilities
                .iter()
                .map(|capability| capability.as_str())
                .collect::<Vec<_>>()
                .join(",");
            println!("capabilities={names}");
        }
        None => println!("not signed in"),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_can(workspace: &Workspace, raw: &str, json: bool) -> Result<ExitCode> {
    let capability = Capability::parse(raw).ok_or_else(|| {
        let known = Capability::ALL
            .iter()
            .map(|item| item.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow!("unknown capability {raw}; expected one of: {known}")
    })?;
    let granted = has_permission(workspace.session(), capability);

    if json {
        print_json(&CapabilityCheck {
            capability,
            granted,
        })?;
    } else {
        println!("{capability}={}", if granted { "granted" } else { "denied" });
    }
    Ok(if granted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_account_add(workspace: &Workspace, args: AccountAddArgs, json: bool) -> Result<ExitCode> {
    let store = workspace.repository.store();
    if store.account_count()? > 0 {
        authorize(workspace.session(), Capability::ManageUsers)?;
    }

    let summary = store.add_account(&NewAccount {
        email: args.email,
        password: args.password,
        display_name: args.display_name,
        role: map_role(args.role),
        member_id: args.member_id.map(RecordId),
        avatar_url: args.avatar_url,
    })?;

    if json {
        print_json(&summary)?;
    } else {
        println!("created account {} ({})", summary.email, summary.role);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_entity(
    kind: EntityKind,
    command: EntityCommand,
    workspace: Workspace,
    json: bool,
) -> Result<ExitCode> {
    match command {
        EntityCommand::List(args) => {
            authorize(workspace.session(), required_capability(kind, Access::Read))?;
            let order = list_order(kind, args.order_by, args.desc);
            let records = match args.member_id {
                Some(member_id) => {
                    let column = kind.parent_reference().ok_or_else(|| {
                        anyhow!("{} records cannot be filtered by member", kind.label())
                    })?;
                    workspace
                        .repository
                        .list_where(kind, column, Value::from(member_id), order)?
                }
                None => workspace.repository.list(kind, order)?,
            };

            if json {
                print_json(&records)?;
            } else {
                print_record_table(kind, &records);
            }
            Ok(ExitCode::SUCCESS)
        }
        EntityCommand::Show(args) => {
            authorize(workspace.session(), required_capability(kind, Access::Read))?;
            let record = workspace.repository.get_by_id(kind, &args.id)?;

            if json {
                print_json(&record)?;
            } else {
                print_record(&record);
            }
            Ok(ExitCode::SUCCESS)
        }
        EntityCommand::Add(args) => run_mutation(
            workspace,
            MutationAction::Create {
                kind,
                input: raw_input(args.fields),
            },
        ),
        EntityCommand::Edit(args) => run_mutation(
            workspace,
            MutationAction::Update {
                kind,
                id: args.id,
                input: raw_input(args.fields),
            },
        ),
        EntityCommand::Delete(args) => {
            run_mutation(workspace, MutationAction::Delete { kind, id: args.id })
        }
    }
}

fn run_mutation(workspace: Workspace, action: MutationAction) -> Result<ExitCode> {
    let Workspace {
        repository,
        sessions,
    } = workspace;
    let mut pipeline = MutationPipeline::new(repository, RecordingSink::default());

    let result = pipeline.dispatch(sessions.current(), action)?;
    for key in pipeline.sink().keys() {
        tracing::debug!(view = %key, "view invalidated");
    }

    print_json(&result)?;
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list_order(kind: EntityKind, column: Option<String>, descending: bool) -> Option<OrderBy> {
    match (column, descending) {
        (Some(column), true) => Some(OrderBy::descending(column)),
        (Some(column), false) => Some(OrderBy::ascending(column)),
        (None, true) => Some(OrderBy::descending(kind.default_order().column)),
        (None, false) => None,
    }
}

fn raw_input(fields: Vec<(String, String)>) -> RawInput {
    fields.into_iter().collect()
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected KEY=VALUE, got {raw}"));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing field name in {raw}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Member ids are stored as canonical ULIDs; accept any casing.
fn parse_member_id(raw: &str) -> Result<String, String> {
    Ulid::from_string(raw.trim())
        .map(|id| id.to_string())
        .map_err(|err| format!("member id must be a ULID: {err}"))
}

fn map_role(value: RoleArg) -> Role {
    match value {
        RoleArg::Admin => Role::Admin,
        RoleArg::Coach => Role::Coach,
        RoleArg::Medical => Role::Medical,
        RoleArg::Player => Role::Player,
        RoleArg::Parent => Role::Parent,
    }
}

fn summary_columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Member => &["name", "position", "jersey_number", "status"],
        EntityKind::MedicalRecord => &["record_date", "record_type", "severity", "status"],
        EntityKind::TrainingSession => &["session_date", "title", "attendance_count", "status"],
        EntityKind::SkillAssessment => &["assessed_on", "skill", "score", "member_id"],
    }
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_record_table(kind: EntityKind, records: &[EntityRecord]) {
    let columns = summary_columns(kind);
    let header = columns
        .iter()
        .map(|column| format!("{column:<20}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{:<26} {header}", "id");
    println!("{}", "-".repeat(27 + 21 * columns.len()));

    for record in records {
        let cells = columns
            .iter()
            .map(|column| format!("{:<20}", display_value(record.get(column))))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{:<26} {cells}", record.id);
    }
}

fn print_record(record: &EntityRecord) {
    println!("{} {}", record.kind.label(), record.id);
    for spec in record.kind.schema().fields {
        println!("  {:<18} {}", spec.name, display_value(record.get(spec.name)));
    }
    println!("  {:<18} {}", "created_at", record.created_at);
    println!("  {:<18} {}", "updated_at", record.updated_at);
}

fn print_attendance_report(report: &AttendanceReport) {
    println!("roster_size={}", report.roster_size);
    println!(
        "{:<12} {:<30} {:<10} {:<10} rate",
        "date", "title", "status", "attended"
    );
    println!("{}", "-".repeat(72));
    for line in &report.sessions {
        println!(
            "{:<12} {:<30} {:<10} {:<10} {}",
            line.session_date,
            line.title,
            line.status.as_deref().unwrap_or("-"),
            line.attendance_count
                .map_or_else(|| "-".to_string(), |value| value.to_string()),
            line.attendance_rate
                .map_or_else(|| "-".to_string(), |value| format!("{:.0}%", value * 100.0))
        );
    }
    if let Some(average) = report.average_rate {
        println!("average={:.0}%", average * 100.0);
    }
}
