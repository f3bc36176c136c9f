use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use oraculo_api::{AskRequest, OraculoApi, OraculoConfig};
use oraculo_core::{
    add_tag, remove_tag, CategoryId, ConversationId, ProcedureDraft, ProcedureId, ProcedureStatus, ProfileFilter,
    ProfileQuery, Role, SessionUser,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "oraculo=info";

#[derive(Debug, Parser)]
#[command(name = "oraculo")]
#[command(about = "Operator CLI for the Oraculo procedure assistant")]
struct Cli {
    /// YAML configuration file; `--db` overrides its database path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Category {
        #[command(subcommand)]
        command: CategoryCommand,
    },
    Procedure {
        #[command(subcommand)]
        command: Box<ProcedureCommand>,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Run one conversational turn on behalf of an existing user.
    Ask(AskArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CategoryCommand {
    Add {
        #[arg(long)]
        name: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum ProcedureCommand {
    Add(ProcedureAddArgs),
    List(ProcedureListArgs),
    Archive {
        #[arg(long)]
        id: String,
    },
    /// Edit the tag list of an existing procedure.
    Tag(ProcedureTagArgs),
}

#[derive(Debug, Args)]
struct ProcedureTagArgs {
    #[arg(long)]
    id: String,
    #[arg(long = "add")]
    add: Vec<String>,
    #[arg(long = "remove")]
    remove: Vec<String>,
}

#[derive(Debug, Args)]
struct ProcedureAddArgs {
    #[arg(long)]
    title: String,
    /// Markdown body given inline.
    #[arg(long, conflicts_with = "content_file")]
    content: Option<String>,
    /// Markdown body read from a file.
    #[arg(long)]
    content_file: Option<PathBuf>,
    #[arg(long, default_value = "")]
    summary: String,
    #[arg(long)]
    category_id: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum, default_value_t = StatusArg::Active)]
    status: StatusArg,
}

#[derive(Debug, Args)]
struct ProcedureListArgs {
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    /// Case-insensitive match on title or summary.
    #[arg(long)]
    query: Option<String>,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add(UserAddArgs),
    List,
    SetRole {
        #[arg(long)]
        email: String,
        #[arg(long, value_enum)]
        role: RoleArg,
    },
}

#[derive(Debug, Args)]
struct UserAddArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    full_name: String,
    #[arg(long, value_enum, default_value_t = RoleArg::User)]
    role: RoleArg,
}

#[derive(Debug, Args)]
struct AskArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    question: String,
    #[arg(long)]
    conversation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Draft,
    Archived,
}

impl From<StatusArg> for ProcedureStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Active => Self::Active,
            StatusArg::Draft => Self::Draft,
            StatusArg::Archived => Self::Archived,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Admin,
    User,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Admin => Self::Admin,
            RoleArg::User => Self::User,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = build_api(&cli)?;
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Category { command } => run_category(command, &api),
        Command::Procedure { command } => run_procedure(*command, &api),
        Command::User { command } => run_user(command, &api),
        Command::Ask(args) => run_ask(&args, &api),
    }
}

fn build_api(cli: &Cli) -> Result<OraculoApi> {
    let mut config = match &cli.config {
        Some(path) => OraculoConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => OraculoConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db.clone_from(db);
    }
    config.build_api().context("failed to wire collaborators")
}

fn run_db(command: DbCommand, api: &OraculoApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::Backup(args) => {
            api.migrate(false)?;
            api.backup(&args.out)?;
            tracing::info!(out = %args.out.display(), "database backed up");
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
    }
}

fn run_category(command: CategoryCommand, api: &OraculoApi) -> Result<()> {
    match command {
        CategoryCommand::Add { name } => {
            let category = api.create_category(&name)?;
            emit_json(serde_json::to_value(&category)?)
        }
        CategoryCommand::List => {
            let categories = api.list_categories()?;
            emit_json(serde_json::json!({ "categories": categories }))
        }
    }
}

fn run_procedure(command: ProcedureCommand, api: &OraculoApi) -> Result<()> {
    match command {
        ProcedureCommand::Add(args) => {
            let content_md = match (args.content, &args.content_file) {
                (Some(content), _) => content,
                (None, Some(path)) => fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => return Err(anyhow!("one of --content or --content-file is required")),
            };
            let category_id = args
                .category_id
                .as_deref()
                .map(CategoryId::parse)
                .transpose()?;
            let procedure = api.create_procedure(ProcedureDraft {
                title: args.title,
                category_id,
                status: args.status.into(),
                content_md,
                summary: args.summary,
                tags: args.tags,
                attachments: Vec::new(),
                version: 1,
            })?;
            emit_json(serde_json::to_value(&procedure)?)
        }
        ProcedureCommand::List(args) => {
            let procedures = api.search_procedures(
                args.query.as_deref().unwrap_or_default(),
                args.status.map(ProcedureStatus::from),
                None,
            )?;
            emit_json(serde_json::json!({ "procedures": procedures }))
        }
        ProcedureCommand::Archive { id } => {
            let id = ProcedureId::parse(&id)?;
            let current =
                api.get_procedure(id)?.ok_or_else(|| anyhow!("procedure not found: {id}"))?;
            let archived = api.update_procedure(
                id,
                ProcedureDraft { status: ProcedureStatus::Archived, ..current.into() },
            )?;
            tracing::info!(procedure_id = %id, "procedure archived");
            emit_json(serde_json::to_value(&archived)?)
        }
        ProcedureCommand::Tag(args) => {
            let id = ProcedureId::parse(&args.id)?;
            let current =
                api.get_procedure(id)?.ok_or_else(|| anyhow!("procedure not found: {id}"))?;
            let mut draft = ProcedureDraft::from(current);
            for tag in &args.remove {
                if !remove_tag(&mut draft.tags, tag.trim()) {
                    tracing::warn!(procedure_id = %id, tag = %tag, "tag not present");
                }
            }
            for tag in &args.add {
                add_tag(&mut draft.tags, tag);
            }
            let updated = api.update_procedure(id, draft)?;
            emit_json(serde_json::to_value(&updated)?)
        }
    }
}

fn run_user(command: UserCommand, api: &OraculoApi) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            let mut profile = api.sign_up(&args.email, &args.password, &args.full_name)?;
            let role = Role::from(args.role);
            if profile.role != role {
                profile = api.set_user_role(&profile.email, role)?;
            }
            emit_json(serde_json::to_value(&profile)?)
        }
        UserCommand::List => {
            let users = api.list_users(ProfileQuery::all())?;
            emit_json(serde_json::json!({ "users": users }))
        }
        UserCommand::SetRole { email, role } => {
            let profile = api.set_user_role(&email, role.into())?;
            emit_json(serde_json::to_value(&profile)?)
        }
    }
}

fn run_ask(args: &AskArgs, api: &OraculoApi) -> Result<()> {
    let email = args.email.trim().to_lowercase();
    let user = api
        .list_users(ProfileQuery::all().filter(ProfileFilter::Email(email.clone())))?
        .into_iter()
        .next()
        .map(SessionUser::from)
        .ok_or_else(|| anyhow!("no user with email {email}"))?;
    let conversation_id = args.conversation_id.as_deref().map(ConversationId::parse).transpose()?;
    if let Some(id) = conversation_id {
        match api.get_conversation(id)? {
            Some(conversation) if conversation.user_email == user.email => {}
            _ => return Err(anyhow!("conversation not found: {id}")),
        }
    }

    let answer =
        api.answer(&user, AskRequest { question: args.question.clone(), conversation_id })?;
    emit_json(serde_json::to_value(&answer)?)
}
