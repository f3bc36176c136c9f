use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use oraculo_api::{
    mime_for_object, AskRequest, AuthError, OraculoApi, OraculoConfig, Session, TurnAnswer,
    TurnFailure, TurnStage, UploadedFile, API_CONTRACT_VERSION,
};
use oraculo_core::{
    Category, CategoryId, Conversation, ConversationFilter, ConversationId, ConversationQuery,
    ConversationSort, DomainError, Message, MessageFilter, MessageQuery, MessageSort, Order, Procedure,
    ProcedureDraft, ProcedureId, ProcedureSort, ProcedureStatus, Profile, Role, SessionUser,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const DEFAULT_LOG_FILTER: &str = "oraculo=info";

#[derive(Debug, Clone)]
struct ServiceState {
    api: OraculoApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn: Option<Box<TurnFailure>>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct SignUpRequest {
    email: String,
    password: String,
    full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SignInRequest {
    email: String,
    password: String,
}

#[derive(Debug, Clone, Serialize)]
struct LogoutResponse {
    logged_out: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OrderParams {
    order: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProcedureListParams {
    q: Option<String>,
    status: Option<String>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ActiveCountResponse {
    count: usize,
}

#[derive(Debug, Clone, Serialize)]
struct DeletedResponse {
    deleted: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CategoryRequest {
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UserListParams {
    q: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SetRoleRequest {
    email: String,
    role: Role,
}

#[derive(Debug, Clone, Deserialize)]
struct UploadParams {
    file_name: String,
}

#[derive(Debug, Parser)]
#[command(name = "oraculo-service")]
#[command(about = "Local HTTP service for the Oraculo procedure assistant")]
struct Args {
    /// YAML configuration file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    bind: Option<SocketAddr>,
    #[arg(long)]
    storage_root: Option<PathBuf>,
    #[arg(long)]
    public_base_url: Option<String>,
    #[arg(long)]
    llm_endpoint: Option<String>,
}

impl Args {
    fn resolve_config(&self) -> Result<OraculoConfig> {
        let mut config = match &self.config {
            Some(path) => OraculoConfig::from_path(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => OraculoConfig::default(),
        };
        if let Some(db) = &self.db {
            config.db.clone_from(db);
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(root) = &self.storage_root {
            config.storage.root.clone_from(root);
        }
        if let Some(url) = &self.public_base_url {
            config.storage.public_base_url.clone_from(url);
        }
        if let Some(endpoint) = &self.llm_endpoint {
            config.llm.endpoint = Some(endpoint.clone());
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            turn: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Store and collaborator errors pass through verbatim. Typed domain errors pick
    /// the status; anything else is a backend fault.
    fn backend(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        match err.downcast_ref::<DomainError>() {
            Some(DomainError::NotFound { .. }) => Self::not_found(message),
            Some(DomainError::Validation(_) | DomainError::Query(_)) => Self::bad_request(message),
            None => {
                tracing::error!(error = %message, "backend call failed");
                Self::internal(message)
            }
        }
    }
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials | AuthError::Unauthenticated => {
                Self::unauthorized(err.to_string())
            }
            AuthError::EmailTaken(_) | AuthError::Validation(_) => Self::bad_request(err.to_string()),
            AuthError::Backend(inner) => Self::backend(&inner),
        }
    }
}

impl From<Box<TurnFailure>> for ServiceError {
    fn from(failure: Box<TurnFailure>) -> Self {
        let status = if failure.stage == TurnStage::ValidateQuestion {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::BAD_GATEWAY
        };
        let message = failure.to_string();
        Self { turn: Some(failure), ..Self::new(status, message) }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

/// Run a blocking façade call off the async executor.
async fn run_blocking<T, F>(task: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result,
        Err(err) => Err(ServiceError::internal(format!("blocking task failed: {err}"))),
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<String, ServiceError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ServiceError::unauthorized("missing bearer token"))
}

async fn authenticate(state: &ServiceState, headers: &HeaderMap) -> Result<SessionUser, ServiceError> {
    let token = bearer_token(headers)?;
    let api = state.api.clone();
    run_blocking(move || api.current_user(&token).map_err(ServiceError::from)).await
}

async fn authenticate_admin(
    state: &ServiceState,
    headers: &HeaderMap,
) -> Result<SessionUser, ServiceError> {
    let user = authenticate(state, headers).await?;
    if !user.is_admin() {
        tracing::warn!(user = %user.email, "admin route rejected");
        return Err(ServiceError::forbidden("administrator role required"));
    }
    Ok(user)
}

fn parse_order<S: oraculo_core::SortField>(raw: Option<&str>, default: Order<S>) -> Result<Order<S>, ServiceError> {
    match raw {
        Some(raw) => Order::parse(raw).map_err(|err| ServiceError::bad_request(err.to_string())),
        None => Ok(default),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/auth/sign-up", post(auth_sign_up))
        .route("/v1/auth/sign-in", post(auth_sign_in))
        .route("/v1/auth/me", get(auth_me))
        .route("/v1/auth/logout", post(auth_logout))
        .route("/v1/conversations", get(conversations_list))
        .route("/v1/conversations/:conversation_id/messages", get(conversation_messages))
        .route("/v1/chat/ask", post(chat_ask))
        .route("/v1/procedures/active-count", get(procedures_active_count))
        .route("/v1/procedures", get(procedures_list).post(procedures_create))
        .route(
            "/v1/procedures/:procedure_id",
            get(procedures_show).put(procedures_update).delete(procedures_delete),
        )
        .route("/v1/categories", get(categories_list).post(categories_create))
        .route("/v1/categories/:category_id", put(categories_rename).delete(categories_delete))
        .route("/v1/users", get(users_list))
        .route("/v1/users/role", put(users_set_role))
        .route("/v1/files", post(files_upload))
        .route("/v1/files/procedures/:object_name", get(files_show))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.resolve_config()?;
    let api = config.build_api().context("failed to wire service collaborators")?;
    api.migrate(false).context("failed to migrate database")?;

    tracing::info!(
        bind = %config.bind,
        db = %config.db.display(),
        llm_configured = config.llm.endpoint.is_some(),
        "starting oraculo service"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn auth_sign_up(
    State(state): State<ServiceState>,
    Json(request): Json<SignUpRequest>,
) -> ServiceResult<Profile> {
    let api = state.api.clone();
    let profile = run_blocking(move || {
        api.sign_up(&request.email, &request.password, &request.full_name).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(profile)))
}

async fn auth_sign_in(
    State(state): State<ServiceState>,
    Json(request): Json<SignInRequest>,
) -> ServiceResult<Session> {
    let api = state.api.clone();
    let session = run_blocking(move || {
        api.sign_in(&request.email, &request.password).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(session)))
}

async fn auth_me(State(state): State<ServiceState>, headers: HeaderMap) -> ServiceResult<SessionUser> {
    let user = authenticate(&state, &headers).await?;
    Ok(Json(envelope(user)))
}

async fn auth_logout(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<LogoutResponse> {
    let token = bearer_token(&headers)?;
    let api = state.api.clone();
    run_blocking(move || api.logout(&token).map_err(ServiceError::from)).await?;
    Ok(Json(envelope(LogoutResponse { logged_out: true })))
}

async fn conversations_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(params): Query<OrderParams>,
) -> ServiceResult<Vec<Conversation>> {
    let user = authenticate(&state, &headers).await?;
    let order =
        parse_order(params.order.as_deref(), Order::desc(ConversationSort::LastMessageAt))?;
    let query = ConversationQuery::all()
        .filter(ConversationFilter::UserEmail(user.email))
        .order_by(order);
    let api = state.api.clone();
    let conversations =
        run_blocking(move || api.list_conversations(&query).map_err(|err| ServiceError::backend(&err)))
            .await?;
    Ok(Json(envelope(conversations)))
}

/// Load a conversation only if `user` owns it; anything else reads as missing.
fn owned_conversation(
    api: &OraculoApi,
    user: &SessionUser,
    id: ConversationId,
) -> Result<Conversation, ServiceError> {
    match api.get_conversation(id).map_err(|err| ServiceError::backend(&err))? {
        Some(conversation) if conversation.user_email == user.email => Ok(conversation),
        _ => Err(ServiceError::not_found(format!("conversation not found: {id}"))),
    }
}

async fn conversation_messages(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> ServiceResult<Vec<Message>> {
    let user = authenticate(&state, &headers).await?;
    let id = ConversationId::parse(&conversation_id)
        .map_err(|err| ServiceError::bad_request(err.to_string()))?;
    let api = state.api.clone();
    let messages = run_blocking(move || {
        owned_conversation(&api, &user, id)?;
        api.list_messages(
            &MessageQuery::all()
                .filter(MessageFilter::ConversationId(id))
                .order_by(Order::asc(MessageSort::CreatedAt)),
        )
        .map_err(|err| ServiceError::backend(&err))
    })
    .await?;
    Ok(Json(envelope(messages)))
}

async fn chat_ask(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AskRequest>,
) -> ServiceResult<TurnAnswer> {
    let user = authenticate(&state, &headers).await?;
    let api = state.api.clone();
    let answer = run_blocking(move || {
        if let Some(id) = request.conversation_id {
            owned_conversation(&api, &user, id)?;
        }
        api.answer(&user, request).map_err(ServiceError::from)
    })
    .await?;
    Ok(Json(envelope(answer)))
}

async fn procedures_active_count(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<ActiveCountResponse> {
    authenticate(&state, &headers).await?;
    let api = state.api.clone();
    let count =
        run_blocking(move || api.count_active_procedures().map_err(|err| ServiceError::backend(&err)))
            .await?;
    Ok(Json(envelope(ActiveCountResponse { count })))
}

async fn procedures_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(params): Query<ProcedureListParams>,
) -> ServiceResult<Vec<Procedure>> {
    authenticate_admin(&state, &headers).await?;
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            ProcedureStatus::parse(raw)
                .ok_or_else(|| ServiceError::bad_request(format!("unknown procedure status: {raw}")))?,
        ),
        None => None,
    };
    let order = parse_order(params.order.as_deref(), Order::desc(ProcedureSort::UpdatedAt))?;
    let term = params.q.unwrap_or_default();
    let api = state.api.clone();
    let procedures = run_blocking(move || {
        api.search_procedures(&term, status, Some(order)).map_err(|err| ServiceError::backend(&err))
    })
    .await?;
    Ok(Json(envelope(procedures)))
}

async fn procedures_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(draft): Json<ProcedureDraft>,
) -> ServiceResult<Procedure> {
    let admin = authenticate_admin(&state, &headers).await?;
    let api = state.api.clone();
    let procedure =
        run_blocking(move || api.create_procedure(draft).map_err(|err| ServiceError::backend(&err)))
            .await?;
    tracing::info!(admin = %admin.email, procedure_id = %procedure.id, "procedure created");
    Ok(Json(envelope(procedure)))
}

fn parse_procedure_id(raw: &str) -> Result<ProcedureId, ServiceError> {
    ProcedureId::parse(raw).map_err(|err| ServiceError::bad_request(err.to_string()))
}

async fn procedures_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(procedure_id): Path<String>,
) -> ServiceResult<Procedure> {
    authenticate_admin(&state, &headers).await?;
    let id = parse_procedure_id(&procedure_id)?;
    let api = state.api.clone();
    let procedure = run_blocking(move || {
        api.get_procedure(id)
            .map_err(|err| ServiceError::backend(&err))?
            .ok_or_else(|| ServiceError::not_found(format!("procedure not found: {id}")))
    })
    .await?;
    Ok(Json(envelope(procedure)))
}

async fn procedures_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(procedure_id): Path<String>,
    Json(draft): Json<ProcedureDraft>,
) -> ServiceResult<Procedure> {
    let admin = authenticate_admin(&state, &headers).await?;
    let id = parse_procedure_id(&procedure_id)?;
    let api = state.api.clone();
    let procedure =
        run_blocking(move || api.update_procedure(id, draft).map_err(|err| ServiceError::backend(&err)))
            .await?;
    tracing::info!(admin = %admin.email, procedure_id = %id, version = procedure.version, "procedure updated");
    Ok(Json(envelope(procedure)))
}

async fn procedures_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(procedure_id): Path<String>,
) -> ServiceResult<DeletedResponse> {
    let admin = authenticate_admin(&state, &headers).await?;
    let id = parse_procedure_id(&procedure_id)?;
    let api = state.api.clone();
    run_blocking(move || api.delete_procedure(id).map_err(|err| ServiceError::backend(&err))).await?;
    tracing::info!(admin = %admin.email, procedure_id = %id, "procedure deleted");
    Ok(Json(envelope(DeletedResponse { deleted: id.to_string() })))
}

async fn categories_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<Vec<Category>> {
    authenticate(&state, &headers).await?;
    let api = state.api.clone();
    let categories =
        run_blocking(move || api.list_categories().map_err(|err| ServiceError::backend(&err))).await?;
    Ok(Json(envelope(categories)))
}

async fn categories_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CategoryRequest>,
) -> ServiceResult<Category> {
    authenticate_admin(&state, &headers).await?;
    let api = state.api.clone();
    let category = run_blocking(move || {
        api.create_category(&request.name).map_err(|err| ServiceError::backend(&err))
    })
    .await?;
    Ok(Json(envelope(category)))
}

fn parse_category_id(raw: &str) -> Result<CategoryId, ServiceError> {
    CategoryId::parse(raw).map_err(|err| ServiceError::bad_request(err.to_string()))
}

async fn categories_rename(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(category_id): Path<String>,
    Json(request): Json<CategoryRequest>,
) -> ServiceResult<Category> {
    authenticate_admin(&state, &headers).await?;
    let id = parse_category_id(&category_id)?;
    let api = state.api.clone();
    let category = run_blocking(move || {
        api.rename_category(id, &request.name).map_err(|err| ServiceError::backend(&err))
    })
    .await?;
    Ok(Json(envelope(category)))
}

async fn categories_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(category_id): Path<String>,
) -> ServiceResult<DeletedResponse> {
    authenticate_admin(&state, &headers).await?;
    let id = parse_category_id(&category_id)?;
    let api = state.api.clone();
    run_blocking(move || api.delete_category(id).map_err(|err| ServiceError::backend(&err))).await?;
    Ok(Json(envelope(DeletedResponse { deleted: id.to_string() })))
}

async fn users_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(params): Query<UserListParams>,
) -> ServiceResult<Vec<Profile>> {
    authenticate_admin(&state, &headers).await?;
    let term = params.q.unwrap_or_default();
    let api = state.api.clone();
    let users =
        run_blocking(move || api.search_users(&term).map_err(|err| ServiceError::backend(&err))).await?;
    Ok(Json(envelope(users)))
}

async fn users_set_role(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<SetRoleRequest>,
) -> ServiceResult<Profile> {
    let admin = authenticate_admin(&state, &headers).await?;
    let api = state.api.clone();
    let profile = run_blocking(move || {
        api.set_user_role(&request.email, request.role).map_err(|err| ServiceError::backend(&err))
    })
    .await?;
    tracing::info!(admin = %admin.email, user = %profile.email, role = profile.role.as_str(), "role changed");
    Ok(Json(envelope(profile)))
}

async fn files_upload(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ServiceResult<UploadedFile> {
    authenticate_admin(&state, &headers).await?;
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let api = state.api.clone();
    let uploaded = run_blocking(move || {
        api.upload_file(&params.file_name, &mime_type, &body)
            .map_err(|err| ServiceError::backend(&err))
    })
    .await?;
    Ok(Json(envelope(uploaded)))
}

async fn files_show(
    State(state): State<ServiceState>,
    Path(object_name): Path<String>,
) -> Result<Response, ServiceError> {
    let api = state.api.clone();
    let lookup_name = object_name.clone();
    let bytes = run_blocking(move || {
        api.read_file(&lookup_name)
            .map_err(|err| ServiceError::backend(&err))?
            .ok_or_else(|| ServiceError::not_found(format!("file not found: {lookup_name}")))
    })
    .await?;
    Ok((StatusCode::OK, [(CONTENT_TYPE, mime_for_object(&object_name))], bytes).into_response())
}
