use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Local, NaiveDate, Utc};
use reqwest::Client;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use stegbot_config::Config;
use stegbot_contracts::{
    ChatErrorResponse, ChatRequest, ChatResponse, ContractsMetadata, HelpResponse, InternRecord,
    StatsResponse, API_VERSION, CONTRACT_SCHEMAS,
};
use stegbot_kernel::{
    fallback_reply, format_record, invalid_key_reply, looks_like_key, match_intent,
    not_found_reply, signals_key_search, ContextualRules, ConversationState, Intent,
    IntentCatalog, EMPTY_MESSAGE_REPLY, INTERNAL_ERROR_REPLY, INVALID_INPUT_REPLY,
    KEY_PROMPT_REPLY, LOOKUP_FAILED_REPLY,
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Idle per-user locks are pruned once the table grows past this size.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "stegbot listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let assistant = Assistant::from_config(&cfg)?;
    tracing::info!(
        records = %cfg.records.kind,
        intents = assistant.catalog().len(),
        contextual_rules = assistant.rules().len(),
        "assistant ready"
    );
    Ok(router(Arc::new(assistant)))
}

pub fn router(assistant: Arc<Assistant>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/chat", post(chat))
        .route("/v1/chat/help", get(help))
        .route("/v1/chat/stats", get(stats))
        .route("/v1/contracts", get(contracts))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { assistant })
}

#[derive(Clone)]
struct AppState {
    assistant: Arc<Assistant>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation store unavailable: {0}")]
    Unavailable(String),
}

/// Per-user dialogue state. Writes overwrite, they never merge.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Unknown users are `Idle`.
    async fn get(&self, user_id: &str) -> Result<ConversationState, StoreError>;

    async fn set(&self, user_id: &str, state: ConversationState) -> Result<(), StoreError>;

    async fn clear(&self, user_id: &str) -> Result<(), StoreError> {
        self.set(user_id, ConversationState::Idle).await
    }
}

#[derive(Default)]
pub struct MemoryConversationStore {
    states: Mutex<HashMap<String, ConversationState>>,
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get(&self, user_id: &str) -> Result<ConversationState, StoreError> {
        let states = self.states.lock().await;
        Ok(states.get(user_id).copied().unwrap_or_default())
    }

    async fn set(&self, user_id: &str, state: ConversationState) -> Result<(), StoreError> {
        let mut states = self.states.lock().await;
        match state {
            ConversationState::Idle => {
                states.remove(user_id);
            }
            other => {
                states.insert(user_id.to_string(), other);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct UserLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().await;
            if table.len() >= LOCK_TABLE_PRUNE_AT {
                table.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            table.entry(user_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("record backend failed: {0}")]
    Backend(String),
    #[error("record service answered HTTP {0}")]
    Status(u16),
}

#[async_trait]
pub trait RecordGateway: Send + Sync {
    /// `Ok(None)` is a normal outcome, not an error.
    async fn find_record_by_key(&self, key: &str) -> Result<Option<InternRecord>, LookupError>;
}

#[derive(Default)]
pub struct MemoryRecords {
    records: HashMap<String, InternRecord>,
}

impl MemoryRecords {
    pub fn new(records: Vec<InternRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.cin.clone(), r)).collect(),
        }
    }

    pub fn from_fixtures(path: &str) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("read fixtures {path} failed: {e}"))?;
        let records: Vec<InternRecord> = serde_yaml::from_str(&text)
            .map_err(|e| format!("parse fixtures {path} failed: {e}"))?;
        if let Some(bad) = records.iter().find(|r| !looks_like_key(&r.cin)) {
            return Err(format!("fixture cin {:?} is not 6 to 20 digits", bad.cin));
        }
        Ok(Self::new(records))
    }
}

#[async_trait]
impl RecordGateway for MemoryRecords {
    async fn find_record_by_key(&self, key: &str) -> Result<Option<InternRecord>, LookupError> {
        Ok(self.records.get(key).cloned())
    }
}

pub struct SqliteRecords {
    conn: Mutex<Connection>,
}

struct StagiaireRow {
    cin: String,
    nom: Option<String>,
    prenom: Option<String>,
    email: Option<String>,
    telephone: Option<String>,
    institut: Option<String>,
    specialite: Option<String>,
    date_debut: String,
    date_fin: String,
    objet_stage: Option<String>,
}

impl SqliteRecords {
    pub fn open(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS stagiaires (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cin TEXT NOT NULL UNIQUE,
                nom TEXT,
                prenom TEXT,
                email TEXT,
                telephone TEXT,
                institut TEXT,
                specialite TEXT,
                date_debut TEXT NOT NULL,
                date_fin TEXT NOT NULL,
                objet_stage TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn upsert(&self, record: &InternRecord) -> Result<(), LookupError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "
            INSERT INTO stagiaires
            (cin, nom, prenom, email, telephone, institut, specialite, date_debut, date_fin, objet_stage)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(cin) DO UPDATE SET
                nom=excluded.nom,
                prenom=excluded.prenom,
                email=excluded.email,
                telephone=excluded.telephone,
                institut=excluded.institut,
                specialite=excluded.specialite,
                date_debut=excluded.date_debut,
                date_fin=excluded.date_fin,
                objet_stage=excluded.objet_stage
            ",
            params![
                record.cin,
                record.nom,
                record.prenom,
                record.email,
                record.telephone,
                record.institut,
                record.specialite,
                record.date_debut.to_string(),
                record.date_fin.to_string(),
                record.objet_stage
            ],
        )
        .map_err(|e| LookupError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RecordGateway for SqliteRecords {
    async fn find_record_by_key(&self, key: &str) -> Result<Option<InternRecord>, LookupError> {
        let row = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "
                SELECT cin, nom, prenom, email, telephone, institut, specialite,
                       date_debut, date_fin, objet_stage
                FROM stagiaires WHERE cin = ?1
                ",
                params![key],
                |row| {
                    Ok(StagiaireRow {
                        cin: row.get(0)?,
                        nom: row.get(1)?,
                        prenom: row.get(2)?,
                        email: row.get(3)?,
                        telephone: row.get(4)?,
                        institut: row.get(5)?,
                        specialite: row.get(6)?,
                        date_debut: row.get(7)?,
                        date_fin: row.get(8)?,
                        objet_stage: row.get(9)?,
                    })
                },
            )
            .optional()
            .map_err(|e| LookupError::Backend(e.to_string()))?
        };

        match row {
            Some(row) => Ok(Some(InternRecord {
                date_debut: parse_stored_date(&row.date_debut)?,
                date_fin: parse_stored_date(&row.date_fin)?,
                cin: row.cin,
                nom: row.nom.unwrap_or_default(),
                prenom: row.prenom.unwrap_or_default(),
                email: row.email.unwrap_or_default(),
                telephone: row.telephone.unwrap_or_default(),
                institut: row.institut.unwrap_or_default(),
                specialite: row.specialite.unwrap_or_default(),
                objet_stage: row.objet_stage.unwrap_or_default(),
            })),
            None => Ok(None),
        }
    }
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part.
fn parse_stored_date(value: &str) -> Result<NaiveDate, LookupError> {
    let date_part = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|e| LookupError::Backend(format!("bad stored date {value:?}: {e}")))
}

/// Remote record service answering `GET {endpoint}/{cin}`.
pub struct HttpRecords {
    endpoint: String,
    client: Client,
}

impl HttpRecords {
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl RecordGateway for HttpRecords {
    async fn find_record_by_key(&self, key: &str) -> Result<Option<InternRecord>, LookupError> {
        let response = self
            .client
            .get(format!("{}/{}", self.endpoint, key))
            .send()
            .await
            .map_err(|e| LookupError::Backend(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LookupError::Status(response.status().as_u16()));
        }
        let record: RemoteRecord = response
            .json()
            .await
            .map_err(|e| LookupError::Backend(format!("record contract parse error: {e}")))?;
        Ok(Some(record.into_record()?))
    }
}

/// Row as served by the record service. Extra columns such as `id` or
/// `created_at` are ignored and dates may carry a time part.
#[derive(Deserialize)]
struct RemoteRecord {
    cin: String,
    #[serde(default)]
    nom: Option<String>,
    #[serde(default)]
    prenom: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    telephone: Option<String>,
    #[serde(default)]
    institut: Option<String>,
    #[serde(default)]
    specialite: Option<String>,
    date_debut: String,
    date_fin: String,
    #[serde(default)]
    objet_stage: Option<String>,
}

impl RemoteRecord {
    fn into_record(self) -> Result<InternRecord, LookupError> {
        Ok(InternRecord {
            date_debut: parse_stored_date(&self.date_debut)?,
            date_fin: parse_stored_date(&self.date_fin)?,
            cin: self.cin,
            nom: self.nom.unwrap_or_default(),
            prenom: self.prenom.unwrap_or_default(),
            email: self.email.unwrap_or_default(),
            telephone: self.telephone.unwrap_or_default(),
            institut: self.institut.unwrap_or_default(),
            specialite: self.specialite.unwrap_or_default(),
            objet_stage: self.objet_stage.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Pending key, key-search prompt, or a bare key typed while idle.
    StateDriven,
    Contextual,
    KeywordMatch,
}

/// Tried in order. A turn that none of them answers gets the fallback reply.
pub const RESOLUTION_CHAIN: [Strategy; 3] = [
    Strategy::StateDriven,
    Strategy::Contextual,
    Strategy::KeywordMatch,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    InvalidInput,
    EmptyMessage,
    KeyPrompt,
    InvalidKey,
    RecordFound,
    RecordNotFound,
    LookupFailed,
    Contextual(String),
    IntentMatched(String),
    Fallback,
    InternalError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::InvalidInput => "invalid_input",
            Outcome::EmptyMessage => "empty_message",
            Outcome::KeyPrompt => "key_prompt",
            Outcome::InvalidKey => "invalid_key",
            Outcome::RecordFound => "record_found",
            Outcome::RecordNotFound => "record_not_found",
            Outcome::LookupFailed => "lookup_failed",
            Outcome::Contextual(_) => "contextual",
            Outcome::IntentMatched(_) => "intent_matched",
            Outcome::Fallback => "fallback",
            Outcome::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: Outcome,
    pub reply: String,
    pub record: Option<InternRecord>,
}

impl Resolution {
    fn reply(outcome: Outcome, reply: impl Into<String>) -> Self {
        Self {
            outcome,
            reply: reply.into(),
            record: None,
        }
    }
}

type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct Assistant {
    catalog: IntentCatalog,
    rules: ContextualRules,
    conversations: Arc<dyn ConversationStore>,
    records: Arc<dyn RecordGateway>,
    locks: UserLocks,
    lookup_timeout: Duration,
    anonymous_user_id: String,
    today: Clock,
}

impl Assistant {
    pub fn new(
        catalog: IntentCatalog,
        rules: ContextualRules,
        conversations: Arc<dyn ConversationStore>,
        records: Arc<dyn RecordGateway>,
    ) -> Self {
        Self {
            catalog,
            rules,
            conversations,
            records,
            locks: UserLocks::default(),
            lookup_timeout: Duration::from_millis(2_000),
            anonymous_user_id: "guest".to_string(),
            today: Arc::new(|| Local::now().date_naive()),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let catalog = match cfg.assistant.catalog_path.as_deref() {
            Some(path) => load_catalog(path)?,
            None => IntentCatalog::builtin(),
        };
        let lookup_timeout = Duration::from_millis(cfg.records.lookup_timeout_ms);
        let records: Arc<dyn RecordGateway> = match cfg.records.kind.as_str() {
            "sqlite" => {
                let path = cfg
                    .records
                    .sqlite_path
                    .as_deref()
                    .ok_or_else(|| "records.sqlite_path is required for sqlite records".to_string())?;
                Arc::new(SqliteRecords::open(path)?)
            }
            "http" => {
                let endpoint = cfg
                    .records
                    .endpoint
                    .as_deref()
                    .ok_or_else(|| "records.endpoint is required for http records".to_string())?;
                Arc::new(HttpRecords::new(endpoint, lookup_timeout)?)
            }
            "memory" => match cfg.records.fixtures_path.as_deref() {
                Some(path) => Arc::new(MemoryRecords::from_fixtures(path)?),
                None => Arc::new(MemoryRecords::default()),
            },
            other => {
                return Err(format!(
                    "records.type={other} is not implemented; supported: memory, sqlite, http"
                ))
            }
        };

        Ok(Self::new(
            catalog,
            ContextualRules::builtin(),
            Arc::new(MemoryConversationStore::default()),
            records,
        )
        .with_lookup_timeout(lookup_timeout)
        .with_anonymous_user_id(cfg.assistant.anonymous_user_id.clone()))
    }

    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    pub fn with_anonymous_user_id(mut self, user_id: String) -> Self {
        self.anonymous_user_id = user_id;
        self
    }

    pub fn with_clock(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Arc::new(today);
        self
    }

    pub fn catalog(&self) -> &IntentCatalog {
        &self.catalog
    }

    pub fn rules(&self) -> &ContextualRules {
        &self.rules
    }

    pub async fn state_of(&self, user_id: &str) -> Result<ConversationState, StoreError> {
        self.conversations.get(user_id).await
    }

    /// Answers one chat turn. `text` is `None` when the caller sent no string.
    pub async fn resolve(&self, user_id: Option<&str>, text: Option<&str>) -> Resolution {
        let user_id = user_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(self.anonymous_user_id.as_str());
        let resolution = self.resolve_turn(user_id, text).await;
        tracing::info!(user_id, outcome = resolution.outcome.as_str(), "chat turn resolved");
        resolution
    }

    async fn resolve_turn(&self, user_id: &str, text: Option<&str>) -> Resolution {
        let Some(text) = text else {
            return Resolution::reply(Outcome::InvalidInput, INVALID_INPUT_REPLY);
        };
        let message = text.trim();
        if message.is_empty() {
            return Resolution::reply(Outcome::EmptyMessage, EMPTY_MESSAGE_REPLY);
        }

        let _turn = self.locks.acquire(user_id).await;
        for strategy in RESOLUTION_CHAIN {
            match self.apply(strategy, user_id, message).await {
                Ok(Some(resolution)) => return resolution,
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(user_id, error = %err, "conversation state unavailable");
                    return Resolution::reply(Outcome::InternalError, INTERNAL_ERROR_REPLY);
                }
            }
        }
        Resolution::reply(Outcome::Fallback, fallback_reply(message))
    }

    async fn apply(
        &self,
        strategy: Strategy,
        user_id: &str,
        message: &str,
    ) -> Result<Option<Resolution>, StoreError> {
        let resolution = match strategy {
            Strategy::StateDriven => self.state_driven(user_id, message).await?,
            Strategy::Contextual => self.rules.evaluate(message).map(|rule| {
                Resolution::reply(
                    Outcome::Contextual(rule.name.clone()),
                    rule.response.clone(),
                )
            }),
            Strategy::KeywordMatch => match_intent(message, &self.catalog).map(|intent| {
                Resolution::reply(
                    Outcome::IntentMatched(intent.name.clone()),
                    intent.response.clone(),
                )
            }),
        };
        Ok(resolution)
    }

    async fn state_driven(
        &self,
        user_id: &str,
        message: &str,
    ) -> Result<Option<Resolution>, StoreError> {
        if self.conversations.get(user_id).await? == ConversationState::AwaitingKey {
            self.conversations.clear(user_id).await?;
            if !looks_like_key(message) {
                return Ok(Some(Resolution::reply(
                    Outcome::InvalidKey,
                    invalid_key_reply(message),
                )));
            }
            return Ok(Some(self.lookup(message).await));
        }

        if signals_key_search(message) {
            self.conversations
                .set(user_id, ConversationState::AwaitingKey)
                .await?;
            return Ok(Some(Resolution::reply(Outcome::KeyPrompt, KEY_PROMPT_REPLY)));
        }

        if looks_like_key(message) {
            return Ok(Some(self.lookup(message).await));
        }
        Ok(None)
    }

    async fn lookup(&self, key: &str) -> Resolution {
        match timeout(self.lookup_timeout, self.records.find_record_by_key(key)).await {
            Ok(Ok(Some(record))) => Resolution {
                outcome: Outcome::RecordFound,
                reply: format_record(&record, (self.today)()),
                record: Some(record),
            },
            Ok(Ok(None)) => Resolution::reply(Outcome::RecordNotFound, not_found_reply(key)),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "record lookup failed");
                Resolution::reply(Outcome::LookupFailed, LOOKUP_FAILED_REPLY)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "record lookup timed out"
                );
                Resolution::reply(Outcome::LookupFailed, LOOKUP_FAILED_REPLY)
            }
        }
    }
}

pub fn load_catalog(path: &str) -> Result<IntentCatalog, String> {
    let text =
        std::fs::read_to_string(path).map_err(|e| format!("read catalog {path} failed: {e}"))?;
    let intents: Vec<Intent> =
        serde_yaml::from_str(&text).map_err(|e| format!("parse catalog {path} failed: {e}"))?;
    IntentCatalog::new(intents).map_err(|e| format!("invalid catalog {path}: {e}"))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ChatErrorResponse>)> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "unreadable chat body");
            ChatRequest::default()
        }
    };

    let turn_id = uuid::Uuid::new_v4();
    let resolution = state
        .assistant
        .resolve(request.user_id.as_deref(), request.message_text())
        .instrument(tracing::info_span!("chat_turn", %turn_id))
        .await;

    let timestamp = Utc::now().to_rfc3339();
    match resolution.outcome {
        Outcome::InvalidInput => Err((
            StatusCode::BAD_REQUEST,
            Json(ChatErrorResponse {
                error: "Message requis".to_string(),
                reply: resolution.reply,
                timestamp: None,
            }),
        )),
        Outcome::InternalError => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ChatErrorResponse {
                error: "Erreur serveur".to_string(),
                reply: resolution.reply,
                timestamp: Some(timestamp),
            }),
        )),
        _ => Ok(Json(ChatResponse {
            reply: resolution.reply,
            record: resolution.record,
            timestamp,
            processed: true,
        })),
    }
}

async fn help(State(state): State<AppState>) -> Json<HelpResponse> {
    Json(HelpResponse {
        success: true,
        message: "Voici les sujets sur lesquels je peux vous aider :".to_string(),
        topics: state.assistant.catalog().help_topics(),
    })
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let catalog = state.assistant.catalog();
    Json(StatsResponse {
        success: true,
        total_responses: catalog.len(),
        contextual_rules: state.assistant.rules().len(),
        categories: catalog.names(),
        last_update: Utc::now().to_rfc3339(),
    })
}

async fn contracts() -> Json<ContractsMetadata> {
    let schemas: BTreeMap<String, String> = CONTRACT_SCHEMAS
        .iter()
        .map(|schema| (schema.path.to_string(), hash_hex(schema.body.as_bytes())))
        .collect();
    Json(ContractsMetadata {
        api_version: API_VERSION.to_string(),
        schemas,
    })
}

fn hash_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
