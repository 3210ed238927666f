//! Boundaries to the outside world. Executors only talk to these traits;
//! adapters decide whether that means WhatsApp, a real HTTP endpoint or an
//! in-memory fake.

pub mod http;
pub mod memory;
pub mod openai;

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::{DeliveryReceipt, OutboundMessage};

pub use http::ReqwestHttpClient;
pub use memory::{
    ConsoleMessageSender, InMemoryCrm, InMemoryDatabase, RecordingMessageSender, StubHttpClient,
};
pub use openai::OpenAiClassifier;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PortError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, address: &str, message: OutboundMessage) -> Result<DeliveryReceipt, PortError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, otherwise the raw text.
    pub body: Value,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Transport-level failures are errors; any HTTP status is a response.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, PortError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DbOperation {
    Select,
    Insert,
    Update,
    Delete,
}

impl DbOperation {
    pub fn parse(op: &str) -> Option<Self> {
        match op.to_ascii_lowercase().as_str() {
            "select" | "find" | "query" => Some(DbOperation::Select),
            "insert" | "create" => Some(DbOperation::Insert),
            "update" => Some(DbOperation::Update),
            "delete" | "remove" => Some(DbOperation::Delete),
            _ => None,
        }
    }
}

pub type Row = Map<String, Value>;

/// Structured query; adapters translate it into whatever their backend speaks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Query {
    pub operation: DbOperation,
    pub table: String,
    /// Column values for insert/update.
    pub values: Row,
    /// Equality predicates, all of which must hold.
    pub predicates: Row,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(Vec<Row>),
    Inserted(Row),
    Affected(u64),
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &Query) -> Result<QueryOutcome, PortError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmContact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrmDeal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn create_contact(&self, contact: &CrmContact) -> Result<CrmContact, PortError>;

    async fn update_contact(&self, id: &str, contact: &CrmContact) -> Result<CrmContact, PortError>;

    async fn find_contact(&self, email: Option<&str>, phone: Option<&str>) -> Result<Option<CrmContact>, PortError>;

    async fn create_deal(&self, deal: &CrmDeal) -> Result<CrmDeal, PortError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRequest {
    pub prompt: String,
    pub message: Option<String>,
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    pub result: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Yes/no judgement on a user message, used by AI-mode conditions.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification, PortError>;

    fn name(&self) -> &'static str;
}

/// The adapters handed to the built-in executors.
#[derive(Clone)]
pub struct Ports {
    pub sender: Arc<dyn MessageSender>,
    pub http: Arc<dyn HttpClient>,
    pub database: Arc<dyn QueryExecutor>,
    pub crm: Option<Arc<dyn CrmClient>>,
    pub classifier: Option<Arc<dyn Classifier>>,
}

impl Ports {
    /// Console output, real HTTP, in-memory storage and no AI.
    pub fn local() -> Self {
        Self {
            sender: Arc::new(ConsoleMessageSender),
            http: Arc::new(ReqwestHttpClient::new()),
            database: Arc::new(InMemoryDatabase::default()),
            crm: Some(Arc::new(InMemoryCrm::default())),
            classifier: None,
        }
    }

    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = http;
        self
    }

    pub fn with_database(mut self, database: Arc<dyn QueryExecutor>) -> Self {
        self.database = database;
        self
    }

    pub fn with_crm(mut self, crm: Option<Arc<dyn CrmClient>>) -> Self {
        self.crm = crm;
        self
    }

    pub fn with_classifier(mut self, classifier: Option<Arc<dyn Classifier>>) -> Self {
        self.classifier = classifier;
        self
    }
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports")
            .field("sender", &self.sender.name())
            .field("crm", &self.crm.is_some())
            .field("classifier", &self.classifier.as_ref().map(|c| c.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_operations_accept_synonyms() {
        assert_eq!(DbOperation::parse("SELECT"), Some(DbOperation::Select));
        assert_eq!(DbOperation::parse("create"), Some(DbOperation::Insert));
        assert_eq!(DbOperation::parse("upsert"), None);
    }

    #[test]
    fn http_methods_parse_either_case() {
        let m: HttpMethod = serde_json::from_str("\"post\"").unwrap();
        assert_eq!(m, HttpMethod::Post);
        let m: HttpMethod = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(m.as_str(), "DELETE");
    }
}
