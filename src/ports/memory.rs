use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CrmClient, CrmContact, CrmDeal, DbOperation, HttpClient, HttpRequest, HttpResponse,
    MessageSender, PortError, Query, QueryExecutor, QueryOutcome, Row,
};
use crate::message::{DeliveryReceipt, OutboundMessage};
use crate::util::value_to_string;

fn receipt() -> DeliveryReceipt {
    DeliveryReceipt {
        message_id: Uuid::new_v4().to_string(),
        sent_at: Utc::now(),
    }
}

/// Prints outbound messages to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleMessageSender;

#[async_trait]
impl MessageSender for ConsoleMessageSender {
    async fn send(&self, address: &str, message: OutboundMessage) -> Result<DeliveryReceipt, PortError> {
        if message != OutboundMessage::Typing {
            println!("🤖 [{}] {}", address, message.preview());
        }
        Ok(receipt())
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

/// Keeps every outbound message; can be told to reject deliveries.
#[derive(Debug, Default)]
pub struct RecordingMessageSender {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    failing: AtomicBool,
}

impl RecordingMessageSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sender = Self::default();
        sender.set_failing(true);
        sender
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().await.clone()
    }

    /// Text of every text or buttons message, in send order.
    pub async fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|(_, m)| match m {
                OutboundMessage::Text { text } | OutboundMessage::Buttons { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MessageSender for RecordingMessageSender {
    async fn send(&self, address: &str, message: OutboundMessage) -> Result<DeliveryReceipt, PortError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PortError::Unavailable("delivery rejected".into()));
        }
        self.sent.lock().await.push((address.to_string(), message));
        Ok(receipt())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Replays queued responses in order and records the requests it saw.
#[derive(Debug, Default)]
pub struct StubHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse, PortError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Duration,
}

impl StubHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every response is held back by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn push_response(&self, status: u16, body: Value) {
        self.responses.lock().await.push_back(Ok(HttpResponse {
            status,
            status_text: String::new(),
            headers: Default::default(),
            body,
        }));
    }

    pub async fn push_error(&self, error: PortError) {
        self.responses.lock().await.push_back(Err(error));
    }

    pub async fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl HttpClient for StubHttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, PortError> {
        self.requests.lock().await.push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(PortError::Unavailable("no stubbed response".into())))
    }
}

/// Tables of JSON rows, matched by equality on every predicate.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    tables: DashMap<String, Vec<Row>>,
}

fn matches(row: &Row, predicates: &Row) -> bool {
    predicates.iter().all(|(k, expected)| {
        row.get(k)
            .map(|actual| actual == expected || value_to_string(actual) == value_to_string(expected))
            .unwrap_or(false)
    })
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables.entry(table.to_string()).or_default().extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|rows| rows.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueryExecutor for InMemoryDatabase {
    async fn execute(&self, query: &Query) -> Result<QueryOutcome, PortError> {
        let mut table = self.tables.entry(query.table.clone()).or_default();
        let rows = table.value_mut();
        let outcome = match query.operation {
            DbOperation::Select => {
                let limit = query.limit.unwrap_or(usize::MAX);
                QueryOutcome::Rows(
                    rows.iter()
                        .filter(|r| matches(r, &query.predicates))
                        .take(limit)
                        .cloned()
                        .collect(),
                )
            }
            DbOperation::Insert => {
                let mut row = query.values.clone();
                row.entry("id")
                    .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
                rows.push(row.clone());
                QueryOutcome::Inserted(row)
            }
            DbOperation::Update => {
                let mut affected = 0;
                for row in rows.iter_mut().filter(|r| matches(r, &query.predicates)) {
                    row.extend(query.values.clone());
                    affected += 1;
                }
                QueryOutcome::Affected(affected)
            }
            DbOperation::Delete => {
                let before = rows.len();
                rows.retain(|r| !matches(r, &query.predicates));
                QueryOutcome::Affected((before - rows.len()) as u64)
            }
        };
        Ok(outcome)
    }
}

/// CRM double keeping contacts and deals in memory.
#[derive(Debug, Default)]
pub struct InMemoryCrm {
    contacts: DashMap<String, CrmContact>,
    deals: DashMap<String, CrmDeal>,
}

impl InMemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contact(&self, id: &str) -> Option<CrmContact> {
        self.contacts.get(id).map(|c| c.value().clone())
    }

    pub fn deals(&self) -> Vec<CrmDeal> {
        self.deals.iter().map(|d| d.value().clone()).collect()
    }
}

#[async_trait]
impl CrmClient for InMemoryCrm {
    async fn create_contact(&self, contact: &CrmContact) -> Result<CrmContact, PortError> {
        let mut created = contact.clone();
        let id = Uuid::new_v4().to_string();
        created.id = Some(id.clone());
        self.contacts.insert(id, created.clone());
        Ok(created)
    }

    async fn update_contact(&self, id: &str, contact: &CrmContact) -> Result<CrmContact, PortError> {
        let mut existing = self
            .contacts
            .get_mut(id)
            .ok_or_else(|| PortError::Rejected { status: 404, body: format!("contact {} not found", id) })?;
        let current = existing.value_mut();
        if contact.email.is_some() {
            current.email = contact.email.clone();
        }
        if contact.name.is_some() {
            current.name = contact.name.clone();
        }
        if contact.phone.is_some() {
            current.phone = contact.phone.clone();
        }
        current.properties.extend(contact.properties.clone());
        Ok(current.clone())
    }

    async fn find_contact(&self, email: Option<&str>, phone: Option<&str>) -> Result<Option<CrmContact>, PortError> {
        let found = self.contacts.iter().find(|c| {
            let by_email = match (email, c.email.as_deref()) {
                (Some(wanted), Some(have)) => wanted.eq_ignore_ascii_case(have),
                _ => false,
            };
            let by_phone = match (phone, c.phone.as_deref()) {
                (Some(wanted), Some(have)) => wanted == have,
                _ => false,
            };
            by_email || by_phone
        });
        Ok(found.map(|c| c.value().clone()))
    }

    async fn create_deal(&self, deal: &CrmDeal) -> Result<CrmDeal, PortError> {
        let mut created = deal.clone();
        let id = Uuid::new_v4().to_string();
        created.id = Some(id.clone());
        self.deals.insert(id, created.clone());
        Ok(created)
    }
}
