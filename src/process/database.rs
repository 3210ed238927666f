use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::node::{LogLevel, NodeContext, NodeError, NodeExecutor, NodeResult};
use crate::ports::{CrmClient, CrmContact, CrmDeal, DbOperation, Query, QueryExecutor, QueryOutcome, Row};
use crate::process::{log_port_call, render, render_value};
use crate::util::{as_number, has_tokens, value_to_string, whole_token};

/// ```yaml
/// - id: save_lead
///   type: database
///   config:
///     operation: insert
///     table: leads
///     fields: [name, email]
///     values:
///       source: "whatsapp:{{phoneNumber}}"
///     outputVariable: lead
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseNodeConfig {
    pub operation: String,
    #[serde(default)]
    pub table: String,
    /// Variable names copied into the row under the same column name.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Explicit column values; tokens are resolved against the variables.
    #[serde(default)]
    pub values: Map<String, Value>,
    /// Equality predicates. A predicate whose placeholder cannot be resolved is dropped.
    #[serde(default)]
    pub conditions: Map<String, Value>,
    #[serde(default)]
    pub output_variable: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Extra CRM properties for `hubspot` nodes.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Resolve a configured value. `None` means it referenced a variable that does not exist.
fn resolve_placeholder(ctx: &NodeContext, value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => match whole_token(s) {
            Some(key) => ctx.get_variable(key).cloned(),
            None if has_tokens(s) => {
                let rendered = render(ctx, s);
                (!has_tokens(&rendered)).then_some(Value::String(rendered))
            }
            None => Some(value.clone()),
        },
        other => Some(other.clone()),
    }
}

pub fn build_query(ctx: &NodeContext, cfg: &DatabaseNodeConfig, operation: DbOperation) -> Result<Query, NodeError> {
    if cfg.table.trim().is_empty() {
        return Err(NodeError::InvalidConfig(format!(
            "database node `{}` has no table",
            ctx.node_id()
        )));
    }

    let mut values = Row::new();
    for field in &cfg.fields {
        match ctx.get_variable(field) {
            Some(v) => {
                values.insert(field.clone(), v.clone());
            }
            None => debug!(field = %field, "field variable not set, omitted"),
        }
    }
    for (column, value) in &cfg.values {
        if let Some(resolved) = resolve_placeholder(ctx, value) {
            values.insert(column.clone(), resolved);
        }
    }

    let mut predicates = Row::new();
    for (column, value) in &cfg.conditions {
        match resolve_placeholder(ctx, value) {
            Some(resolved) => {
                predicates.insert(column.clone(), resolved);
            }
            None => debug!(column = %column, "condition placeholder unresolved, dropped"),
        }
    }
    if cfg.conditions.is_empty() && matches!(operation, DbOperation::Update | DbOperation::Delete) {
        warn!(table = %cfg.table, "{:?} without conditions touches every row", operation);
    }

    Ok(Query {
        operation,
        table: cfg.table.clone(),
        values,
        predicates,
        limit: cfg.limit,
    })
}

pub struct DatabaseExecutor {
    db: Arc<dyn QueryExecutor>,
}

impl DatabaseExecutor {
    pub fn new(db: Arc<dyn QueryExecutor>) -> Self {
        Self { db }
    }

    async fn run_query(&self, ctx: &NodeContext, query: &Query) -> Result<QueryOutcome, NodeError> {
        let started = Instant::now();
        let outcome = self.db.execute(query).await;
        log_port_call("database", ctx, outcome.is_ok(), started);
        Ok(outcome?)
    }

    async fn run(&self, ctx: &mut NodeContext, cfg: &DatabaseNodeConfig) -> Result<NodeResult, NodeError> {
        let operation = DbOperation::parse(&cfg.operation).ok_or_else(|| {
            NodeError::InvalidConfig(format!("unknown database operation `{}`", cfg.operation))
        })?;
        let query = build_query(ctx, cfg, operation)?;
        let filtered = matches!(operation, DbOperation::Update | DbOperation::Delete);
        if filtered && !cfg.conditions.is_empty() && query.predicates.is_empty() {
            ctx.log(
                LogLevel::Warn,
                format!("{:?} on `{}` refused: every condition was unresolved", operation, query.table),
            );
            return Ok(NodeResult::failed(
                "no resolvable conditions",
                json!({ "operation": operation, "table": query.table, "affected": 0 }),
            ));
        }
        let outcome = self.run_query(ctx, &query).await?;

        let (output, stored) = match outcome {
            QueryOutcome::Rows(rows) => {
                let rows: Vec<Value> = rows.into_iter().map(Value::Object).collect();
                (json!({ "count": rows.len(), "rows": rows }), Value::Array(rows))
            }
            QueryOutcome::Inserted(row) => (json!({ "record": row }), Value::Object(row)),
            QueryOutcome::Affected(n) => (json!({ "affected": n }), json!(n)),
        };
        ctx.log(
            LogLevel::Debug,
            format!("{:?} on `{}` done", operation, query.table),
        );

        let mut output = output;
        output["operation"] = json!(operation);
        output["table"] = json!(query.table);
        let mut result = NodeResult::ok(output);
        if let Some(var) = cfg.output_variable.as_deref().filter(|v| !v.is_empty()) {
            result = result.with_variable(var, stored);
        }
        Ok(result)
    }
}

#[async_trait]
impl NodeExecutor for DatabaseExecutor {
    fn name(&self) -> &'static str {
        "database"
    }

    #[tracing::instrument(name = "database_node_execute", skip(self, ctx), fields(node_id = %ctx.node_id()))]
    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: DatabaseNodeConfig = ctx.config_as()?;
        self.run(ctx, &cfg).await
    }
}

/// Database node that also talks to a CRM.
///
/// `create_contact`, `update_contact`, `get_contact` and `create_deal` map the
/// `email`, `name` and `phone` variables to a CRM record and mirror it into a
/// local table (`contacts` or `deals` unless `table` says otherwise). Any
/// other operation runs as a plain database query.
pub struct CrmExecutor {
    generic: DatabaseExecutor,
    crm: Arc<dyn CrmClient>,
}

impl CrmExecutor {
    pub fn new(db: Arc<dyn QueryExecutor>, crm: Arc<dyn CrmClient>) -> Self {
        Self {
            generic: DatabaseExecutor::new(db),
            crm,
        }
    }

    fn var_string(ctx: &NodeContext, key: &str) -> Option<String> {
        ctx.get_variable(key)
            .map(value_to_string)
            .filter(|s| !s.trim().is_empty())
    }

    fn contact_from(ctx: &NodeContext, cfg: &DatabaseNodeConfig) -> CrmContact {
        let properties = match render_value(ctx, &Value::Object(cfg.properties.clone())) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        CrmContact {
            id: None,
            email: Self::var_string(ctx, "email"),
            name: Self::var_string(ctx, "name"),
            phone: Self::var_string(ctx, "phone").or_else(|| Some(ctx.address().to_string())),
            properties,
        }
    }

    fn contact_row(ctx: &NodeContext, contact: &CrmContact) -> Row {
        let mut row = Row::new();
        row.insert("crmId".into(), json!(contact.id));
        for (key, value) in [("email", &contact.email), ("name", &contact.name), ("phone", &contact.phone)] {
            if let Some(v) = value {
                row.insert(key.into(), json!(v));
            }
        }
        row.insert("threadId".into(), json!(ctx.thread_id()));
        row
    }

    fn table<'a>(cfg: &'a DatabaseNodeConfig, default: &'a str) -> &'a str {
        if cfg.table.trim().is_empty() { default } else { &cfg.table }
    }

    async fn mirror(&self, ctx: &NodeContext, operation: DbOperation, table: &str, values: Row, predicates: Row) -> Result<QueryOutcome, NodeError> {
        let query = Query {
            operation,
            table: table.to_string(),
            values,
            predicates,
            limit: None,
        };
        self.generic.run_query(ctx, &query).await
    }

    async fn call<T>(&self, ctx: &NodeContext, fut: impl std::future::Future<Output = Result<T, crate::ports::PortError>>) -> Result<T, NodeError> {
        let started = Instant::now();
        let result = fut.await;
        log_port_call("crm", ctx, result.is_ok(), started);
        Ok(result?)
    }

    async fn create_contact(&self, ctx: &mut NodeContext, cfg: &DatabaseNodeConfig) -> Result<NodeResult, NodeError> {
        let contact = Self::contact_from(ctx, cfg);
        let created = self.call(ctx, self.crm.create_contact(&contact)).await?;
        let table = Self::table(cfg, "contacts");
        let local = self
            .mirror(ctx, DbOperation::Insert, table, Self::contact_row(ctx, &created), Row::new())
            .await?;
        let local = match local {
            QueryOutcome::Inserted(row) => Value::Object(row),
            _ => Value::Null,
        };
        Ok(NodeResult::ok(json!({ "operation": "create_contact", "contact": created, "local": local }))
            .with_variable("crmContactId", json!(created.id)))
    }

    async fn find_existing(&self, ctx: &NodeContext) -> Result<Option<CrmContact>, NodeError> {
        let email = Self::var_string(ctx, "email");
        let phone = Self::var_string(ctx, "phone").or_else(|| Some(ctx.address().to_string()));
        self.call(ctx, self.crm.find_contact(email.as_deref(), phone.as_deref())).await
    }

    async fn update_contact(&self, ctx: &mut NodeContext, cfg: &DatabaseNodeConfig) -> Result<NodeResult, NodeError> {
        let id = match Self::var_string(ctx, "crmContactId") {
            Some(id) => id,
            None => match self.find_existing(ctx).await?.and_then(|c| c.id) {
                Some(id) => id,
                None => {
                    ctx.log(LogLevel::Warn, "no CRM contact to update");
                    return Ok(NodeResult::failed(
                        "contact not found",
                        json!({ "operation": "update_contact", "found": false }),
                    ));
                }
            },
        };
        let contact = Self::contact_from(ctx, cfg);
        let updated = self.call(ctx, self.crm.update_contact(&id, &contact)).await?;

        let mut values = Self::contact_row(ctx, &updated);
        values.remove("crmId");
        let predicates = Row::from_iter([("crmId".to_string(), json!(id))]);
        let affected = match self
            .mirror(ctx, DbOperation::Update, Self::table(cfg, "contacts"), values, predicates)
            .await?
        {
            QueryOutcome::Affected(n) => n,
            _ => 0,
        };
        Ok(NodeResult::ok(json!({ "operation": "update_contact", "contact": updated, "localAffected": affected }))
            .with_variable("crmContactId", json!(id)))
    }

    async fn get_contact(&self, ctx: &mut NodeContext, cfg: &DatabaseNodeConfig) -> Result<NodeResult, NodeError> {
        let Some(contact) = self.find_existing(ctx).await? else {
            return Ok(NodeResult::ok(json!({ "operation": "get_contact", "found": false })).with_handle("not_found"));
        };
        let table = Self::table(cfg, "contacts");
        let predicates = Row::from_iter([("crmId".to_string(), json!(contact.id))]);
        let existing = self
            .mirror(ctx, DbOperation::Select, table, Row::new(), predicates)
            .await?;
        if matches!(existing, QueryOutcome::Rows(ref rows) if rows.is_empty()) {
            self.mirror(ctx, DbOperation::Insert, table, Self::contact_row(ctx, &contact), Row::new())
                .await?;
        }
        let contact_json = json!(contact);
        Ok(NodeResult::ok(json!({ "operation": "get_contact", "found": true, "contact": contact_json }))
            .with_variable("crmContact", contact_json)
            .with_variable("crmContactId", json!(contact.id))
            .with_handle("found"))
    }

    async fn create_deal(&self, ctx: &mut NodeContext, cfg: &DatabaseNodeConfig) -> Result<NodeResult, NodeError> {
        let name = Self::var_string(ctx, "dealName").unwrap_or_else(|| {
            let who = Self::var_string(ctx, "name").unwrap_or_else(|| ctx.address().to_string());
            format!("WhatsApp deal - {}", who)
        });
        let deal = CrmDeal {
            id: None,
            name,
            amount: ctx.get_variable("dealAmount").and_then(as_number),
            stage: Self::var_string(ctx, "dealStage"),
            contact_id: Self::var_string(ctx, "crmContactId"),
        };
        let created = self.call(ctx, self.crm.create_deal(&deal)).await?;

        let mut row = Row::new();
        row.insert("crmId".into(), json!(created.id));
        row.insert("name".into(), json!(created.name));
        row.insert("amount".into(), json!(created.amount));
        row.insert("stage".into(), json!(created.stage));
        row.insert("contactId".into(), json!(created.contact_id));
        row.insert("threadId".into(), json!(ctx.thread_id()));
        self.mirror(ctx, DbOperation::Insert, Self::table(cfg, "deals"), row, Row::new())
            .await?;

        Ok(NodeResult::ok(json!({ "operation": "create_deal", "deal": created }))
            .with_variable("crmDealId", json!(created.id)))
    }
}

#[async_trait]
impl NodeExecutor for CrmExecutor {
    fn name(&self) -> &'static str {
        "hubspot"
    }

    #[tracing::instrument(name = "crm_node_execute", skip(self, ctx), fields(node_id = %ctx.node_id()))]
    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeResult, NodeError> {
        let cfg: DatabaseNodeConfig = ctx.config_as()?;
        match cfg.operation.as_str() {
            "create_contact" | "createContact" => self.create_contact(ctx, &cfg).await,
            "update_contact" | "updateContact" => self.update_contact(ctx, &cfg).await,
            "get_contact" | "getContact" | "find_contact" => self.get_contact(ctx, &cfg).await,
            "create_deal" | "createDeal" => self.create_deal(ctx, &cfg).await,
            _ => self.generic.run(ctx, &cfg).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::definition::FlowNode;
    use crate::ports::{InMemoryCrm, InMemoryDatabase};

    fn ctx(node_type: &str, config: Value) -> NodeContext {
        let mut ctx = NodeContext::dummy(FlowNode::new("db", node_type, config));
        ctx.set_variable("name", json!("Ana"));
        ctx.set_variable("email", json!("ana@example.com"));
        ctx
    }

    #[test]
    fn unresolved_conditions_are_dropped() {
        let ctx = ctx(
            "database",
            json!({
                "operation": "select",
                "table": "users",
                "fields": ["name", "missing"],
                "conditions": {"email": "{{email}}", "tenant": "{{tenant}}", "region": "eu-{region}", "active": true}
            }),
        );
        let cfg: DatabaseNodeConfig = ctx.config_as().unwrap();
        let query = build_query(&ctx, &cfg, DbOperation::Select).unwrap();

        assert_eq!(query.values, Row::from_iter([("name".to_string(), json!("Ana"))]));
        assert_eq!(
            query.predicates,
            Row::from_iter([
                ("email".to_string(), json!("ana@example.com")),
                ("active".to_string(), json!(true)),
            ])
        );
    }

    #[tokio::test]
    async fn insert_then_select_into_output_variable() {
        let db = Arc::new(InMemoryDatabase::new());
        let exec = DatabaseExecutor::new(db.clone());

        let mut insert = ctx(
            "database",
            json!({"operation": "insert", "table": "leads", "fields": ["name", "email"], "values": {"source": "wa:{{name}}"}}),
        );
        let result = exec.execute(&mut insert).await.unwrap();
        assert!(result.success);
        assert_eq!(db.rows("leads")[0]["source"], "wa:Ana");

        let mut select = ctx(
            "database",
            json!({"operation": "select", "table": "leads", "conditions": {"email": "{{email}}"}, "outputVariable": "leads"}),
        );
        let result = exec.execute(&mut select).await.unwrap();
        assert_eq!(result.output["count"], 1);
        let vars = result.variables.unwrap();
        assert_eq!(vars["leads"][0]["name"], "Ana");
    }

    #[tokio::test]
    async fn unresolved_filters_never_touch_the_whole_table() {
        let db = Arc::new(InMemoryDatabase::new());
        db.seed(
            "leads",
            vec![
                Row::from_iter([("email".to_string(), json!("ana@example.com")), ("status".to_string(), json!("new"))]),
                Row::from_iter([("email".to_string(), json!("bob@example.com")), ("status".to_string(), json!("new"))]),
            ],
        );
        let exec = DatabaseExecutor::new(db.clone());

        for operation in ["update", "delete"] {
            let mut blind = ctx(
                "database",
                json!({"operation": operation, "table": "leads", "values": {"status": "lost"}, "conditions": {"email": "{{leadEmail}}"}}),
            );
            let result = exec.execute(&mut blind).await.unwrap();
            assert!(!result.success);
            assert_eq!(result.error.as_deref(), Some("no resolvable conditions"));
            assert_eq!(result.output["affected"], 0);
        }
        let rows = db.rows("leads");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["status"] == "new"));

        let mut targeted = ctx(
            "database",
            json!({"operation": "update", "table": "leads", "values": {"status": "won"}, "conditions": {"email": "{{email}}"}}),
        );
        let result = exec.execute(&mut targeted).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["affected"], 1);
    }

    #[tokio::test]
    async fn unknown_operation_and_missing_table_are_config_errors() {
        let exec = DatabaseExecutor::new(Arc::new(InMemoryDatabase::new()));
        let mut bad_op = ctx("database", json!({"operation": "upsert", "table": "t"}));
        assert!(matches!(exec.execute(&mut bad_op).await, Err(NodeError::InvalidConfig(_))));
        let mut no_table = ctx("database", json!({"operation": "select"}));
        assert!(matches!(exec.execute(&mut no_table).await, Err(NodeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn crm_contact_is_created_and_mirrored() {
        let db = Arc::new(InMemoryDatabase::new());
        let crm = Arc::new(InMemoryCrm::new());
        let exec = CrmExecutor::new(db.clone(), crm.clone());

        let mut create = ctx("hubspot", json!({"operation": "create_contact", "properties": {"lead_source": "{{name}} via WA"}}));
        let result = exec.execute(&mut create).await.unwrap();
        let crm_id = result.variables.as_ref().unwrap()["crmContactId"].as_str().unwrap().to_string();

        let contact = crm.contact(&crm_id).unwrap();
        assert_eq!(contact.phone.as_deref(), Some("+34600000000"));
        assert_eq!(contact.properties["lead_source"], "Ana via WA");
        let rows = db.rows("contacts");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["crmId"], json!(crm_id));

        let mut get = ctx("hubspot", json!({"operation": "get_contact"}));
        let found = exec.execute(&mut get).await.unwrap();
        assert_eq!(found.handle.as_deref(), Some("found"));
        assert_eq!(db.rows("contacts").len(), 1);
    }

    #[tokio::test]
    async fn crm_update_without_contact_fails_softly() {
        let exec = CrmExecutor::new(Arc::new(InMemoryDatabase::new()), Arc::new(InMemoryCrm::new()));
        let mut update = ctx("hubspot", json!({"operation": "update_contact"}));
        let result = exec.execute(&mut update).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("contact not found"));
    }

    #[tokio::test]
    async fn crm_deal_links_contact_and_generic_ops_fall_through() {
        let db = Arc::new(InMemoryDatabase::new());
        let crm = Arc::new(InMemoryCrm::new());
        let exec = CrmExecutor::new(db.clone(), crm.clone());

        let mut deal = ctx("hubspot", json!({"operation": "create_deal"}));
        deal.set_variable("crmContactId", json!("c-1"));
        deal.set_variable("dealAmount", json!("199.5"));
        exec.execute(&mut deal).await.unwrap();
        let deals = crm.deals();
        assert_eq!(deals[0].contact_id.as_deref(), Some("c-1"));
        assert_eq!(deals[0].amount, Some(199.5));
        assert_eq!(db.rows("deals").len(), 1);

        let mut generic = ctx("hubspot", json!({"operation": "insert", "table": "notes", "fields": ["name"]}));
        exec.execute(&mut generic).await.unwrap();
        assert_eq!(db.rows("notes").len(), 1);
    }
}
