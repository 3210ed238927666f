//! Registers the built-in executors against their node type tags.
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::executor::ExecutorRegistry;
use crate::node::{tags, NodeExecutor};
use crate::ports::Ports;
use crate::process::condition::{ConditionExecutor, EvaluationMode};
use crate::process::database::{CrmExecutor, DatabaseExecutor};
use crate::process::interaction::{ButtonsExecutor, PromptExecutor, TimeoutExecutor};
use crate::process::message::{EnhancedMessageExecutor, MessageExecutor};
use crate::process::simple::{AssignmentExecutor, CustomerStageExecutor, TagExecutor, TypingExecutor};
use crate::process::webhook::WebhookExecutor;

/// Register every built-in executor; later registrations for the same tag replace these.
pub fn register_builtins(registry: &ExecutorRegistry, ports: &Ports, config: &EngineConfig) {
    let sender = ports.sender.clone();
    let webhook: Arc<dyn NodeExecutor> = Arc::new(WebhookExecutor::new(ports.http.clone(), config.webhook_timeout));
    let buttons: Arc<dyn NodeExecutor> = Arc::new(ButtonsExecutor::new(sender.clone()));
    let hubspot: Arc<dyn NodeExecutor> = match &ports.crm {
        Some(crm) => Arc::new(CrmExecutor::new(ports.database.clone(), crm.clone())),
        None => Arc::new(DatabaseExecutor::new(ports.database.clone())),
    };

    registry.register(tags::MESSAGE, Arc::new(MessageExecutor::new(sender.clone(), config.typing_max_delay)));
    registry.register(
        tags::ENHANCED_MESSAGE,
        Arc::new(EnhancedMessageExecutor::new(sender.clone(), config.typing_max_delay)),
    );

    registry.register(tags::CONDITION, Arc::new(ConditionExecutor::new(ports.classifier.clone())));
    registry.register(
        tags::SMART_CONDITION,
        Arc::new(ConditionExecutor::new(ports.classifier.clone()).with_mode(EvaluationMode::Ai)),
    );
    registry.register(
        tags::ADVANCED_CONDITION,
        Arc::new(ConditionExecutor::new(ports.classifier.clone()).with_mode(EvaluationMode::Advanced)),
    );

    registry.register(tags::DATABASE, Arc::new(DatabaseExecutor::new(ports.database.clone())));
    registry.register(tags::HUBSPOT, hubspot);
    registry.register(tags::WEBHOOK, webhook.clone());
    registry.register(tags::HTTP_REQUEST, webhook);

    registry.register(tags::BUTTONS, buttons.clone());
    registry.register(tags::INTERACTIVE, buttons.clone());
    registry.register(tags::LIST, buttons);
    registry.register(tags::SURVEY, Arc::new(PromptExecutor::new(sender.clone(), tags::SURVEY)));
    registry.register(tags::LOCATION, Arc::new(PromptExecutor::new(sender.clone(), tags::LOCATION)));
    registry.register(tags::TIMEOUT, Arc::new(TimeoutExecutor::new(sender.clone())));

    registry.register(tags::TYPING, Arc::new(TypingExecutor::new(sender, config.typing_max_delay)));
    registry.register(tags::TAG, Arc::new(TagExecutor));
    registry.register(tags::CUSTOMER_STAGE, Arc::new(CustomerStageExecutor));
    registry.register(tags::ASSIGNMENT, Arc::new(AssignmentExecutor));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{InMemoryDatabase, RecordingMessageSender, StubHttpClient};

    #[test]
    fn every_builtin_tag_is_registered() {
        let ports = Ports::local()
            .with_sender(Arc::new(RecordingMessageSender::new()))
            .with_http(Arc::new(StubHttpClient::new()))
            .with_database(Arc::new(InMemoryDatabase::new()))
            .with_crm(None);
        let registry = ExecutorRegistry::new();
        register_builtins(&registry, &ports, &EngineConfig::default());

        for tag in [
            tags::MESSAGE,
            tags::CONDITION,
            tags::SMART_CONDITION,
            tags::HTTP_REQUEST,
            tags::HUBSPOT,
            tags::LOCATION,
            tags::ASSIGNMENT,
        ] {
            assert!(registry.contains(tag), "missing {}", tag);
        }
        assert_eq!(registry.get(tags::HUBSPOT).map(|e| e.name()), Some("database"));
        assert_eq!(registry.get(tags::LIST).map(|e| e.name()), Some("buttons"));
        assert_eq!(registry.tags().len(), 19);
    }
}
