// src/flow.rs

pub mod definition;
pub mod engine;
pub mod registry;
pub mod store;
pub mod thread;

pub use definition::{ErrorHandling, FlowDefinition, FlowEdge, FlowNode, FlowSettings, FlowStatus, FlowVariable};
pub use engine::{EngineError, EngineRuntime, FlowEngine};
pub use registry::{FlowError, FlowRegistry};
pub use store::{FileThreadStore, InMemoryThreadStore, StoreError, ThreadStore};
pub use thread::{ConversationStep, ConversationThread, StepInput, StepStatus, ThreadStatus, VariableStore};
