//! Provider scoring, registry, and LLM protocol handles.
//!
//! The registry ranks providers by a composite capability score, rotates
//! ties round-robin, serves complexity-aware candidate lists to the
//! dispatcher, and fronts chat-completion calls with model-not-found
//! recovery. Protocol handles abstract the wire differences between
//! openai-compatible endpoints (which also cover local/vllm/ollama
//! deployments) and the scripted mock used in tests.

pub mod protocol;
pub mod registry;
pub mod scorer;

pub use protocol::{ChatMessage, ChatRequest, ChatResponse, LlmProtocol, MockProtocol, ProtocolError};
pub use registry::{ProviderRegistry, RegistryError};
pub use scorer::ScorerWeights;
