//! # LLM Access
//!
//! Everything between a stage and a model endpoint: per-endpoint throttling,
//! the transport seam, token counting, typed outputs and the retrying
//! invoker that ties them together.

pub mod invoker;
pub mod outputs;
pub mod retry;
pub mod schema;
pub mod throttle;
pub mod tokenizer;
pub mod transport;

pub use invoker::ResilientInvoker;
pub use retry::RetryPolicy;
pub use schema::StructuredOutput;
pub use throttle::{ThrottlePermit, ThrottleRegistry};
pub use tokenizer::{Cl100kTokenizer, Tokenizer, WhitespaceTokenizer};
pub use transport::{ChatMessage, ModelTransport, OllamaTransport, Prompt};
