//! HTTP backends for `book_core`'s `TextGenerator` trait.

mod base_url;
mod error;
mod llm;
mod retry;

pub use base_url::{check_base_url, ollama_base_url};
pub use error::AdapterError;
pub use llm::{
    create_generator, create_generator_from_profile, list_models, parse_ndjson_stream,
    parse_sse_stream, BackendKind, OllamaAdapter, OpenAiLikeAdapter,
};
pub use retry::{call_with_retry, RetryConfig};

pub use book_core::config::{BackendConfig, Config, ConfigStore};
pub use book_core::generation::{GenerationError, GenerationRequest, TextGenerator};
