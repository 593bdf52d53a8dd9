pub mod chat_stream;
pub mod embeddings;
pub mod prompt;
pub mod rerank;
