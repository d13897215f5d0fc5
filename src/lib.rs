pub mod chunking;
pub mod cli;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod ollama;
pub mod rag;
