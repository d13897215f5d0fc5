use crate::chunking::TextSplitter;
use crate::database::{VectorStore, VectorStoreConfig};
use crate::document::Document;
use crate::embeddings::{embed_chunks, Embedding};
use crate::ollama::{OllamaClient, OllamaError};
use anyhow::{ensure, Context, Result};
use log::{info, warn};
use std::env;
use std::path::Path;

const DEFAULT_TOP_K: usize = 3;

pub const QA_SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions based ONLY on the provided context. If the answer cannot be found in the context, respond with 'I cannot answer this question based on the provided document.'";

pub const CHITCHAT_SYSTEM_PROMPT: &str = "You are a friendly and helpful AI assistant. Keep your responses concise and engaging. For questions about specific information, politely explain that you don't have access to that information.";

pub const NO_DOCUMENT: &str = "Please upload a document first to ask questions about it.";

pub const NO_RELEVANT_CHUNKS: &str = "I couldn't find any relevant information in the document to answer your question. Please try asking about something else in the document.";

pub const CANNOT_ANSWER: &str = "I cannot answer this question based on the provided document. Please try asking about something else in the document.";

/// Markers the model uses when the context does not hold the answer
const NO_ANSWER_MARKERS: [&str; 2] = ["cannot answer", "not in the document"];

/// The language model server as seen by the question-answering layer
#[allow(async_fn_in_trait)]
pub trait ModelBackend {
    /// Single-shot completion with the current model
    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, OllamaError>;

    /// One-turn chat with the current model
    async fn chat(&self, prompt: &str, system: Option<&str>) -> Result<String, OllamaError>;

    /// Embed a text for similarity search
    async fn embed(&self, text: &str) -> Result<Embedding, OllamaError>;

    fn available_models(&self) -> &[String];

    fn current_model(&self) -> &str;

    /// Switch models; returns false and keeps the current one if the model is unknown
    fn set_model(&mut self, model_name: &str) -> bool;

    async fn refresh_models(&mut self);
}

impl ModelBackend for OllamaClient {
    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, OllamaError> {
        let response = OllamaClient::generate(self, prompt, system).await?;
        Ok(response.text().to_string())
    }

    async fn chat(&self, prompt: &str, system: Option<&str>) -> Result<String, OllamaError> {
        let response = OllamaClient::chat(self, prompt, system).await?;
        Ok(response.text().to_string())
    }

    async fn embed(&self, text: &str) -> Result<Embedding, OllamaError> {
        OllamaClient::embed(self, text).await
    }

    fn available_models(&self) -> &[String] {
        OllamaClient::available_models(self)
    }

    fn current_model(&self) -> &str {
        OllamaClient::current_model(self)
    }

    fn set_model(&mut self, model_name: &str) -> bool {
        OllamaClient::set_model(self, model_name)
    }

    async fn refresh_models(&mut self) {
        OllamaClient::refresh_models(self).await
    }
}

/// Number of chunks retrieved per question, from `RAG_TOP_K`
pub fn top_k_from_env() -> Result<usize> {
    match env::var("RAG_TOP_K") {
        Ok(value) => {
            let top_k: usize = value.parse().context("RAG_TOP_K must be a number")?;
            ensure!(top_k > 0, "RAG_TOP_K must be positive");
            Ok(top_k)
        }
        Err(_) => Ok(DEFAULT_TOP_K),
    }
}

/// Routes each user message to document question answering or free chat
///
/// Every answer is returned as a displayable string; failures are turned
/// into messages instead of being propagated.
pub struct QaHandler<M: ModelBackend> {
    backend: M,
    splitter: TextSplitter,
    store_config: VectorStoreConfig,
    store: Option<VectorStore>,
    current_context: String,
    top_k: usize,
}

impl<M: ModelBackend> QaHandler<M> {
    pub fn new(backend: M, splitter: TextSplitter, store_config: VectorStoreConfig) -> Self {
        QaHandler {
            backend,
            splitter,
            store_config,
            store: None,
            current_context: String::new(),
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn backend(&self) -> &M {
        &self.backend
    }

    pub fn has_document(&self) -> bool {
        self.store.is_some()
    }

    /// Text of the last successfully processed document
    pub fn current_context(&self) -> &str {
        &self.current_context
    }

    pub fn available_models(&self) -> &[String] {
        self.backend.available_models()
    }

    pub fn current_model(&self) -> &str {
        self.backend.current_model()
    }

    pub fn set_model(&mut self, model_name: &str) -> bool {
        let switched = self.backend.set_model(model_name);
        if switched {
            info!("Model changed to {}", model_name);
        }
        switched
    }

    pub async fn refresh_models(&mut self) {
        self.backend.refresh_models().await
    }

    /// Switch models and forget the indexed document
    pub fn update_model(&mut self, model_name: &str) -> bool {
        let switched = self.set_model(model_name);
        self.store = None;
        self.current_context.clear();
        switched
    }

    /// Extract, chunk, embed and index a document
    ///
    /// Returns the document text, or an error message if any step failed.
    pub async fn process_document<P: AsRef<Path>>(&mut self, file_path: P) -> String {
        match self.try_process_document(file_path).await {
            Ok(content) => content,
            Err(e) => format!("Error processing document: {:#}", e),
        }
    }

    /// Like [`QaHandler::process_document`], but keeps the failure as an error
    pub async fn try_process_document<P: AsRef<Path>>(&mut self, file_path: P) -> Result<String> {
        let document = Document::from_file(file_path.as_ref())?;
        info!(
            "Indexing {} ({})",
            document.document_id, document.mime_type
        );

        let chunks = self
            .splitter
            .split_into_chunks(&document.content, &document.document_id);
        ensure!(!chunks.is_empty(), "Document contains no text");
        info!("Split into {} chunks", chunks.len());

        let embeddings = embed_chunks(&self.backend, &chunks).await?;

        // A failed rebuild leaves no usable index behind
        let mut store = match self.store.take() {
            Some(store) => store,
            None => self.store_config.open().await?,
        };
        if let Err(e) = store
            .rebuild(&document.document_id, chunks, embeddings)
            .await
        {
            self.current_context.clear();
            return Err(e);
        }
        self.store = Some(store);

        self.current_context = document.content.clone();
        Ok(document.content)
    }

    /// Answer strictly from the indexed document
    pub async fn answer_question(&self, question: &str) -> String {
        let Some(store) = &self.store else {
            return NO_DOCUMENT.to_string();
        };

        match self.retrieve(store, question).await {
            Ok(context) => self.answer_from_context(question, &context).await,
            Err(e) => format!("Error generating response: {:#}", e),
        }
    }

    /// Free-form conversation without document context
    pub async fn chitchat(&self, message: &str) -> String {
        match self.backend.chat(message, Some(CHITCHAT_SYSTEM_PROMPT)).await {
            Ok(reply) => reply,
            Err(e) => e.to_string(),
        }
    }

    /// Answer from the document when one is loaded, otherwise chat
    ///
    /// When retrieval itself fails the message is handled as chat.
    pub async fn get_response(&self, query: &str) -> String {
        let Some(store) = &self.store else {
            return self.chitchat(query).await;
        };

        match self.retrieve(store, query).await {
            Ok(context) => self.answer_from_context(query, &context).await,
            Err(e) => {
                warn!("Error in document QA: {:#}", e);
                self.chitchat(query).await
            }
        }
    }

    async fn retrieve(&self, store: &VectorStore, question: &str) -> Result<Vec<String>> {
        let query = self
            .backend
            .embed(question)
            .await
            .context("Failed to embed question")?;
        let chunks = store.search(&query, self.top_k).await?;
        Ok(chunks.into_iter().map(|chunk| chunk.text).collect())
    }

    async fn answer_from_context(&self, question: &str, context: &[String]) -> String {
        if context.is_empty() {
            return NO_RELEVANT_CHUNKS.to_string();
        }

        let prompt = build_prompt(&context.join("\n\n"), question);
        match self.backend.generate(&prompt, Some(QA_SYSTEM_PROMPT)).await {
            Ok(answer) if indicates_no_answer(&answer) => CANNOT_ANSWER.to_string(),
            Ok(answer) => answer,
            Err(e) => e.to_string(),
        }
    }
}

/// Prompt asking the model to answer from the retrieved context only
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "You are a helpful assistant that answers questions based ONLY on the provided context. \n\
         If the answer cannot be found in the context, respond with \"I cannot answer this question based on the provided document.\"\n\
         \n\
         Context: {}\n\
         \n\
         Question: {}\n\
         \n\
         Answer:",
        context, question
    )
}

fn indicates_no_answer(answer: &str) -> bool {
    let answer = answer.to_lowercase();
    NO_ANSWER_MARKERS
        .iter()
        .any(|marker| answer.contains(marker))
}
