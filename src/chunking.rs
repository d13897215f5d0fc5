use anyhow::{ensure, Context, Result};
use log::debug;
use std::env;

const DEFAULT_CHUNK_SIZE: usize = 1000;
const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Separators tried in order, from paragraph breaks down to single characters
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Represents a text chunk with metadata
#[derive(Debug, Clone)]
pub struct TextChunk {
    /// The actual text content of this chunk
    pub text: String,
    /// Estimated token count for this chunk
    pub token_count: usize,
    /// Unique identifier for the document this chunk belongs to
    pub document_id: String,
    /// Starting position (byte offset) of this chunk in the original document
    pub start_position: usize,
}

/// Size limits for the splitter, measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitterConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        SplitterConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl SplitterConfig {
    /// Create a configuration from environment variables, keeping defaults for unset ones
    pub fn from_env() -> Result<Self> {
        let mut config = SplitterConfig::default();
        if let Ok(size) = env::var("RAG_CHUNK_SIZE") {
            config.chunk_size = size.parse().context("RAG_CHUNK_SIZE must be a number")?;
        }
        if let Ok(overlap) = env::var("RAG_CHUNK_OVERLAP") {
            config.chunk_overlap = overlap
                .parse()
                .context("RAG_CHUNK_OVERLAP must be a number")?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "Chunk size must be positive");
        ensure!(
            self.chunk_overlap < self.chunk_size,
            "Chunk overlap ({}) must be smaller than chunk size ({})",
            self.chunk_overlap,
            self.chunk_size
        );
        Ok(())
    }
}

/// Recursive character splitter
///
/// Text is cut on the coarsest separator present, pieces that are still too
/// long are cut again on the next separator, and the resulting pieces are
/// merged back greedily into chunks of at most `chunk_size` characters.
/// Consecutive chunks repeat up to `chunk_overlap` characters of trailing
/// pieces so that context survives the cut.
#[derive(Debug, Clone, Default)]
pub struct TextSplitter {
    config: SplitterConfig,
}

impl TextSplitter {
    pub fn new(config: SplitterConfig) -> Result<Self> {
        config.validate()?;
        Ok(TextSplitter { config })
    }

    pub fn config(&self) -> SplitterConfig {
        self.config
    }

    /// Split text into chunk strings
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
    }

    /// Split text into chunks carrying document metadata
    pub fn split_into_chunks(&self, text: &str, document_id: &str) -> Vec<TextChunk> {
        let mut search_from = 0;

        self.split_text(text)
            .into_iter()
            .map(|chunk| {
                // Chunks appear in document order, so search forward from the last hit.
                // A chunk joined across dropped empty pieces is not verbatim in the
                // text; locate it by its first word instead.
                let start_position = find_from(text, &chunk, search_from)
                    .or_else(|| {
                        debug!("chunk not found verbatim after offset {}", search_from);
                        chunk
                            .split_whitespace()
                            .next()
                            .and_then(|word| find_from(text, word, search_from))
                    })
                    .unwrap_or(search_from);
                search_from = start_position;

                TextChunk {
                    token_count: estimate_token_count(&chunk),
                    text: chunk,
                    document_id: document_id.to_string(),
                    start_position,
                }
            })
            .collect()
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        // Use the first separator that occurs in the text; "" always matches
        let position = separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep))
            .unwrap_or(separators.len() - 1);
        let separator = separators[position];
        let finer = &separators[position + 1..];

        let splits: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();

        for split in splits {
            if char_len(split) < self.config.chunk_size {
                fitting.push(split);
                continue;
            }

            if !fitting.is_empty() {
                chunks.extend(self.merge_splits(&fitting, separator));
                fitting.clear();
            }

            if finer.is_empty() {
                chunks.push(split.to_string());
            } else {
                chunks.extend(self.split_recursive(split, finer));
            }
        }

        if !fitting.is_empty() {
            chunks.extend(self.merge_splits(&fitting, separator));
        }

        chunks
    }

    /// Greedily join pieces into chunks, carrying trailing pieces over as overlap
    fn merge_splits(&self, splits: &[&str], separator: &str) -> Vec<String> {
        let separator_len = char_len(separator);
        // Separator cost of adding a piece after `count` existing ones
        let joiner = |count: usize| if count > 0 { separator_len } else { 0 };

        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut total = 0;

        for &split in splits {
            let len = char_len(split);

            if total + len + joiner(current.len()) > self.config.chunk_size && !current.is_empty() {
                if let Some(chunk) = join_trimmed(&current, separator) {
                    chunks.push(chunk);
                }

                // Drop leading pieces until what is left fits as overlap and leaves room
                while total > self.config.chunk_overlap
                    || (total > 0 && total + len + joiner(current.len()) > self.config.chunk_size)
                {
                    let removed = current.remove(0);
                    total -= char_len(removed) + joiner(current.len());
                }
            }

            total += len + joiner(current.len());
            current.push(split);
        }

        if let Some(chunk) = join_trimmed(&current, separator) {
            chunks.push(chunk);
        }

        chunks
    }
}

fn find_from(text: &str, needle: &str, from: usize) -> Option<usize> {
    text.get(from..)?.find(needle).map(|offset| from + offset)
}

fn join_trimmed(pieces: &[&str], separator: &str) -> Option<String> {
    let joined = pieces.join(separator);
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Calculate approximate token count for a text
/// This is a very simple estimation - words plus punctuation
pub fn estimate_token_count(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let punctuation = text.chars().filter(|c| c.is_ascii_punctuation()).count();
    words + punctuation
}
