use crate::error::IngestError;
use crate::models::{Chunk, ChunkLocation, Document, DocumentStructure, PageSpan, TextSpan};
use sha2::{Digest, Sha256};

/// Chunk size and overlap, both counted in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            overlap: 150,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap ({}) must be less than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Calling this again on the same document restarts the sequence and
    /// yields identical chunks.
    pub fn chunks<'a>(&self, document: &'a Document) -> ChunkIter<'a> {
        let boundaries = document
            .raw_text
            .char_indices()
            .map(|(offset, _)| offset)
            .chain(std::iter::once(document.raw_text.len()))
            .collect();

        let cursor = match &document.structure {
            DocumentStructure::Rows { .. } => Cursor::Rows { next_row: 0 },
            DocumentStructure::Plain | DocumentStructure::Pages { .. } => {
                Cursor::Chars { start: 0 }
            }
        };

        ChunkIter {
            document,
            config: self.config,
            boundaries,
            cursor,
            sequence: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Chars { start: usize },
    Rows { next_row: usize },
    Done,
}

#[derive(Debug, Clone)]
pub struct ChunkIter<'a> {
    document: &'a Document,
    config: ChunkingConfig,
    /// Byte offset of every char, plus the text length.
    boundaries: Vec<usize>,
    cursor: Cursor,
    sequence: u64,
}

impl ChunkIter<'_> {
    fn char_len(&self) -> usize {
        self.boundaries.len() - 1
    }

    fn slice(&self, start: usize, end: usize) -> &str {
        &self.document.raw_text[self.boundaries[start]..self.boundaries[end]]
    }

    fn next_char_window(&mut self, start: usize) -> Option<(usize, usize)> {
        let len = self.char_len();
        if start >= len {
            self.cursor = Cursor::Done;
            return None;
        }

        let end = (start + self.config.chunk_size).min(len);
        self.cursor = if end == len {
            Cursor::Done
        } else {
            Cursor::Chars {
                start: end - self.config.overlap,
            }
        };
        Some((start, end))
    }

    fn next_row_group(
        &mut self,
        rows: &[TextSpan],
        first: usize,
    ) -> Option<(usize, usize, ChunkLocation)> {
        if first >= rows.len() {
            self.cursor = Cursor::Done;
            return None;
        }

        let size = self.config.chunk_size;
        let overlap = self.config.overlap;
        let start = rows[first].start;

        let mut last = first;
        while last + 1 < rows.len() && rows[last + 1].end - start <= size {
            last += 1;
        }

        self.cursor = if last + 1 >= rows.len() {
            Cursor::Done
        } else {
            let upcoming_end = rows[last + 1].end;
            let tail_end = rows[last].end;
            let mut next = last + 1;
            while next - 1 > first
                && tail_end - rows[next - 1].start <= overlap
                && upcoming_end - rows[next - 1].start <= size
            {
                next -= 1;
            }
            Cursor::Rows { next_row: next }
        };

        Some((start, rows[last].end, ChunkLocation::Rows { first, last }))
    }
}

impl Iterator for ChunkIter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        let document = self.document;
        let (start, end, location) = match self.cursor {
            Cursor::Done => return None,
            Cursor::Chars { start } => {
                let (start, end) = self.next_char_window(start)?;
                let location = match &document.structure {
                    DocumentStructure::Pages { pages } => page_location(pages, start, end),
                    _ => ChunkLocation::Text,
                };
                (start, end, location)
            }
            Cursor::Rows { next_row } => {
                let rows = match &document.structure {
                    DocumentStructure::Rows { rows } => rows,
                    _ => return None,
                };
                self.next_row_group(rows, next_row)?
            }
        };

        let sequence_index = self.sequence;
        self.sequence += 1;

        Some(Chunk {
            id: make_chunk_id(&document.id, sequence_index, &document.content_hash),
            document_id: document.id.clone(),
            sequence_index,
            text: self.slice(start, end).to_string(),
            start_offset: start,
            end_offset: end,
            location,
        })
    }
}

fn page_location(pages: &[PageSpan], start: usize, end: usize) -> ChunkLocation {
    let first = pages.iter().find(|page| page.span.end > start);
    let last = pages.iter().rev().find(|page| page.span.start < end);
    match (first, last) {
        (Some(first), Some(last)) => ChunkLocation::Pages {
            first: first.number,
            last: last.number.max(first.number),
        },
        _ => ChunkLocation::Text,
    }
}

pub fn make_chunk_id(document_id: &str, sequence_index: u64, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(sequence_index.to_le_bytes());
    hasher.update(content_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}
