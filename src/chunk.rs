//! Context-preserving markdown chunker.
//!
//! Splits page markdown into chunks whose rendered size (characters plus
//! joining newlines) never exceeds a configured maximum. Every chunk after
//! a boundary re-states the heading breadcrumb it sits under and, when the
//! boundary falls inside a table, the table's header and separator rows, so
//! each chunk reads correctly on its own.
//!
//! # Algorithm
//!
//! 1. Pre-split any source line longer than the width budget into fixed
//!    width pieces.
//! 2. Track a heading stack: a `#` line pops every entry of equal or deeper
//!    level, then pushes itself.
//! 3. Track the current table: first `|` row is the header, a following
//!    row of `|-: ` characters is the separator, anything else resets.
//! 4. Accumulate lines greedily. When the next line does not fit, close the
//!    chunk and open a new one seeded with the carried context.
//! 5. Flush the trailing chunk.
//!
//! Carried context is best-effort: when context plus the next line would
//! overflow, outer headings are dropped first, then the table header. The
//! caller-supplied preface line is never dropped; the pre-split width
//! reserves room for it.
//!
//! # Example
//!
//! ```rust
//! use knowledge_sync::chunk::{split_markdown, SplitOptions};
//!
//! let chunks = split_markdown("# Title\n\nShort body.", &SplitOptions::new(100)).unwrap();
//! assert_eq!(chunks, vec!["# Title\n\nShort body.".to_string()]);
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Chunk;

#[derive(Debug, Error, PartialEq)]
pub enum ChunkError {
    #[error("chunk size must be > 0")]
    ZeroSize,

    #[error("lines are too long to fit in a chunk of {size} characters")]
    LinesTooLong { size: usize },
}

/// Options for [`split_markdown`].
#[derive(Debug, Clone)]
pub struct SplitOptions<'a> {
    /// Maximum rendered characters per chunk.
    pub size: usize,
    /// Optional preface line placed at the top of every chunk.
    pub context: Option<&'a str>,
}

impl<'a> SplitOptions<'a> {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            context: None,
        }
    }

    pub fn with_context(mut self, context: &'a str) -> Self {
        self.context = Some(context);
        self
    }
}

/// One chunk, with carried-forward context kept apart from its own lines.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownChunk {
    /// Preface, heading breadcrumb, and table header lines.
    pub context: Vec<String>,
    /// Lines taken from the source document.
    pub lines: Vec<String>,
    /// `joined[i]` is true when `lines[i]` and the following line are pieces
    /// of the same over-long source line.
    pub joined: Vec<bool>,
}

impl MarkdownChunk {
    fn new(context: Vec<String>) -> Self {
        Self {
            context,
            lines: Vec::new(),
            joined: Vec::new(),
        }
    }

    fn push(&mut self, line: String, joined: bool) {
        self.lines.push(line);
        self.joined.push(joined);
    }

    /// Rendered size: every line plus one newline between consecutive lines.
    pub fn size(&self) -> usize {
        let all: Vec<&str> = self
            .context
            .iter()
            .chain(self.lines.iter())
            .map(String::as_str)
            .collect();
        get_chunk_size(&all)
    }

    pub fn render(&self) -> String {
        self.context
            .iter()
            .chain(self.lines.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `sum(len(line)) + (lines - 1)`, measured in characters.
pub fn get_chunk_size(lines: &[&str]) -> usize {
    if lines.is_empty() {
        return 0;
    }
    lines.iter().map(|l| char_len(l)).sum::<usize>() + lines.len() - 1
}

/// Split markdown into rendered chunks of at most `opts.size` characters.
pub fn split_markdown(markdown: &str, opts: &SplitOptions<'_>) -> Result<Vec<String>, ChunkError> {
    Ok(split_markdown_chunks(markdown, opts)?
        .iter()
        .map(MarkdownChunk::render)
        .collect())
}

/// Like [`split_markdown`], but keeps context and content lines apart.
pub fn split_markdown_chunks(
    markdown: &str,
    opts: &SplitOptions<'_>,
) -> Result<Vec<MarkdownChunk>, ChunkError> {
    let size = opts.size;
    if size == 0 {
        return Err(ChunkError::ZeroSize);
    }
    if markdown.is_empty() {
        return Ok(Vec::new());
    }

    let preface: Vec<String> = opts.context.map(|c| vec![c.to_string()]).unwrap_or_default();
    let reserved: usize = preface.iter().map(|l| char_len(l) + 1).sum();
    if reserved >= size {
        return Err(ChunkError::LinesTooLong { size });
    }
    let width = size - reserved;

    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut table = TableState::default();
    let mut chunks = Vec::new();
    let mut current: Option<MarkdownChunk> = None;
    // Rendered size of `current`.
    let mut current_size = 0;

    for segment in pre_split(markdown, width) {
        let line = segment.text;
        let level = if segment.first {
            heading_level(&line)
        } else {
            None
        };
        if let Some(level) = level {
            headings.retain(|(l, _)| *l < level);
        }
        let is_table = segment.first && is_table_line(&line);
        let carried_table = if is_table {
            table.carried()
        } else {
            Vec::new()
        };

        let line_len = char_len(&line);
        let fits = current.is_some() && current_size + 1 + line_len <= size;

        if !fits {
            if let Some(done) = current.take() {
                if !done.lines.is_empty() {
                    chunks.push(done);
                }
            }
            let context = fit_context(&preface, &headings, &carried_table, &line, size)?;
            let refs: Vec<&str> = context.iter().map(String::as_str).collect();
            current_size = get_chunk_size(&refs);
            current = Some(MarkdownChunk::new(context));
        }

        if let Some(chunk) = current.as_mut() {
            current_size = if chunk.context.is_empty() && chunk.lines.is_empty() {
                line_len
            } else {
                current_size + 1 + line_len
            };
            chunk.push(line.clone(), segment.continues);
        }

        if segment.first {
            if let Some(level) = level {
                headings.push((level, line));
            } else if is_table {
                table.observe(line);
            } else {
                table.reset();
            }
        }
    }

    if let Some(done) = current.take() {
        if !done.lines.is_empty() {
            chunks.push(done);
        }
    }

    Ok(chunks)
}

/// Chunk a stored document's markdown into [`Chunk`] records.
///
/// Returns chunks with contiguous indices starting at 0; an empty body
/// yields a single empty chunk so every document is addressable.
pub fn chunk_document(
    document_id: &str,
    markdown: &str,
    size: usize,
    context: Option<&str>,
) -> Result<Vec<Chunk>, ChunkError> {
    let mut opts = SplitOptions::new(size);
    opts.context = context;
    let rendered = split_markdown(markdown, &opts)?;
    if rendered.is_empty() {
        return Ok(vec![make_chunk(document_id, 0, "")]);
    }
    Ok(rendered
        .iter()
        .enumerate()
        .map(|(i, text)| make_chunk(document_id, i as i64, text))
        .collect())
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}

struct Segment {
    text: String,
    /// First piece of its source line.
    first: bool,
    /// Another piece of the same source line follows.
    continues: bool,
}

fn pre_split(markdown: &str, width: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    for line in markdown.split('\n') {
        let chars: Vec<char> = line.chars().collect();
        if chars.len() <= width {
            segments.push(Segment {
                text: line.to_string(),
                first: true,
                continues: false,
            });
            continue;
        }
        let pieces: Vec<&[char]> = chars.chunks(width).collect();
        let last = pieces.len() - 1;
        for (i, piece) in pieces.into_iter().enumerate() {
            segments.push(Segment {
                text: piece.iter().collect(),
                first: i == 0,
                continues: i < last,
            });
        }
    }
    segments
}

/// Pick the largest carried context that still fits alongside `line`.
fn fit_context(
    preface: &[String],
    headings: &[(usize, String)],
    table: &[String],
    line: &str,
    size: usize,
) -> Result<Vec<String>, ChunkError> {
    let mut headings: Vec<&str> = headings.iter().map(|(_, h)| h.as_str()).collect();
    let mut table: Vec<&str> = table.iter().map(String::as_str).collect();

    loop {
        let candidate: Vec<&str> = preface
            .iter()
            .map(String::as_str)
            .chain(headings.iter().copied())
            .chain(table.iter().copied())
            .collect();
        let mut with_line = candidate.clone();
        with_line.push(line);
        if get_chunk_size(&with_line) <= size {
            return Ok(candidate.into_iter().map(str::to_string).collect());
        }
        if !headings.is_empty() {
            headings.remove(0);
        } else if !table.is_empty() {
            table.clear();
        } else {
            return Err(ChunkError::LinesTooLong { size });
        }
    }
}

#[derive(Default)]
struct TableState {
    header: Option<String>,
    separator: Option<String>,
    /// Data rows seen after the separator.
    rows: usize,
}

impl TableState {
    /// Table lines a chunk starting at the next table row must repeat:
    /// header and separator, once at least one data row has been seen.
    fn carried(&self) -> Vec<String> {
        match (&self.header, &self.separator) {
            (Some(h), Some(s)) if self.rows > 0 => vec![h.clone(), s.clone()],
            _ => Vec::new(),
        }
    }

    fn observe(&mut self, line: String) {
        match (&self.header, &self.separator) {
            (None, _) => self.header = Some(line),
            (Some(_), None) => {
                if is_separator_line(&line) {
                    self.separator = Some(line);
                } else {
                    self.header = Some(line);
                }
            }
            (Some(_), Some(_)) => self.rows += 1,
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

fn heading_level(line: &str) -> Option<usize> {
    if !line.starts_with('#') {
        return None;
    }
    Some(line.chars().take_while(|c| *c == '#').count())
}

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn is_separator_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed
            .chars()
            .all(|c| c == '|' || c == '-' || c == ':' || c.is_whitespace())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuild the source from content lines only.
    fn reassemble(chunks: &[MarkdownChunk]) -> String {
        let mut out = String::new();
        let total: usize = chunks.iter().map(|c| c.lines.len()).sum();
        let mut seen = 0;
        for chunk in chunks {
            for (line, joined) in chunk.lines.iter().zip(chunk.joined.iter()) {
                seen += 1;
                out.push_str(line);
                if !joined && seen < total {
                    out.push('\n');
                }
            }
        }
        out
    }

    fn sample_doc() -> String {
        let mut doc = String::from("# Guide\n\nIntro paragraph for the guide.\n\n## Install\n\n");
        for i in 0..30 {
            doc.push_str(&format!("Step {} of the install, run the command and wait.\n", i));
        }
        doc.push_str("\n## Reference\n\n| flag | meaning |\n|------|---------|\n");
        for i in 0..20 {
            doc.push_str(&format!("| --opt{} | enables option number {} |\n", i, i));
        }
        doc.push_str("\nTrailing text with a very long url https://example.com/");
        doc.push_str(&"x".repeat(300));
        doc
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_markdown("Hello, world!", &SplitOptions::new(100)).unwrap();
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_markdown("", &SplitOptions::new(100)).unwrap().is_empty());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert_eq!(
            split_markdown("abc", &SplitOptions::new(0)),
            Err(ChunkError::ZeroSize)
        );
    }

    #[test]
    fn test_every_chunk_within_size() {
        let doc = sample_doc();
        for size in [40, 64, 100, 250, 1000] {
            let chunks = split_markdown_chunks(&doc, &SplitOptions::new(size)).unwrap();
            assert!(chunks.len() > 1 || size == 1000);
            for chunk in &chunks {
                assert!(chunk.size() <= size, "size {} exceeded: {}", size, chunk.size());
                assert_eq!(chunk.render().chars().count(), chunk.size());
            }
        }
    }

    #[test]
    fn test_reassembles_original() {
        let doc = sample_doc();
        for size in [40, 77, 300] {
            let chunks = split_markdown_chunks(&doc, &SplitOptions::new(size)).unwrap();
            assert_eq!(reassemble(&chunks), doc, "size {}", size);
        }
    }

    #[test]
    fn test_heading_breadcrumb_carried() {
        let md = "# H1\n## H2\nbody\n## H3\nbody2";
        let chunks = split_markdown(md, &SplitOptions::new(16)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "# H1\n## H2\nbody");
        assert_eq!(chunks[1], "# H1\n## H3\nbody2");
    }

    #[test]
    fn test_sibling_heading_replaces_breadcrumb() {
        let md = "# A\n## B\n### C\ntext one\n## D\ntext two";
        let chunks = split_markdown_chunks(md, &SplitOptions::new(20)).unwrap();
        let last = chunks.last().unwrap();
        assert_eq!(last.context, vec!["# A".to_string()]);
        assert_eq!(last.lines, vec!["## D".to_string(), "text two".to_string()]);
    }

    #[test]
    fn test_table_header_repeated() {
        let md = "| a | b |\n|---|---|\n| 1 | 2 |\n| 3 | 4 |";
        let chunks = split_markdown(md, &SplitOptions::new(30)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "| a | b |\n|---|---|\n| 3 | 4 |");
    }

    #[test]
    fn test_table_header_waits_for_first_row() {
        let md = "| a | b |\n|---|---|\n| 1 | 2 |";
        let chunks = split_markdown_chunks(md, &SplitOptions::new(20)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].context.is_empty());
        assert_eq!(chunks[1].lines, vec!["| 1 | 2 |".to_string()]);

        // Breaking at the separator carries nothing either.
        let chunks = split_markdown_chunks("| a | b |\n|---|---|", &SplitOptions::new(10)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].context.is_empty());
    }

    #[test]
    fn test_long_document_chunks_stay_bounded() {
        let md = "word\n".repeat(20_000);
        let chunks = split_markdown_chunks(&md, &SplitOptions::new(100)).unwrap();
        assert!(chunks.iter().all(|c| c.size() <= 100));
        assert_eq!(reassemble(&chunks), md);
    }

    #[test]
    fn test_table_state_resets_after_table() {
        let md = "| a | b |\n|---|---|\n| 1 | 2 |\nplain line here\nanother plain line";
        let chunks = split_markdown_chunks(md, &SplitOptions::new(30)).unwrap();
        for chunk in &chunks[1..] {
            assert!(!chunk.context.iter().any(|l| l.starts_with('|')));
        }
    }

    #[test]
    fn test_oversized_line_split_into_pieces() {
        let line = "y".repeat(95);
        let chunks = split_markdown_chunks(&line, &SplitOptions::new(20)).unwrap();
        let pieces: Vec<&String> = chunks.iter().flat_map(|c| c.lines.iter()).collect();
        assert_eq!(pieces.len(), 5);
        for piece in &pieces[..4] {
            assert_eq!(piece.chars().count(), 20);
        }
        assert_eq!(pieces[4].chars().count(), 15);
        assert_eq!(reassemble(&chunks), line);
    }

    #[test]
    fn test_context_preface_on_every_chunk() {
        let md = (0..20)
            .map(|i| format!("line number {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let opts = SplitOptions::new(60).with_context("context: Acme docs");
        let chunks = split_markdown(&md, &opts).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.starts_with("context: Acme docs\n"));
            assert!(chunk.chars().count() <= 60);
        }
    }

    #[test]
    fn test_preface_too_long_is_error() {
        let opts = SplitOptions::new(10).with_context("context: far too long");
        assert_eq!(
            split_markdown("body", &opts),
            Err(ChunkError::LinesTooLong { size: 10 })
        );
    }

    #[test]
    fn test_breadcrumb_dropped_when_it_cannot_fit() {
        let md = format!("# Heading\n{}", "z".repeat(30));
        let chunks = split_markdown_chunks(&md, &SplitOptions::new(15)).unwrap();
        for chunk in &chunks {
            assert!(chunk.size() <= 15);
        }
        assert_eq!(reassemble(&chunks), md);
    }

    #[test]
    fn test_multibyte_characters_counted_as_chars() {
        let md = "é".repeat(25);
        let chunks = split_markdown(&md, &SplitOptions::new(10)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 10);
    }

    #[test]
    fn test_chunk_document_indices_contiguous() {
        let doc = sample_doc();
        let chunks = chunk_document("doc1", &doc, 120, None).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.document_id, "doc1");
            assert_eq!(c.hash.len(), 64);
        }
    }

    #[test]
    fn test_chunk_document_empty_body() {
        let chunks = chunk_document("doc1", "", 120, None).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
    }
}
