//! Text partitioning.
//!
//! Text is cut into chunks bounded by a token budget. Chunk boundaries
//! prefer paragraph breaks, then sentence breaks; a sentence that alone
//! exceeds the budget is split on words, and a single oversized word on
//! characters. Consecutive chunks share up to `overlap_tokens` of trailing
//! text for context continuity.

use crate::embeddings::estimate_tokens;

const PARAGRAPH_SEP: &str = "\n\n";
const SENTENCE_SEP: &str = " ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    max_tokens: usize,
    overlap_tokens: usize,
}

/// Smallest piece the packer works with.
#[derive(Debug, Clone)]
struct Unit {
    text: String,
    /// Starts a paragraph.
    paragraph: bool,
}

impl Partitioner {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        let max_tokens = max_tokens.max(1);
        Self {
            max_tokens,
            overlap_tokens: overlap_tokens.min(max_tokens / 2),
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Largest byte length whose estimate stays within the budget.
    fn max_bytes(&self) -> usize {
        ((self.max_tokens as f64) * 3.5).floor().max(1.0) as usize
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let units = self.units(text);
        self.pack(units)
    }

    fn units(&self, text: &str) -> Vec<Unit> {
        let mut units = Vec::new();
        for paragraph in split_paragraphs(text) {
            if estimate_tokens(&paragraph) <= self.max_tokens {
                units.push(Unit {
                    text: paragraph,
                    paragraph: true,
                });
                continue;
            }

            let mut first = true;
            for sentence in split_sentences(&paragraph) {
                let pieces = if estimate_tokens(&sentence) <= self.max_tokens {
                    vec![sentence]
                } else {
                    hard_split(&sentence, self.max_bytes())
                };
                for piece in pieces {
                    units.push(Unit {
                        text: piece,
                        paragraph: first,
                    });
                    first = false;
                }
            }
        }
        units
    }

    fn pack(&self, units: Vec<Unit>) -> Vec<String> {
        let max_bytes = self.max_bytes();
        let mut chunks = Vec::new();
        let mut current: Vec<Unit> = Vec::new();
        let mut current_len = 0usize;

        for unit in units {
            let sep_len = if current.is_empty() { 0 } else { separator(&unit).len() };
            if !current.is_empty() && current_len + sep_len + unit.text.len() > max_bytes {
                chunks.push(join(&current));
                current = self.overlap_tail(&current);
                while !current.is_empty()
                    && joined_len(&current) + separator(&unit).len() + unit.text.len() > max_bytes
                {
                    current.remove(0);
                }
                current_len = joined_len(&current);
            }
            let sep_len = if current.is_empty() { 0 } else { separator(&unit).len() };
            current_len += sep_len + unit.text.len();
            current.push(unit);
        }

        if !current.is_empty() {
            chunks.push(join(&current));
        }
        chunks
    }

    /// Trailing units of the finished chunk that fit in the overlap budget.
    fn overlap_tail(&self, finished: &[Unit]) -> Vec<Unit> {
        if self.overlap_tokens == 0 {
            return Vec::new();
        }
        let overlap_bytes = ((self.overlap_tokens as f64) * 3.5).floor() as usize;

        let mut tail: Vec<Unit> = Vec::new();
        let mut len = 0usize;
        for unit in finished.iter().rev() {
            let added = unit.text.len() + if tail.is_empty() { 0 } else { separator(unit).len() };
            if len + added > overlap_bytes {
                break;
            }
            len += added;
            tail.push(unit.clone());
        }
        // The previous chunk must not be repeated whole.
        if tail.len() == finished.len() {
            tail.pop();
        }
        tail.reverse();
        tail
    }
}

fn separator(unit: &Unit) -> &'static str {
    if unit.paragraph {
        PARAGRAPH_SEP
    } else {
        SENTENCE_SEP
    }
}

fn join(units: &[Unit]) -> String {
    let mut out = String::with_capacity(joined_len(units));
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            out.push_str(separator(unit));
        }
        out.push_str(&unit.text);
    }
    out
}

fn joined_len(units: &[Unit]) -> usize {
    units
        .iter()
        .enumerate()
        .map(|(i, u)| u.text.len() + if i > 0 { separator(u).len() } else { 0 })
        .sum()
}

/// Paragraphs are separated by blank lines; inner whitespace is kept.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n").trim().to_string());
    }
    paragraphs.retain(|p| !p.is_empty());
    paragraphs
}

/// Sentence ends at `.`, `?` or `!` followed by whitespace, or at a newline.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let end = match c {
            '\n' => Some(i),
            '.' | '?' | '!' => match chars.peek() {
                Some((_, next)) if next.is_whitespace() => Some(i + c.len_utf8()),
                None => Some(i + c.len_utf8()),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = end {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Split on whitespace into pieces of at most `max_bytes`; words longer
/// than that are cut on char boundaries.
fn hard_split(text: &str, max_bytes: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let needed = if current.is_empty() { word.len() } else { current.len() + 1 + word.len() };
        if needed <= max_bytes {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
            continue;
        }
        if !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        if word.len() <= max_bytes {
            current.push_str(word);
            continue;
        }
        let mut rest = word;
        while rest.len() > max_bytes {
            let mut cut = max_bytes;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut == 0 {
                // Single char wider than the budget.
                cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
            }
            pieces.push(rest[..cut].to_string());
            rest = &rest[cut..];
        }
        current.push_str(rest);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = Partitioner::new(100, 10).split("Short text.");
        assert_eq!(chunks, vec!["Short text."]);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(Partitioner::new(100, 10).split("  \n\n ").is_empty());
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let first = "a".repeat(60);
        let second = "b".repeat(60);
        let text = format!("{first}\n\n{second}");
        // 120 bytes of text plus separator does not fit in 30 tokens (105 bytes).
        let chunks = Partitioner::new(30, 0).split(&text);
        assert_eq!(chunks, vec![first, second]);
    }

    #[test]
    fn splits_long_paragraph_on_sentences() {
        let text = "This is sentence one. This is sentence two. This is sentence three. \
                    This is sentence four. This is sentence five. This is sentence six.";
        let chunks = Partitioner::new(15, 0).split(text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(estimate_tokens(chunk) <= 15, "chunk too large: {chunk:?}");
            assert!(chunk.ends_with('.'), "chunk not cut on a sentence: {chunk:?}");
        }
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn oversized_sentence_is_hard_split() {
        let text = "word ".repeat(200);
        let chunks = Partitioner::new(10, 0).split(&text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| estimate_tokens(c) <= 10));

        let long_word = "x".repeat(100);
        let chunks = Partitioner::new(5, 0).split(&long_word);
        assert!(chunks.iter().all(|c| estimate_tokens(c) <= 5));
        assert_eq!(chunks.concat(), long_word);
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "Alpha one. Beta two. Gamma three. Delta four. Epsilon five. Zeta six.";
        let chunks = Partitioner::new(10, 4).split(text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let last_sentence = pair[0].rsplit(". ").next().unwrap();
            assert!(
                pair[1].starts_with(last_sentence),
                "{:?} does not start with {:?}",
                pair[1],
                last_sentence
            );
        }
        assert!(chunks.iter().all(|c| estimate_tokens(c) <= 10));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(50);
        let chunks = Partitioner::new(3, 0).split(&text);
        assert_eq!(chunks.concat(), text);
    }
}
