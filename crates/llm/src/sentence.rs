//! Sentence chunking for streamed completions
//!
//! Tokens arrive a few characters at a time; speech synthesis wants whole
//! sentences. The chunker buffers text and releases it at sentence
//! terminators, or at a word boundary once the buffer grows too long.

use unicode_segmentation::UnicodeSegmentation;

const TERMINATORS: &[char] = &['.', '!', '?', ';', '\n'];
const CLOSERS: &[char] = &['"', '\'', ')', ']', '\u{201D}', '\u{2019}'];

#[derive(Debug, Clone)]
pub struct SentenceChunkerConfig {
    /// Shortest text emitted at a terminator, so "Hi." does not become its
    /// own synthesis request
    pub min_chars: usize,
    /// Force emission past this many buffered characters
    pub max_buffer_chars: usize,
}

impl Default for SentenceChunkerConfig {
    fn default() -> Self {
        Self {
            min_chars: 12,
            max_buffer_chars: 240,
        }
    }
}

#[derive(Debug, Default)]
pub struct SentenceChunker {
    config: SentenceChunkerConfig,
    buffer: String,
}

impl SentenceChunker {
    pub fn new(config: SentenceChunkerConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
        }
    }

    /// Add streamed text and take every sentence it completes
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut sentences = Vec::new();

        while let Some(end) = self.next_boundary() {
            let sentence: String = self.buffer.drain(..end).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }

        if self.buffer.chars().count() >= self.config.max_buffer_chars {
            let cut = self.word_cut();
            let forced: String = self.buffer.drain(..cut).collect();
            let forced = forced.trim();
            if !forced.is_empty() {
                sentences.push(forced.to_string());
            }
        }

        sentences
    }

    /// Whatever is buffered when the stream ends
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Byte offset just past the first terminator (and any closing quotes)
    /// that is followed by whitespace and leaves a long enough sentence
    fn next_boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if !TERMINATORS.contains(&c) {
                continue;
            }
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if CLOSERS.contains(&next) {
                    end = j + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            // "3.5" or "e.g." mid-word is not a boundary; the text after the
            // terminator must have started
            let followed_by_space = match self.buffer[end..].chars().next() {
                Some(next) => next.is_whitespace(),
                None => false,
            };
            if (followed_by_space || c == '\n')
                && self.buffer[..end].trim().chars().count() >= self.config.min_chars
            {
                return Some(end);
            }
        }
        None
    }

    /// Cut at the last word boundary, or take everything if there is none
    fn word_cut(&self) -> usize {
        self.buffer
            .split_word_bound_indices()
            .filter(|(_, word)| word.chars().all(char::is_whitespace))
            .map(|(i, _)| i)
            .filter(|i| *i > 0)
            .last()
            .unwrap_or(self.buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentences_across_tokens() {
        let mut chunker = SentenceChunker::default();
        let mut out = Vec::new();
        for token in ["Hello Alice", ", what is", " today's date?", " Also", " the site."] {
            out.extend(chunker.push(token));
        }
        assert_eq!(out, vec!["Hello Alice, what is today's date?"]);
        assert_eq!(chunker.flush().as_deref(), Some("Also the site."));
        assert_eq!(chunker.flush(), None);
    }

    #[test]
    fn test_short_sentence_merges_with_next() {
        let mut chunker = SentenceChunker::default();
        assert!(chunker.push("Sure. ").is_empty());
        let out = chunker.push("What is your name? ");
        assert_eq!(out, vec!["Sure. What is your name?"]);
    }

    #[test]
    fn test_decimal_is_not_a_boundary() {
        let mut chunker = SentenceChunker::default();
        assert!(chunker.push("Version 3.5 of the report").is_empty());
        assert_eq!(chunker.push(" is ready. ").len(), 1);
    }

    #[test]
    fn test_closing_quote_stays_with_sentence() {
        let mut chunker = SentenceChunker::default();
        let out = chunker.push("They said \"the crew finished.\" Next");
        assert_eq!(out, vec!["They said \"the crew finished.\""]);
        assert_eq!(chunker.flush().as_deref(), Some("Next"));
    }

    #[test]
    fn test_long_run_forced_at_word_boundary() {
        let mut chunker = SentenceChunker::new(SentenceChunkerConfig {
            min_chars: 1,
            max_buffer_chars: 20,
        });
        let out = chunker.push("one two three four five six");
        assert_eq!(out, vec!["one two three four five"]);
        assert_eq!(chunker.flush().as_deref(), Some("six"));
    }
}
