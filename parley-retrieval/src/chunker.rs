//! Overlapping text chunker
//!
//! Splits documents into chunks of roughly [`TARGET_CHUNK_CHARS`]
//! characters with [`CHUNK_OVERLAP_CHARS`] of overlap, preferring to
//! break on paragraph, line, sentence, and word boundaries in that
//! order. Operates on characters, not bytes, so multi-byte scripts
//! never split mid-codepoint.

/// Target chunk length in characters.
pub const TARGET_CHUNK_CHARS: usize = 500;

/// Overlap carried between consecutive chunks, in characters.
pub const CHUNK_OVERLAP_CHARS: usize = 50;

/// Break candidates, strongest first. A break position is the index
/// *after* the separator.
const SENTENCE_ENDS: [char; 4] = ['。', '.', '!', '?'];

/// Split `text` into overlapping chunks.
///
/// Every chunk is non-empty and at most `target` characters; the scan
/// always advances, so the result is finite for any input.
pub fn chunk_text(text: &str, target: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let target = target.max(1);
    let overlap = overlap.min(target / 2);

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        // Skip leading whitespace so overlap windows don't produce
        // whitespace-only chunks.
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
        if start >= chars.len() {
            break;
        }

        let hard_end = (start + target).min(chars.len());
        let end = if hard_end < chars.len() {
            find_break(&chars, start, hard_end)
        } else {
            hard_end
        };

        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }
        // Step back for overlap, but always make forward progress.
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// Find the best break position in `chars[start..hard_end]`, searching
/// backwards from the hard limit but never before the window midpoint
/// (tiny chunks defeat the purpose of overlap).
fn find_break(chars: &[char], start: usize, hard_end: usize) -> usize {
    let min_end = start + (hard_end - start) / 2;

    let mut line_break = None;
    let mut sentence_break = None;
    let mut word_break = None;

    let mut i = hard_end;
    while i > min_end {
        let ch = chars[i - 1];
        if ch == '\n' {
            // A blank line (paragraph boundary) wins outright.
            if i >= 2 && chars[i - 2] == '\n' {
                return i;
            }
            line_break.get_or_insert(i);
        } else if SENTENCE_ENDS.contains(&ch) {
            sentence_break.get_or_insert(i);
        } else if ch.is_whitespace() {
            word_break.get_or_insert(i);
        }
        i -= 1;
    }

    line_break
        .or(sentence_break)
        .or(word_break)
        .unwrap_or(hard_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = chunk_text("The secret code is 42.", TARGET_CHUNK_CHARS, CHUNK_OVERLAP_CHARS);
        assert_eq!(chunks, vec!["The secret code is 42.".to_string()]);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(chunk_text("", TARGET_CHUNK_CHARS, CHUNK_OVERLAP_CHARS).is_empty());
        assert!(chunk_text("   \n\n  ", TARGET_CHUNK_CHARS, CHUNK_OVERLAP_CHARS).is_empty());
    }

    #[test]
    fn test_long_text_respects_target() {
        let text = "word ".repeat(400);
        let chunks = chunk_text(&text, 500, 50);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 500);
            assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let text = "alpha ".repeat(300);
        let chunks = chunk_text(&text, 120, 30);
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(10).collect::<String>().chars().rev().collect();
            assert!(pair[1].contains(tail.trim()), "overlap missing between chunks");
        }
    }

    #[test]
    fn test_prefers_sentence_boundaries() {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!("Sentence number {} has a few words. ", i));
        }
        let chunks = chunk_text(&text, 200, 20);
        // Most chunks should end at a sentence boundary.
        let sentence_ended = chunks
            .iter()
            .take(chunks.len() - 1)
            .filter(|c| c.trim_end().ends_with('.'))
            .count();
        assert!(sentence_ended * 2 >= chunks.len() - 1);
    }

    #[test]
    fn test_multibyte_safe() {
        let text = "秘密代码是四十二。".repeat(200);
        let chunks = chunk_text(&text, 100, 10);
        assert!(!chunks.is_empty());
        for chunk in chunks {
            assert!(chunk.chars().count() <= 100);
        }
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Chunking terminates and every chunk honors the target
            /// length for arbitrary unicode input.
            #[test]
            fn prop_chunks_bounded(text in ".{0,2000}", target in 10usize..300, overlap in 0usize..60) {
                let chunks = chunk_text(&text, target, overlap);
                for chunk in &chunks {
                    prop_assert!(chunk.chars().count() <= target);
                    prop_assert!(!chunk.trim().is_empty());
                }
            }
        }
    }
}
