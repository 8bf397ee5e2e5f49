//! Splitting long replies into synthesizer-sized segments.

const SENTENCE_BREAKS: [&str; 3] = [". ", "! ", "? "];

/// Byte offset of the `n`th character of `s` (or `s.len()`).
fn char_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Split `text` into segments of at most `max_chars` characters.
///
/// Each cut prefers the last sentence end in the second half of the window,
/// then the last space there, and only then a hard cut. Segments are
/// trimmed; empty input yields no segments.
pub fn split_for_speech(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut segments = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        if rest.chars().count() <= max_chars {
            segments.push(rest.to_string());
            break;
        }

        let window_end = char_offset(rest, max_chars);
        let half = char_offset(rest, max_chars / 2);
        let window = &rest[..window_end];

        let sentence_cut = SENTENCE_BREAKS
            .iter()
            .filter_map(|sep| window.rfind(sep))
            .filter(|&i| i > half)
            .max()
            .map(|i| i + 1);
        let cut = sentence_cut
            .or_else(|| window.rfind(' ').filter(|&i| i > half))
            .unwrap_or(window_end);

        segments.push(rest[..cut].trim().to_string());
        rest = rest[cut..].trim_start();
    }

    segments.retain(|s| !s.is_empty());
    segments
}
