/// Pseudo-streaming: a completed response sliced into timed frames.
///
/// Slices target `chunk_size` chars; a slice ending mid-word extends to the
/// next whitespace as long as the extended slice stays below 140 % of the
/// target. Streaming is skipped entirely for short replies
/// (`len <= 2 * chunk_size`), where a single final frame is enough.
pub fn plan_stream_slices(content: &str, chunk_size: usize) -> Option<Vec<String>> {
    let chunk_size = chunk_size.max(1);
    let chars: Vec<(usize, char)> = content.char_indices().collect();
    let total = chars.len();
    if total <= chunk_size * 2 {
        return None;
    }

    let max_len = chunk_size + (chunk_size * 2) / 5;
    let byte_at = |char_idx: usize| -> usize {
        if char_idx >= total {
            content.len()
        } else {
            chars[char_idx].0
        }
    };

    let mut slices = Vec::new();
    let mut start = 0usize;
    while start < total {
        let mut end = (start + chunk_size).min(total);
        if end < total && !chars[end - 1].1.is_whitespace() {
            if let Some(ws) = (end..total).find(|&p| chars[p].1.is_whitespace()) {
                // Include the whitespace so concatenation reproduces the
                // original content exactly.
                if ws + 1 - start < max_len {
                    end = ws + 1;
                }
            }
        }
        slices.push(content[byte_at(start)..byte_at(end)].to_string());
        start = end;
    }

    Some(slices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_is_not_streamed() {
        assert!(plan_stream_slices("short reply", 48).is_none());
        let exactly_double = "x".repeat(96);
        assert!(plan_stream_slices(&exactly_double, 48).is_none());
    }

    #[test]
    fn concatenation_reproduces_content() {
        let content = "The quick brown fox jumps over the lazy dog. ".repeat(8);
        let slices = plan_stream_slices(&content, 48).expect("long enough to stream");
        assert!(slices.len() > 1);
        assert_eq!(slices.concat(), content);
    }

    #[test]
    fn slices_expand_to_the_next_word_boundary() {
        let content = "aaa bbb ccc ddd eee fff ggg hhh iii jjj";
        // A 10-char target lands mid-word; the slice stretches two chars to
        // the following space because 12 < 14 (140 % of 10).
        let slices = plan_stream_slices(content, 10).unwrap();
        assert_eq!(slices[0], "aaa bbb ccc ");
        assert_eq!(slices[1], "ddd eee fff ");
        assert_eq!(slices.concat(), content);
    }

    #[test]
    fn expansion_is_bounded_at_140_percent() {
        // One long unbroken token forces a mid-word cut instead of an
        // oversized expansion.
        let content = format!("{} tail words here and more padding", "y".repeat(100));
        let slices = plan_stream_slices(&content, 20).unwrap();
        let limit = 20 + (20 * 2) / 5;
        for slice in &slices {
            assert!(
                slice.chars().count() <= limit,
                "slice exceeds expansion bound: {}",
                slice.len()
            );
        }
        assert_eq!(slices.concat(), content);
    }

    #[test]
    fn multibyte_content_slices_on_char_boundaries() {
        let content = "día tras día el ingeniería de búsqueda mejora los resultados notablemente";
        let slices = plan_stream_slices(content, 16).unwrap();
        assert_eq!(slices.concat(), content);
    }
}
