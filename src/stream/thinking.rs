//! Streaming `<thinking>` tag parser. Upstreams that cannot produce native
//! thinking blocks are asked to wrap reasoning in tags; this parser splits
//! the concatenated text back into text/thinking segments. The output is
//! identical no matter how the input is chunked: a possible partial tag at
//! the buffer tail (opening or closing) is held back until the next chunk
//! settles it.

use crate::constants::{THINKING_END_TAG, THINKING_START_TAG};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    ThinkingStart,
    Thinking(String),
    ThinkingEnd,
}

#[derive(Debug, Default)]
pub struct ThinkingTagParser {
    buffer: String,
    in_thinking: bool,
}

/// Length of the longest suffix of `buffer` that is a proper prefix of `tag`.
fn partial_tag_suffix(buffer: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(buffer.len());
    for len in (1..=max).rev() {
        if buffer.ends_with(&tag[..len]) {
            return len;
        }
    }
    0
}

impl ThinkingTagParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        self.buffer.push_str(chunk);
        let mut segments = Vec::new();

        loop {
            if self.in_thinking {
                if let Some(end) = self.buffer.find(THINKING_END_TAG) {
                    if end > 0 {
                        segments.push(Segment::Thinking(self.buffer[..end].to_string()));
                    }
                    self.buffer.drain(..end + THINKING_END_TAG.len());
                    self.in_thinking = false;
                    segments.push(Segment::ThinkingEnd);
                } else {
                    let hold = partial_tag_suffix(&self.buffer, THINKING_END_TAG);
                    let emit_len = self.buffer.len() - hold;
                    if emit_len > 0 {
                        segments.push(Segment::Thinking(self.buffer[..emit_len].to_string()));
                        self.buffer.drain(..emit_len);
                    }
                    break;
                }
            } else if let Some(start) = self.buffer.find(THINKING_START_TAG) {
                if start > 0 {
                    segments.push(Segment::Text(self.buffer[..start].to_string()));
                }
                self.buffer.drain(..start + THINKING_START_TAG.len());
                self.in_thinking = true;
                segments.push(Segment::ThinkingStart);
            } else {
                let hold = partial_tag_suffix(&self.buffer, THINKING_START_TAG);
                let emit_len = self.buffer.len() - hold;
                if emit_len > 0 {
                    segments.push(Segment::Text(self.buffer[..emit_len].to_string()));
                    self.buffer.drain(..emit_len);
                }
                break;
            }
        }
        segments
    }

    /// Flush whatever is held back at end of stream. A dangling partial tag
    /// is emitted literally; an unterminated thinking section stays thinking.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut segments = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            if self.in_thinking {
                segments.push(Segment::Thinking(rest));
            } else {
                segments.push(Segment::Text(rest));
            }
        }
        if self.in_thinking {
            self.in_thinking = false;
            segments.push(Segment::ThinkingEnd);
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the parser over `input` split at every position in `cuts`,
    /// concatenating like segments so chunk-boundary differences vanish.
    fn parse_chunked(input: &str, chunk_size: usize) -> Vec<Segment> {
        let mut parser = ThinkingTagParser::new();
        let mut raw = Vec::new();
        let chars: Vec<char> = input.chars().collect();
        for chunk in chars.chunks(chunk_size) {
            let chunk: String = chunk.iter().collect();
            raw.extend(parser.push(&chunk));
        }
        raw.extend(parser.finish());
        normalize(raw)
    }

    fn normalize(segments: Vec<Segment>) -> Vec<Segment> {
        let mut out: Vec<Segment> = Vec::new();
        for segment in segments {
            match (out.last_mut(), &segment) {
                (Some(Segment::Text(a)), Segment::Text(b)) => a.push_str(b),
                (Some(Segment::Thinking(a)), Segment::Thinking(b)) => a.push_str(b),
                _ => out.push(segment),
            }
        }
        out
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(
            parse_chunked("just words", 3),
            vec![Segment::Text("just words".into())]
        );
    }

    #[test]
    fn single_thinking_section_parses() {
        let expected = vec![
            Segment::Text("before ".into()),
            Segment::ThinkingStart,
            Segment::Thinking("inner".into()),
            Segment::ThinkingEnd,
            Segment::Text(" after".into()),
        ];
        assert_eq!(
            parse_chunked("before <thinking>inner</thinking> after", 1000),
            expected
        );
    }

    #[test]
    fn output_is_chunking_invariant() {
        let input = "a<thinking>reason one</thinking>mid<thinking>reason two</thinking>z";
        let reference = parse_chunked(input, input.len());
        for chunk_size in 1..=15 {
            assert_eq!(parse_chunked(input, chunk_size), reference, "chunk_size={}", chunk_size);
        }
    }

    #[test]
    fn partial_open_tag_across_chunks() {
        let mut parser = ThinkingTagParser::new();
        let first = parser.push("hello <think");
        // The possible tag prefix is held back, not emitted as text.
        assert_eq!(normalize(first), vec![Segment::Text("hello ".into())]);
        let mut rest = parser.push("ing>deep</thinking>");
        rest.extend(parser.finish());
        assert_eq!(
            normalize(rest),
            vec![
                Segment::ThinkingStart,
                Segment::Thinking("deep".into()),
                Segment::ThinkingEnd,
            ]
        );
    }

    #[test]
    fn partial_close_tag_across_chunks() {
        let mut parser = ThinkingTagParser::new();
        let mut segments = parser.push("<thinking>abc</think");
        segments.extend(parser.push("ing>done"));
        segments.extend(parser.finish());
        assert_eq!(
            normalize(segments),
            vec![
                Segment::ThinkingStart,
                Segment::Thinking("abc".into()),
                Segment::ThinkingEnd,
                Segment::Text("done".into()),
            ]
        );
    }

    #[test]
    fn false_prefix_is_released_as_text() {
        assert_eq!(
            parse_chunked("a <thin air story", 4),
            vec![Segment::Text("a <thin air story".into())]
        );
    }

    #[test]
    fn unterminated_thinking_flushes_as_thinking() {
        let mut parser = ThinkingTagParser::new();
        let mut segments = parser.push("<thinking>never closed");
        segments.extend(parser.finish());
        assert_eq!(
            normalize(segments),
            vec![
                Segment::ThinkingStart,
                Segment::Thinking("never closed".into()),
                Segment::ThinkingEnd,
            ]
        );
    }
}
