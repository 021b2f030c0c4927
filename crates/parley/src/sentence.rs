//! Incremental sentence segmentation of a streamed model response.
//!
//! Each completed sentence goes to synthesis while the model is still
//! generating the next one.

const TERMINATORS: [char; 3] = ['.', '!', '?'];
const CLOSERS: [char; 5] = ['"', '\'', ')', '\u{201D}', '\u{2019}'];

#[derive(Debug)]
pub struct SentenceSplitter {
    max_chars: usize,
    buffer: String,
}

impl SentenceSplitter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
            buffer: String::new(),
        }
    }

    /// Append a text delta and return every sentence it completed.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut sentences = Vec::new();

        loop {
            let cut = self.boundary().or_else(|| self.overflow_cut());
            let Some(cut) = cut else { break };

            let sentence = self.buffer[..cut].trim().to_string();
            self.buffer = self.buffer[cut..].trim_start().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Flush whatever remains once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Byte offset just past the first terminator run that is followed by whitespace.
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if !TERMINATORS.contains(&c) {
                continue;
            }
            while let Some(&(_, next)) = chars.peek() {
                if TERMINATORS.contains(&next) || CLOSERS.contains(&next) {
                    chars.next();
                } else {
                    break;
                }
            }
            match chars.peek() {
                Some(&(idx, next)) if next.is_whitespace() => return Some(idx),
                Some(_) => continue,
                // Terminator at the end of the buffer: wait for more text.
                None => return None,
            }
        }
        None
    }

    /// Cut for a run-on sentence: last whitespace within `max_chars`, else a hard cut.
    fn overflow_cut(&self) -> Option<usize> {
        let mut indices = self.buffer.char_indices().map(|(i, _)| i);
        let limit = indices.nth(self.max_chars)?;
        let head = &self.buffer[..limit];
        match head.rfind(char::is_whitespace) {
            Some(idx) if idx > 0 => Some(idx),
            _ => Some(limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_across_deltas() {
        let mut s = SentenceSplitter::new(180);
        assert!(s.push("Hello the").is_empty());
        assert_eq!(s.push("re. How are"), vec!["Hello there."]);
        assert_eq!(s.push(" you? I'm fine"), vec!["How are you?"]);
        assert_eq!(s.finish(), Some("I'm fine".to_string()));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_waits_for_whitespace_after_terminator() {
        let mut s = SentenceSplitter::new(180);
        assert!(s.push("It costs 3.").is_empty());
        assert!(s.push("50 dollars").is_empty());
        assert_eq!(s.push("! Great"), vec!["It costs 3.50 dollars!"]);
    }

    #[test]
    fn test_terminator_runs_and_quotes() {
        let mut s = SentenceSplitter::new(180);
        let out = s.push("Really?! \"Yes.\" Fine");
        assert_eq!(out, vec!["Really?!", "\"Yes.\""]);
    }

    #[test]
    fn test_overflow_breaks_on_whitespace() {
        let mut s = SentenceSplitter::new(20);
        let out = s.push("one two three four five six seven");
        assert_eq!(out, vec!["one two three four"]);
        assert_eq!(s.finish(), Some("five six seven".to_string()));
    }

    #[test]
    fn test_overflow_without_whitespace_hard_cuts() {
        let mut s = SentenceSplitter::new(16);
        let out = s.push("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(out, vec!["abcdefghijklmnop"]);
        assert_eq!(s.finish(), Some("qrstuvwxyz".to_string()));
    }
}
