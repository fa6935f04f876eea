use memchr::memchr;

/// Held text longer than this is released even if it still looks like a tag.
const MAX_HELD_TAG: usize = 1024;

enum TagMatch {
    /// A complete sensitive tag ending at `end`.
    Sensitive {
        name_idx: usize,
        closing: bool,
        self_closing: bool,
        end: usize,
    },
    /// Could still become a sensitive tag once more input arrives.
    NeedMore,
    NotSensitive,
}

/// Streaming remover of content wrapped in sensitive tags.
///
/// `filter` may be called with arbitrarily split text; the concatenated
/// output equals what a single call over the whole text would produce.
pub struct TagStripper {
    tags: Vec<String>,
    held: String,
    open: Vec<usize>,
}

impl TagStripper {
    #[must_use]
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags
                .into_iter()
                .map(Into::into)
                .filter(|tag: &String| !tag.is_empty())
                .collect(),
            held: String::new(),
            open: Vec::new(),
        }
    }

    /// True while inside a sensitive region.
    #[must_use]
    pub fn in_sensitive_region(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn filter(&mut self, text: &str) -> String {
        if self.tags.is_empty() {
            return text.to_owned();
        }
        let mut input = std::mem::take(&mut self.held);
        input.push_str(text);

        let mut out = String::with_capacity(input.len());
        let bytes = input.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            let Some(rel) = memchr(b'<', &bytes[i..]) else {
                self.emit(&mut out, &input[i..]);
                break;
            };
            let lt = i + rel;
            self.emit(&mut out, &input[i..lt]);

            match self.match_tag(&input[lt..]) {
                TagMatch::NeedMore if input.len() - lt <= MAX_HELD_TAG => {
                    self.held.push_str(&input[lt..]);
                    break;
                }
                TagMatch::Sensitive {
                    name_idx,
                    closing,
                    self_closing,
                    end,
                } => {
                    if self_closing {
                        // removed, no region opened
                    } else if !closing {
                        self.open.push(name_idx);
                    } else if self.open.last() == Some(&name_idx) {
                        self.open.pop();
                    } else if self.open.is_empty() {
                        out.push_str(&input[lt..lt + end]);
                    }
                    i = lt + end;
                }
                TagMatch::NeedMore | TagMatch::NotSensitive => {
                    self.emit(&mut out, "<");
                    i = lt + 1;
                }
            }
        }
        out
    }

    /// Flush held text. Content of an unclosed sensitive region is dropped.
    pub fn finish(&mut self) -> String {
        let held = std::mem::take(&mut self.held);
        let region_open = !self.open.is_empty();
        self.open.clear();
        if region_open {
            String::new()
        } else {
            held
        }
    }

    #[inline]
    fn emit(&self, out: &mut String, text: &str) {
        if self.open.is_empty() {
            out.push_str(text);
        }
    }

    /// Classify the tag-like text at the start of `s` (which begins with `<`).
    fn match_tag(&self, s: &str) -> TagMatch {
        let bytes = s.as_bytes();
        let mut i = 1;
        let closing = bytes.get(i) == Some(&b'/');
        if closing {
            i += 1;
        }
        let name_start = i;
        while i < bytes.len() && is_name_byte(bytes[i]) {
            i += 1;
        }
        let name = &s[name_start..i];

        if i == bytes.len() {
            let could_grow = self
                .tags
                .iter()
                .any(|tag| tag.as_bytes().starts_with(name.as_bytes()));
            return if could_grow {
                TagMatch::NeedMore
            } else {
                TagMatch::NotSensitive
            };
        }
        let Some(name_idx) = self.tags.iter().position(|tag| tag == name) else {
            return TagMatch::NotSensitive;
        };

        match bytes[i] {
            b'>' => TagMatch::Sensitive {
                name_idx,
                closing,
                self_closing: false,
                end: i + 1,
            },
            b'/' if !closing => match bytes.get(i + 1) {
                Some(b'>') => TagMatch::Sensitive {
                    name_idx,
                    closing,
                    self_closing: true,
                    end: i + 2,
                },
                None => TagMatch::NeedMore,
                Some(_) => TagMatch::NotSensitive,
            },
            b' ' | b'\t' | b'\n' | b'\r' => match memchr(b'>', &bytes[i..]) {
                Some(rel) => {
                    let end = i + rel + 1;
                    TagMatch::Sensitive {
                        name_idx,
                        closing,
                        self_closing: !closing && bytes[end - 2] == b'/',
                        end,
                    }
                }
                None => TagMatch::NeedMore,
            },
            _ => TagMatch::NotSensitive,
        }
    }
}

#[inline]
fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':' | b'.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_all(tags: &[&str], chunks: &[&str]) -> String {
        let mut stripper = TagStripper::new(tags.iter().copied());
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&stripper.filter(chunk));
        }
        out.push_str(&stripper.finish());
        out
    }

    #[test]
    fn test_strips_sensitive_block() {
        assert_eq!(
            strip_all(&["thinking"], &["a<thinking>secret</thinking>b"]),
            "ab"
        );
    }

    #[test]
    fn test_holds_partial_tag_across_chunks() {
        let mut stripper = TagStripper::new(["thinking"]);
        assert_eq!(stripper.filter("hello <thi"), "hello ");
        assert_eq!(stripper.filter("nking>hidden</thin"), "");
        assert_eq!(stripper.filter("king> world"), " world");
        assert_eq!(stripper.finish(), "");
    }

    #[test]
    fn test_unrelated_tags_pass_through() {
        assert_eq!(
            strip_all(&["thinking"], &["<b>bold</b> a < b <think>x</think>"]),
            "<b>bold</b> a < b <think>x</think>"
        );
    }

    #[test]
    fn test_finish_flushes_unresolved_prefix() {
        let mut stripper = TagStripper::new(["thinking"]);
        assert_eq!(stripper.filter("2 <thin"), "2 ");
        assert_eq!(stripper.finish(), "<thin");
    }

    #[test]
    fn test_nested_markup_is_discarded() {
        assert_eq!(
            strip_all(
                &["thinking"],
                &["x<thinking>a <b>c</b> <thinking>deep</thinking> tail</thinking>y"]
            ),
            "xy"
        );
    }

    #[test]
    fn test_tags_with_attributes() {
        assert_eq!(
            strip_all(&["thinking"], &["x<thinking id=\"1\">", "z</thinking >y"]),
            "xy"
        );
    }

    #[test]
    fn test_unclosed_region_is_dropped_on_finish() {
        assert_eq!(strip_all(&["thinking"], &["keep<thinking>lost"]), "keep");
    }

    #[test]
    fn test_stray_close_tag_is_kept() {
        assert_eq!(strip_all(&["thinking"], &["a</thinking>b"]), "a</thinking>b");
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let text = "pre <thinking a=\"b\">one <x/> two</thinking> mid <thin> post <thinking/>end";
        let whole = strip_all(&["thinking"], &[text]);
        for split in 0..text.len() {
            if !text.is_char_boundary(split) {
                continue;
            }
            let (a, b) = text.split_at(split);
            assert_eq!(strip_all(&["thinking"], &[a, b]), whole, "split at {split}");
        }
        assert_eq!(whole, "pre  mid <thin> post end");
    }
}
