//! Resolution of LSP snippet-syntax insert text.
//!
//! Servers may mark insert text as a snippet: literal text mixed with
//! tab-stops (`$1`), placeholders (`${1:default}`), and choices
//! (`${1|a,b|}`). tinkerpad does not reproduce multi-stop tabbing; a resolved
//! snippet is plain text plus at most one selection: the textually first
//! non-zero tab-stop (covering its default text, if any), falling back to a
//! zero-length cursor at `$0`.

/// A UTF-16 code-unit range into the resolved text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub start: usize,
    pub len: usize,
}

impl Selection {
    /// Whether this selection is a bare cursor position.
    pub fn is_cursor(&self) -> bool {
        self.len == 0
    }
}

/// Snippet text with its syntax stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSnippet {
    pub text: String,
    pub selection: Option<Selection>,
}

/// Resolve snippet-syntax insert text into plain text plus a selection.
///
/// Escapes (`\$`, `\{`, `\}`, `\\`) yield the escaped character; a backslash
/// before anything else is kept literally. A malformed placeholder
/// (unterminated `${`) turns the remainder of the input into literal text.
pub fn resolve(input: &str) -> ResolvedSnippet {
    let mut resolver = Resolver::default();
    resolver.run(input);
    resolver.finish()
}

#[derive(Default)]
struct Resolver {
    text: String,
    utf16: usize,
    /// Selection of the textually first non-zero tab-stop.
    selection: Option<Selection>,
    /// Location of `$0`, used only when no non-zero tab-stop was seen.
    final_cursor: Option<usize>,
}

impl Resolver {
    fn run(&mut self, input: &str) {
        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '\\' if i + 1 < chars.len() => {
                    self.push_escaped(chars[i + 1], &['{', '}', '$', '\\']);
                    i += 2;
                }
                '$' => match self.parse_tab_stop(&chars[i..]) {
                    Some(consumed) => i += consumed,
                    None => {
                        // Unterminated `${`: everything from here is literal.
                        if i + 1 < chars.len() && chars[i + 1] == '{' {
                            for &ch in &chars[i..] {
                                self.push(ch);
                            }
                            return;
                        }
                        self.push('$');
                        i += 1;
                    }
                },
                ch => {
                    self.push(ch);
                    i += 1;
                }
            }
        }
    }

    /// Parse a tab-stop starting at `$`. Returns the number of characters
    /// consumed, or `None` when the input is not a well-formed tab-stop.
    fn parse_tab_stop(&mut self, rest: &[char]) -> Option<usize> {
        // `$N`
        if rest.len() > 1 && rest[1].is_ascii_digit() {
            let mut end = 1;
            while end < rest.len() && rest[end].is_ascii_digit() {
                end += 1;
            }
            let number = digits_to_number(&rest[1..end]);
            self.record_stop(number, self.utf16, 0);
            return Some(end);
        }

        if rest.len() < 3 || rest[1] != '{' || !rest[2].is_ascii_digit() {
            return None;
        }

        let mut i = 2;
        while i < rest.len() && rest[i].is_ascii_digit() {
            i += 1;
        }
        let number = digits_to_number(&rest[2..i]);

        match rest.get(i) {
            // `${N}`
            Some('}') => {
                self.record_stop(number, self.utf16, 0);
                Some(i + 1)
            }
            // `${N:default}`
            Some(':') => {
                let checkpoint = (self.text.len(), self.utf16);
                let start = self.utf16;
                match self.push_until(&rest[i + 1..], '}', &['{', '}', '$', '\\']) {
                    Some(consumed) => {
                        self.record_stop(number, start, self.utf16 - start);
                        Some(i + 1 + consumed)
                    }
                    None => {
                        self.rollback(checkpoint);
                        None
                    }
                }
            }
            // `${N|choice,...|}`, first choice wins.
            Some('|') => {
                let checkpoint = (self.text.len(), self.utf16);
                let start = self.utf16;
                match self.parse_choices(&rest[i + 1..]) {
                    Some(consumed) => {
                        self.record_stop(number, start, self.utf16 - start);
                        Some(i + 1 + consumed)
                    }
                    None => {
                        self.rollback(checkpoint);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Append characters until the unescaped terminator, handling escapes.
    /// Returns characters consumed including the terminator.
    fn push_until(&mut self, rest: &[char], terminator: char, escapable: &[char]) -> Option<usize> {
        let mut i = 0;
        while i < rest.len() {
            match rest[i] {
                '\\' if i + 1 < rest.len() => {
                    self.push_escaped(rest[i + 1], escapable);
                    i += 2;
                }
                ch if ch == terminator => return Some(i + 1),
                ch => {
                    self.push(ch);
                    i += 1;
                }
            }
        }
        None
    }

    /// Parse the choice list after `${N|`, emitting only the first choice.
    /// Returns characters consumed up to and including the closing `|}`.
    fn parse_choices(&mut self, rest: &[char]) -> Option<usize> {
        let escapable = ['{', '}', '$', '\\', ',', '|'];
        let mut i = 0;
        let mut in_first = true;

        while i < rest.len() {
            match rest[i] {
                '\\' if i + 1 < rest.len() => {
                    if in_first {
                        self.push_escaped(rest[i + 1], &escapable);
                    }
                    i += 2;
                }
                ',' => {
                    in_first = false;
                    i += 1;
                }
                '|' => {
                    return if rest.get(i + 1) == Some(&'}') {
                        Some(i + 2)
                    } else {
                        None
                    };
                }
                ch => {
                    if in_first {
                        self.push(ch);
                    }
                    i += 1;
                }
            }
        }
        None
    }

    fn record_stop(&mut self, number: u32, start: usize, len: usize) {
        if number == 0 {
            if self.final_cursor.is_none() {
                self.final_cursor = Some(start);
            }
        } else if self.selection.is_none() {
            self.selection = Some(Selection { start, len });
        }
    }

    /// Undo any text appended by a failed placeholder parse.
    fn rollback(&mut self, (text_len, utf16): (usize, usize)) {
        self.text.truncate(text_len);
        self.utf16 = utf16;
    }

    fn push(&mut self, ch: char) {
        self.utf16 += ch.len_utf16();
        self.text.push(ch);
    }

    fn push_escaped(&mut self, ch: char, escapable: &[char]) {
        if !escapable.contains(&ch) {
            self.push('\\');
        }
        self.push(ch);
    }

    fn finish(self) -> ResolvedSnippet {
        let selection = self.selection.or(self
            .final_cursor
            .map(|start| Selection { start, len: 0 }));
        ResolvedSnippet {
            text: self.text,
            selection,
        }
    }
}

fn digits_to_number(digits: &[char]) -> u32 {
    digits
        .iter()
        .fold(0u32, |n, d| n.saturating_mul(10) + (*d as u32 - '0' as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passes_through() {
        let resolved = resolve("strlen()");
        assert_eq!(resolved.text, "strlen()");
        assert_eq!(resolved.selection, None);
    }

    #[test]
    fn test_placeholder_with_defaults() {
        let resolved = resolve("foo(${1:bar}, ${2:baz})$0");
        assert_eq!(resolved.text, "foo(bar, baz)");
        // Selection covers "bar"; the $0 cursor is shadowed by tab-stop 1.
        assert_eq!(resolved.selection, Some(Selection { start: 4, len: 3 }));
    }

    #[test]
    fn test_choice_picks_first() {
        let resolved = resolve("use ${1|App\\User,App\\Models\\User|};");
        assert_eq!(resolved.text, "use App\\User;");
        assert_eq!(resolved.selection, Some(Selection { start: 4, len: 8 }));
    }

    #[test]
    fn test_bare_tab_stop_and_final_cursor() {
        let resolved = resolve("echo $1;$0");
        assert_eq!(resolved.text, "echo ;");
        assert_eq!(resolved.selection, Some(Selection { start: 5, len: 0 }));
    }

    #[test]
    fn test_final_cursor_only() {
        let resolved = resolve("fn()$0;");
        assert_eq!(resolved.text, "fn();");
        assert_eq!(resolved.selection, Some(Selection { start: 4, len: 0 }));
        assert!(resolved.selection.unwrap().is_cursor());
    }

    #[test]
    fn test_textually_first_stop_wins() {
        let resolved = resolve("${2:second}-${1:first}");
        assert_eq!(resolved.text, "second-first");
        assert_eq!(resolved.selection, Some(Selection { start: 0, len: 6 }));
    }

    #[test]
    fn test_escapes_are_literal() {
        assert_eq!(resolve(r"\$1 costs \\5").text, "$1 costs \\5");
        assert_eq!(resolve(r"\{x\}").text, "{x}");
        // Unknown escapes keep the backslash.
        assert_eq!(resolve(r"App\User").text, "App\\User");
    }

    #[test]
    fn test_unterminated_placeholder_is_literal() {
        let resolved = resolve("foo(${1:bar");
        assert_eq!(resolved.text, "foo(${1:bar");
        assert_eq!(resolved.selection, None);
    }

    #[test]
    fn test_lone_dollar_is_literal() {
        assert_eq!(resolve("$x + $y").text, "$x + $y");
    }

    #[test]
    fn test_braced_stop_without_default() {
        let resolved = resolve("a${1}b");
        assert_eq!(resolved.text, "ab");
        assert_eq!(resolved.selection, Some(Selection { start: 1, len: 0 }));
    }

    #[test]
    fn test_selection_offsets_are_utf16() {
        let resolved = resolve("😀${1:x}");
        assert_eq!(resolved.text, "😀x");
        assert_eq!(resolved.selection, Some(Selection { start: 2, len: 1 }));
    }
}
