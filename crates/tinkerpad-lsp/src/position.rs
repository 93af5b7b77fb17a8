//! Conversion between flat UTF-16 code-unit offsets and protocol positions.
//!
//! The editor addresses text by UTF-16 offset; the protocol addresses it by
//! zero-based (line, character) pairs, also in UTF-16 units. Both directions
//! clamp out-of-range input instead of failing.

use lsp_types::Position;

/// Length of `text` in UTF-16 code units.
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Position of the given UTF-16 offset within `text`.
///
/// The offset is clamped to `[0, utf16_len(text)]`. An offset landing inside
/// a surrogate pair resolves to the position before that character.
pub fn position_at(text: &str, utf16_offset: usize) -> Position {
    let mut remaining = utf16_offset;
    let mut line = 0u32;
    let mut character = 0u32;

    for ch in text.chars() {
        if remaining == 0 {
            break;
        }
        let units = ch.len_utf16();
        if units > remaining {
            break;
        }
        remaining -= units;
        if ch == '\n' {
            line += 1;
            character = 0;
        } else {
            character += units as u32;
        }
    }

    Position { line, character }
}

/// UTF-16 offset of the given position within `text`.
///
/// Exact inverse of [`position_at`] for any position it produces. A line past
/// the end of the buffer clamps to the buffer length; a character past the end
/// of its line clamps to the line end.
pub fn offset_at(text: &str, position: Position) -> usize {
    let mut offset = 0usize;
    let mut line = 0u32;
    let mut chars = text.chars();

    while line < position.line {
        match chars.next() {
            Some(ch) => {
                offset += ch.len_utf16();
                if ch == '\n' {
                    line += 1;
                }
            }
            None => return offset,
        }
    }

    let mut character = 0u32;
    for ch in chars {
        if ch == '\n' || character >= position.character {
            break;
        }
        let units = ch.len_utf16() as u32;
        if character + units > position.character {
            break;
        }
        character += units;
        offset += ch.len_utf16();
    }

    offset
}
