//! Fixed-size overlapping text windows.
//!
//! Sizes are counted in characters. A window end is moved back to the last
//! whitespace in its second half, and the next window start is moved forward
//! to a word boundary, so words are only split when a window holds a single
//! oversized word. Every step advances by at least one character.

/// Split `text` into windows of at most `chunk_size` characters sharing
/// roughly `overlap` characters. Blank input yields no chunks.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if chunk_size == 0 || text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let overlap = overlap.min(chunk_size - 1);

    let mut chunks = Vec::new();
    let mut start = skip_whitespace(&chars, 0);

    while start < n {
        let mut end = (start + chunk_size).min(n);
        if end < n {
            end = snap_back(&chars, start, end);
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        if end >= n {
            break;
        }

        let next = end.saturating_sub(overlap).max(start + 1);
        start = skip_whitespace(&chars, snap_forward(&chars, next, end));
    }

    chunks
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

/// Pull a window end back so it does not cut through a word.
fn snap_back(chars: &[char], start: usize, end: usize) -> usize {
    if chars[end].is_whitespace() || chars[end - 1].is_whitespace() {
        return end;
    }
    let floor = start + (end - start) / 2;
    (floor + 1..end)
        .rev()
        .find(|&i| chars[i].is_whitespace())
        .unwrap_or(end)
}

/// Push a window start forward to the beginning of the next word, staying
/// before `limit`.
fn snap_forward(chars: &[char], start: usize, limit: usize) -> usize {
    if start == 0 || chars[start - 1].is_whitespace() {
        return start;
    }
    (start..limit)
        .find(|&i| chars[i].is_whitespace())
        .unwrap_or(start)
}
