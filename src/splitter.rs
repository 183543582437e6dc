//! Recursive character text splitter used when indexing sources. Prefers
//! paragraph breaks, then line breaks, then word breaks, and only falls
//! back to hard character cuts for unbroken runs.

pub const CHUNK_SIZE: usize = 1000;
pub const CHUNK_OVERLAP: usize = 100;

const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Split `text` into chunks of roughly `chunk_size` characters with
/// `overlap` characters carried over between consecutive chunks. A merged
/// chunk may exceed `chunk_size` by up to the overlap tail it inherits.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= chunk_size {
        return vec![text.to_string()];
    }
    let pieces = split_with_separators(text, chunk_size, SEPARATORS);
    merge_pieces(&pieces, chunk_size, overlap)
}

/// Break the text at the first separator that produces parts, recursing
/// into any part still over the size limit with the remaining separators.
/// The empty separator means hard cuts at `chunk_size` characters.
fn split_with_separators(text: &str, chunk_size: usize, separators: &[&str]) -> Vec<String> {
    let Some((sep, rest)) = separators.split_first() else {
        return vec![text.to_string()];
    };

    if sep.is_empty() {
        let chars: Vec<char> = text.chars().collect();
        return chars
            .chunks(chunk_size)
            .map(|c| c.iter().collect())
            .collect();
    }

    let mut out = Vec::new();
    for part in text.split(sep) {
        if part.is_empty() {
            continue;
        }
        if part.chars().count() > chunk_size {
            out.extend(split_with_separators(part, chunk_size, rest));
        } else {
            out.push(part.to_string());
        }
    }
    out
}

/// Greedily pack pieces into chunks, seeding each new chunk with the tail
/// of the previous one for continuity across boundaries.
fn merge_pieces(pieces: &[String], chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        let current_len = current.chars().count();
        let piece_len = piece.chars().count();
        if current_len > 0 && current_len + 1 + piece_len > chunk_size {
            chunks.push(current.clone());
            let tail: String = current
                .chars()
                .skip(current_len.saturating_sub(overlap))
                .collect();
            current = tail;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(piece);
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}
