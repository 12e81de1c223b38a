/// Split `message` into pieces of at most `max_chars` characters.
///
/// Splits on character boundaries so multi-byte text is never cut mid-codepoint.
pub fn chunk_reply(message: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = message;

    while !rest.is_empty() {
        let split_at = rest
            .char_indices()
            .nth(max_chars)
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        let (chunk, tail) = rest.split_at(split_at);
        chunks.push(chunk);
        rest = tail;
    }

    chunks
}
