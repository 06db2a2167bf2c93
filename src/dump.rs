// Annotated hex/ASCII rendering of a datagram. Every line carries a one
// character prefix so outgoing ('>'), incoming ('<') and explicitly shown
// ('-') packets can be told apart in a session transcript.

/// Bytes per rendered row.
const BYTES_PER_ROW: usize = 10;

/// Renders `bytes` as hex dump lines. Each row is
/// `<prefix> <offset> : <hex bytes>    <ascii>`, with the offset zero-padded
/// to four digits and short final rows padded so the ASCII column lines up.
/// Bytes outside the printable range render as `?`. An empty input produces
/// the single line `<prefix> <empty packet>`.
pub fn render(bytes: &[u8], prefix: char) -> Vec<String> {
    if bytes.is_empty() {
        return vec![format!("{} <empty packet>", prefix)];
    }

    let mut lines = Vec::with_capacity(bytes.len().div_ceil(BYTES_PER_ROW));
    for (row, chunk) in bytes.chunks(BYTES_PER_ROW).enumerate() {
        let mut line = format!("{} {:04} :", prefix, row * BYTES_PER_ROW);
        let mut chars = String::with_capacity(BYTES_PER_ROW);

        for &b in chunk {
            line.push_str(&format!(" {:02X}", b));
            chars.push(if (32..=126).contains(&b) { b as char } else { '?' });
        }

        // Blank hex columns keep the ASCII rendering right-aligned.
        for _ in chunk.len()..BYTES_PER_ROW {
            line.push_str("   ");
        }
        line.push_str("    ");
        line.push_str(&chars);
        lines.push(line);
    }

    lines
}
