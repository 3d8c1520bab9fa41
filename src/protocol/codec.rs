//! Key-value wire codec.
//!
//! Instruments speak a flat ASCII language of semicolon-terminated segments:
//!
//! ```text
//! COMMAND;KEY1=VAL1;KEY2=VAL2;
//! ```
//!
//! A segment with exactly one `=` is a `(key, value)` pair. A segment without
//! one is a bare word (the command verb such as `ID`, `TEST` or `STATUS`). A
//! segment with more than one `=` is dropped. Decoding is total: garbage in
//! yields an empty message, never an error.
//!
//! Values are not escaped. A `;` or `=` inside a value cannot be represented,
//! and devices in the field depend on exactly this format.

/// Segment separator.
pub const SEGMENT_SEPARATOR: char = ';';

/// Key/value separator inside a segment.
pub const PAIR_SEPARATOR: char = '=';

/// A decoded (or to-be-encoded) wire message.
///
/// Pairs keep their insertion order and keys are unique: inserting an existing
/// key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    words: Vec<String>,
    pairs: Vec<(String, String)>,
}

impl WireMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    /// Value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// All pairs in order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Bare words (segments that carried no `=`), in order.
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Whether the message contains the bare word `word`.
    pub fn has_word(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when the message carries no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Encode as `COMMAND;KEY=VAL;...;`.
    pub fn encode(&self, command: &str) -> String {
        encode(command, &self.pairs)
    }
}

/// Encode a command and its fields as `COMMAND;KEY=VAL;...;`.
///
/// Field order is preserved. An empty `command` emits only the pairs.
pub fn encode<K, V>(command: &str, fields: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = String::with_capacity(command.len() + 1 + fields.len() * 12);
    if !command.is_empty() {
        out.push_str(command);
        out.push(SEGMENT_SEPARATOR);
    }
    for (key, value) in fields {
        out.push_str(key.as_ref());
        out.push(PAIR_SEPARATOR);
        out.push_str(value.as_ref());
        out.push(SEGMENT_SEPARATOR);
    }
    out
}

/// Decode a raw datagram.
///
/// Bytes are read as Latin-1, so any input is accepted. Trailing NULs and line
/// endings are stripped from the datagram once; segment contents are kept as
/// sent. A segment with exactly one `=` is a pair, one without `=` is a bare
/// word. Segments with more than one `=` and pairs with an empty key are
/// dropped.
pub fn decode(raw: &[u8]) -> WireMessage {
    let text: String = raw.iter().map(|&b| b as char).collect();
    let text = text.trim_end_matches(['\0', '\r', '\n']);
    let mut message = WireMessage::new();

    for segment in text.split(SEGMENT_SEPARATOR) {
        if segment.is_empty() {
            continue;
        }
        match segment.split_once(PAIR_SEPARATOR) {
            Some((key, value)) if !key.is_empty() && !value.contains(PAIR_SEPARATOR) => {
                message.insert(key, value)
            }
            Some(_) => {}
            None => message.words.push(segment.to_string()),
        }
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_command_and_fields_in_order() {
        let encoded = encode("TEST", &[("CMD", "START"), ("DURATION", "5")]);
        assert_eq!(encoded, "TEST;CMD=START;DURATION=5;");
    }

    #[test]
    fn encodes_bare_command() {
        let empty: [(&str, &str); 0] = [];
        assert_eq!(encode("ID", &empty), "ID;");
    }

    #[test]
    fn encode_without_command_emits_only_pairs() {
        assert_eq!(encode("", &[("MODEL", "X")]), "MODEL=X;");
    }

    #[test]
    fn decode_round_trips_encoded_fields() {
        let fields = [
            ("TIME", "10"),
            ("MV", "5"),
            ("MA", "2"),
            ("NOTE", ""),
            ("PADDED", " padded "),
            (" KEY ", "\tvalue"),
        ];
        let decoded = decode(encode("STATUS", &fields).as_bytes());

        assert!(decoded.has_word("STATUS"));
        assert_eq!(decoded.len(), fields.len());
        for (key, value) in fields {
            assert_eq!(decoded.get(key), Some(value));
        }
    }

    #[test]
    fn segment_without_separator_is_dropped_and_parsing_continues() {
        let decoded = decode(b"MODEL=Acme;garbage;SERIAL=42;");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get("MODEL"), Some("Acme"));
        assert_eq!(decoded.get("SERIAL"), Some("42"));
        assert_eq!(decoded.words(), ["garbage".to_string()]);
    }

    #[test]
    fn segment_with_two_separators_is_dropped() {
        let decoded = decode(b"MODEL=a=b;SERIAL=1;");
        assert_eq!(decoded.get("MODEL"), None);
        assert_eq!(decoded.get("SERIAL"), Some("1"));
        assert!(decoded.words().is_empty());
    }

    #[test]
    fn fully_malformed_input_yields_empty_message() {
        assert!(decode(b"").is_empty());
        assert!(decode(b";;;").is_empty());
        assert!(decode(b"=nokey;").is_empty());
        assert!(decode(&[0xff, 0xfe, 0x00]).is_empty());
    }

    #[test]
    fn legacy_start_command_loses_fused_duration_segment() {
        let decoded = decode(b"TEST;CMD=START;DURATION=5RATE=1000");
        assert_eq!(decoded.get("CMD"), Some("START"));
        assert!(!decoded.contains("DURATION"));
        assert!(!decoded.contains("RATE"));
    }

    #[test]
    fn repeated_key_replaces_in_place() {
        let decoded = decode(b"A=1;B=2;A=3;");
        assert_eq!(
            decoded.pairs(),
            [
                ("A".to_string(), "3".to_string()),
                ("B".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn trailing_nul_and_newline_are_ignored() {
        let decoded = decode(b"MODEL=Acme-100;\r\n\0");
        assert_eq!(decoded.get("MODEL"), Some("Acme-100"));
        assert!(decoded.words().is_empty());

        let unterminated = decode(b"MODEL=Acme-100\n");
        assert_eq!(unterminated.get("MODEL"), Some("Acme-100"));
    }
}
