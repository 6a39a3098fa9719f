use std::collections::BTreeSet;

use crate::script::{parse_command, Span};

// Short dictionary lines past this point are assumed to be noise.
const SHORT_WORD_LINE_LIMIT: usize = 100;

/// Length of the leading word (letters, digits, apostrophes) of a token,
/// or zero if it starts with something else.
pub(crate) fn leading_word_len(token: &[u8]) -> usize {
    token
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'\'')
        .count()
}

// Remove every embedded command substring from a whitespace-delimited
// chunk. A command that does not lex (unknown or cut off by the chunk
// boundary) ends stripping; the rest stays literal.
fn strip_commands(chunk: &[u8]) -> Vec<u8> {
    let mut out = chunk.to_vec();
    loop {
        let Some(j) = out.iter().position(|&b| b == b'<') else {
            break;
        };
        match parse_command(&out, j) {
            Ok((_, _, end)) => {
                out.drain(j..end);
            }
            Err(_) => break,
        }
    }
    out
}

/// Harvest the lowercased dialogue words of every span into `words`.
///
/// Tokens split on whitespace; embedded commands are stripped before the
/// leading word is matched. The set accumulates across files and becomes
/// the replacement dictionary once finalized.
pub fn collect_words(s: &[u8], events: &[Vec<Span>], words: &mut BTreeSet<String>) {
    for spans in events {
        for span in spans {
            for chunk in s[span.start..span.end]
                .split(|b| b.is_ascii_whitespace())
                .filter(|c| !c.is_empty())
            {
                let stripped = strip_commands(chunk);
                let n = leading_word_len(&stripped);
                if n > 0 {
                    let word = String::from_utf8_lossy(&stripped[..n]).to_ascii_lowercase();
                    words.insert(word);
                }
            }
        }
    }
}

/// Read a user-supplied dictionary file: every word of three or more
/// characters, plus two-letter words from the first hundred lines.
pub fn load_dictionary_file(text: &str, words: &mut BTreeSet<String>) {
    for (i, line) in text.lines().enumerate() {
        if line.len() >= 3 || (line.len() == 2 && i < SHORT_WORD_LINE_LIMIT) {
            words.insert(line.to_string());
        }
    }
}

/// Freeze the harvested set into the replacement dictionary: drop
/// one-character words and two-character non-words, then re-admit the two
/// single-letter English words.
pub fn finalize_dictionary(words: BTreeSet<String>) -> Vec<String> {
    let mut dict: Vec<String> = words
        .into_iter()
        .filter(|w| w.len() > 1 && (w.len() > 2 || w.chars().all(char::is_alphabetic)))
        .collect();
    dict.push("A".to_string());
    dict.push("I".to_string());
    dict.sort();
    dict
}
