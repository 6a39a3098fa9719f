use rand::rngs::StdRng;
use rand::Rng;

use crate::script::{parse_command, split_script, ScriptError};
use crate::words::leading_word_len;
use crate::ScrambleSettings;

// Dialogue box widths in characters.
const PORTRAIT_WIDTH: usize = 27;
const FULL_WIDTH: usize = 34;

// A token ending in one of these marks the next token as a sentence start;
// a token starting with one is glued on without a space.
const PUNCTUATION: &[u8] = b",.:;?!";

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn is_blank(token: &[u8]) -> bool {
    token.iter().all(u8::is_ascii_whitespace)
}

fn prepend(token: &mut Vec<u8>, prefix: &[u8]) {
    token.splice(0..0, prefix.iter().copied());
}

// First char uppercased, the rest lowered.
fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Replace the leading word of `token` with a random dictionary entry,
/// matching the original's case pattern: an all-uppercase word of two or
/// more characters stays uppercase, a capitalized or purely numeric word
/// gets a capitalized replacement.
pub fn scramble_word(token: &[u8], dictionary: &[String], rng: &mut StdRng) -> Vec<u8> {
    let n = leading_word_len(token);
    if n == 0 || dictionary.is_empty() {
        return token.to_vec();
    }

    let matched = &token[..n];
    let pick = dictionary[rng.gen_range(0..dictionary.len())].as_str();
    let replacement = if n > 1
        && matched.iter().any(u8::is_ascii_uppercase)
        && !matched.iter().any(u8::is_ascii_lowercase)
    {
        pick.to_uppercase()
    } else if matched[0].is_ascii_uppercase() || matched.iter().all(u8::is_ascii_digit) {
        capitalize(pick)
    } else {
        pick.to_string()
    };

    let mut out = replacement.into_bytes();
    out.extend_from_slice(&token[n..]);
    out
}

// Split a span into tokens, keeping embedded command substrings as their
// own tokens. Whitespace between tokens is dropped here and re-inserted by
// the line wrapper. A command that does not lex keeps the tail literal.
fn tokenize_span(span: &[u8]) -> Vec<Vec<u8>> {
    let mut words = Vec::new();
    for chunk in span
        .split(|b| b.is_ascii_whitespace())
        .filter(|c| !c.is_empty())
    {
        let mut curr: &[u8] = chunk;
        while let Some(j) = curr.iter().position(|&b| b == b'<') {
            match parse_command(curr, j) {
                Ok((_, _, end)) => {
                    if j > 0 {
                        words.push(curr[..j].to_vec());
                    }
                    words.push(curr[j..end].to_vec());
                    curr = &curr[end..];
                }
                Err(_) => {
                    if j > 0 {
                        words.push(curr[..j].to_vec());
                    }
                    words.push(curr[j..].to_vec());
                    curr = &[];
                }
            }
        }
        if !curr.is_empty() {
            words.push(curr.to_vec());
        }
    }
    words
}

/// Scramble the dialogue of a decoded script, leaving headers, commands
/// and non-message text untouched.
///
/// Each word is replaced with probability `scramble_rate`; in force mode
/// one word of one span per event is always replaced. Spans are re-wrapped
/// to the dialogue box width (27 columns with a portrait, 34 without),
/// breaking lines after a pause command at a sentence start. Every
/// replacement is appended to `log`.
pub fn scramble_script(
    s: &str,
    dictionary: &[String],
    settings: &ScrambleSettings,
    rng: &mut StdRng,
    log: &mut String,
    label: &str,
) -> Result<String, ScriptError> {
    let b = s.as_bytes();
    let events = split_script(b)?;

    let mut out: Vec<u8> = Vec::with_capacity(b.len() + 64);
    let mut idx = 0usize;

    for (event_no, spans) in events.iter().enumerate() {
        // In force mode exactly one span per event is guaranteed a
        // replacement, as long as the event has any.
        let chosen: i64 = if settings.force && !spans.is_empty() {
            rng.gen_range(0..spans.len()) as i64
        } else {
            -1
        };
        let mut start_sentence = true;

        for (span_no, span) in spans.iter().enumerate() {
            if span.start > idx {
                out.extend_from_slice(&b[idx..span.start]);
                idx = span.end;
            }

            let mut words = tokenize_span(&b[span.start..span.end]);

            let mut forced = usize::MAX;
            if !words.is_empty() && span_no as i64 == chosen {
                let real: Vec<usize> = words
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| !is_blank(w) && w.first() != Some(&b'<'))
                    .map(|(j, _)| j)
                    .collect();
                forced = if real.is_empty() {
                    0
                } else {
                    real[rng.gen_range(0..real.len())]
                };
            }

            let mut charcount = 0usize;
            let mut was_pause = false;
            let limit = if span.portrait_open {
                PORTRAIT_WIDTH
            } else {
                FULL_WIDTH
            };

            for j in 0..words.len() {
                if is_blank(&words[j]) || words[j].first() == Some(&b'<') {
                    was_pause = contains(&words[j], b"<NOD") || contains(&words[j], b"<WAI");
                    if contains(&words[j], b"<NUM") {
                        words[j].insert(0, b' ');
                    }
                    continue;
                }

                if j == forced || rng.gen::<f64>() < settings.scramble_rate {
                    let replaced = scramble_word(&words[j], dictionary, rng);
                    if replaced != words[j] {
                        log.push_str(&format!(
                            "{label}: event {event_no} span {span_no}: {} -> {}\n",
                            String::from_utf8_lossy(&words[j]),
                            String::from_utf8_lossy(&replaced),
                        ));
                        words[j] = replaced;
                    }
                }

                let len = words[j].len();
                let first = words[j].first().copied();
                let last = words[j].last().copied();
                if j > 0 {
                    if charcount + len + 1 > limit || (was_pause && start_sentence) {
                        prepend(&mut words[j], b"\r\n");
                        charcount = len;
                    } else if first.is_some_and(|c| !PUNCTUATION.contains(&c)) {
                        prepend(&mut words[j], b" ");
                        charcount += 1 + len;
                    } else {
                        charcount += len;
                    }
                } else {
                    charcount += len;
                }

                start_sentence = last.is_some_and(|c| PUNCTUATION.contains(&c));
                was_pause = false;
            }

            for w in &words {
                out.extend_from_slice(w);
            }
        }
    }

    if idx < b.len() {
        out.extend_from_slice(&b[idx..]);
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}
