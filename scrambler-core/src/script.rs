use thiserror::Error;

/// Errors raised while lexing commands out of a decoded script.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("unknown command <{mnemonic} at offset {offset}")]
    UnknownCommand { mnemonic: String, offset: usize },

    #[error("command at offset {offset} is truncated by end of script")]
    TruncatedCommand { offset: usize },
}

// Argument-block byte count for every known command, keyed by its 3-byte
// mnemonic. 0/4/9/14/19 bytes hold 0-4 fixed-width numeric fields. The
// table is ASCII-sorted for binary search.
const COMMANDS: &[(&str, usize)] = &[
    ("AE+", 0), ("AM+", 9), ("AM-", 4), ("AMJ", 9), ("ANP", 14),
    ("BOA", 4), ("BSL", 4),
    ("CAT", 0), ("CIL", 0), ("CLO", 0), ("CLR", 0), ("CMP", 14),
    ("CMU", 4), ("CNP", 14), ("CPS", 0), ("CRE", 0), ("CSS", 0),
    ("DNA", 4), ("DNP", 4),
    ("ECJ", 9), ("END", 0), ("EQ+", 4), ("EQ-", 4), ("ESC", 0),
    ("EVE", 0),
    ("FAC", 4), ("FAI", 4), ("FAO", 4), ("FL+", 4), ("FL-", 4),
    ("FLA", 0), ("FLJ", 9), ("FMU", 0), ("FOB", 9), ("FOM", 4),
    ("FON", 9), ("FRE", 0),
    ("GIT", 4),
    ("HMC", 0),
    ("INI", 0), ("INP", 14), ("IT+", 4), ("IT-", 4), ("ITJ", 9),
    ("KEY", 0),
    ("LDP", 0), ("LI+", 4),
    ("ML+", 4), ("MLP", 0), ("MM0", 0), ("MNA", 0), ("MNP", 19),
    ("MOV", 9), ("MP+", 4), ("MPJ", 9), ("MS2", 0), ("MS3", 0),
    ("MS4", 0), ("MSG", 0), ("MYB", 4), ("MYD", 4),
    ("NCJ", 9), ("NOD", 0), ("NUM", 4),
    ("PRI", 0), ("PS+", 9),
    ("QUA", 4),
    ("RMU", 0),
    ("SAT", 0), ("SIL", 4), ("SK+", 4), ("SK-", 4), ("SKJ", 9),
    ("SLP", 0), ("SMC", 0), ("SMP", 9), ("SNP", 19), ("SOU", 4),
    ("SPS", 0), ("SSS", 4), ("STC", 0), ("SVP", 0),
    ("TAM", 14), ("TRA", 0), ("TUR", 0),
    ("UNI", 4), ("UNJ", 9),
    ("WAI", 4), ("WAS", 0),
    ("XX1", 4),
    ("YNJ", 4),
    ("ZAM", 0),
];

/// Argument-block length in bytes for a known mnemonic.
pub fn command_arg_len(mnemonic: &str) -> Option<usize> {
    COMMANDS
        .binary_search_by(|(m, _)| m.cmp(&mnemonic))
        .ok()
        .map(|i| COMMANDS[i].1)
}

/// One contiguous stretch of renderable dialogue inside an event, as byte
/// offsets into the decoded script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub portrait_open: bool,
}

fn find_byte(s: &[u8], byte: u8, from: usize) -> Option<usize> {
    s.get(from..)
        .and_then(|tail| tail.iter().position(|&b| b == byte))
        .map(|p| from + p)
}

fn skip_whitespace(s: &[u8], mut i: usize) -> usize {
    while i < s.len() && s[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Lex one command starting at the `<` marker at `i`.
///
/// Returns the mnemonic, the numeric argument substrings (maximal digit
/// runs inside the fixed-width argument block; filler never fails), and
/// the index just past the block.
pub fn parse_command<'a>(
    s: &'a [u8],
    i: usize,
) -> Result<(&'a str, Vec<String>, usize), ScriptError> {
    let raw = s
        .get(i + 1..i + 4)
        .ok_or(ScriptError::TruncatedCommand { offset: i })?;
    let known = std::str::from_utf8(raw)
        .ok()
        .and_then(|m| command_arg_len(m).map(|n| (m, n)));
    let Some((mnemonic, arg_len)) = known else {
        return Err(ScriptError::UnknownCommand {
            mnemonic: String::from_utf8_lossy(raw).into_owned(),
            offset: i,
        });
    };

    let block = s
        .get(i + 4..i + 4 + arg_len)
        .ok_or(ScriptError::TruncatedCommand { offset: i })?;
    let args = block
        .split(|b| !b.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .map(|run| String::from_utf8_lossy(run).into_owned())
        .collect();

    Ok((mnemonic, args, i + 4 + arg_len))
}

// Per-event segmentation state: the open message buffer (if any), and the
// portrait flags that decide each emitted span's width limit.
#[derive(Debug)]
struct EventState {
    buf_start: Option<usize>,
    buf_end: Option<usize>,
    affects_fac_open: bool,
    fac_open: bool,
    next_fac_open: bool,
}

impl EventState {
    fn new() -> Self {
        EventState {
            buf_start: None,
            buf_end: None,
            affects_fac_open: true,
            fac_open: false,
            next_fac_open: false,
        }
    }

    // A span is only ever emitted once both ends of the buffer are known.
    fn flush(&self, spans: &mut Vec<Span>) {
        if let (Some(start), Some(end)) = (self.buf_start, self.buf_end) {
            spans.push(Span {
                start,
                end,
                portrait_open: self.fac_open && self.affects_fac_open,
            });
        }
    }
}

/// Walk one event starting at `i`, collecting its message spans.
///
/// Returns the index where scanning stopped (just past the terminating
/// command, or end of text) together with the spans in order.
pub fn parse_event(s: &[u8], mut i: usize) -> Result<(usize, Vec<Span>), ScriptError> {
    let mut spans = Vec::new();
    let mut st = EventState::new();

    loop {
        let Some(marker) = find_byte(s, b'<', i) else {
            break;
        };
        if st.buf_start.is_some() && marker > i {
            st.buf_end = Some(marker);
        }
        i = marker;
        let (cmd, args, next) = parse_command(s, i)?;
        i = next;
        if st.buf_start.is_some() && st.buf_end.is_none() {
            // Buffer open but no text seen yet: slide its start past the
            // command we just consumed.
            i = skip_whitespace(s, i);
            st.buf_start = Some(i);
        }
        match cmd {
            "FAC" => {
                st.next_fac_open = args.first().is_some_and(|a| a != "0000");
                st.fac_open |= st.next_fac_open;
            }
            "MSG" | "MS2" | "MS3" | "MS4" | "TUR" => {
                if cmd == "MSG" {
                    st.affects_fac_open = true;
                } else if cmd != "TUR" {
                    st.affects_fac_open = false;
                }
                if st.buf_start.is_none() {
                    i = skip_whitespace(s, i);
                    st.buf_start = Some(i);
                    st.buf_end = None;
                }
            }
            "END" | "EVE" | "INI" | "LDP" | "TRA" => break,
            "CLO" => {
                st.flush(&mut spans);
                st.buf_start = None;
                st.buf_end = None;
                st.fac_open = false;
            }
            "CLR" => {
                if st.buf_start.is_some() && st.buf_end.is_some() {
                    st.flush(&mut spans);
                    // A clear keeps the portrait on screen.
                    st.fac_open = st.next_fac_open;
                    i = skip_whitespace(s, i);
                    st.buf_start = Some(i);
                    st.buf_end = None;
                }
            }
            _ => {}
        }
    }

    st.flush(&mut spans);
    Ok((i, spans))
}

/// Scan a decoded script for `#NNNN` event headers and segment each event.
///
/// Malformed headers are skipped. An unknown command aborts only the event
/// it appears in; a truncated command is fatal to the whole script. Events
/// whose header is immediately followed by another header (or end of text)
/// keep an empty slot so event indices stay aligned.
pub fn split_script(s: &[u8]) -> Result<Vec<Vec<Span>>, ScriptError> {
    let mut events = Vec::new();
    let mut i = 0;

    while i < s.len() {
        let Some(hash) = find_byte(s, b'#', i) else {
            break;
        };
        let id = &s[hash + 1..(hash + 5).min(s.len())];
        i = hash + 5;
        if id.len() != 4 || !id.iter().all(u8::is_ascii_digit) {
            continue;
        }
        i = skip_whitespace(s, i);
        if i >= s.len() || s[i] == b'#' {
            events.push(Vec::new());
            continue;
        }
        match parse_event(s, i) {
            Ok((next, spans)) => {
                i = next;
                events.push(spans.into_iter().filter(|t| t.start != t.end).collect());
            }
            Err(ScriptError::UnknownCommand { .. }) => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::{parse_command, parse_event, split_script, ScriptError};

    fn span_text<'a>(s: &'a [u8], span: &super::Span) -> &'a [u8] {
        &s[span.start..span.end]
    }

    #[test]
    fn msg_lexes_with_no_args() {
        let (cmd, args, next) = parse_command(b"<MSG>text", 0).unwrap();
        assert_eq!(cmd, "MSG");
        assert!(args.is_empty());
        assert_eq!(next, 4);
    }

    #[test]
    fn fixed_width_argument_blocks() {
        let (cmd, args, next) = parse_command(b"<FAC0005", 0).unwrap();
        assert_eq!((cmd, next), ("FAC", 8));
        assert_eq!(args, vec!["0005"]);

        // Two fields separated by non-digit filler.
        let (cmd, args, next) = parse_command(b"<FLJ0100:0001", 0).unwrap();
        assert_eq!((cmd, next), ("FLJ", 13));
        assert_eq!(args, vec!["0100", "0001"]);
    }

    #[test]
    fn unknown_mnemonic_is_an_error() {
        assert!(matches!(
            parse_command(b"<ZZZ", 0),
            Err(ScriptError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn truncated_commands_are_fatal() {
        assert!(matches!(
            parse_command(b"<MS", 0),
            Err(ScriptError::TruncatedCommand { .. })
        ));
        // Mnemonic is complete but the argument block is not.
        assert!(matches!(
            parse_command(b"<FAC00", 0),
            Err(ScriptError::TruncatedCommand { .. })
        ));
    }

    #[test]
    fn minimal_event_yields_one_span() {
        let s = b"#0001\r\n<MSG\r\nHello world.<CLO\r\n<END";
        let events = split_script(s).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].len(), 1);
        assert_eq!(span_text(s, &events[0][0]), b"Hello world.");
        assert!(!events[0][0].portrait_open);
    }

    #[test]
    fn fac_opens_portrait_for_msg() {
        let s = b"#0001\r\n<FAC0005<MSG\r\nHi.<END";
        let events = split_script(s).unwrap();
        assert_eq!(span_text(s, &events[0][0]), b"Hi.");
        assert!(events[0][0].portrait_open);
    }

    #[test]
    fn fac_zero_keeps_portrait_closed() {
        let s = b"#0001\r\n<FAC0000<MSG\r\nHi.<END";
        let events = split_script(s).unwrap();
        assert!(!events[0][0].portrait_open);
    }

    #[test]
    fn ms2_masks_portrait_width() {
        // The portrait is on screen, but MS2 renders in the unshrunk box.
        let s = b"#0001\r\n<FAC0005<MS2\r\nHi.<END";
        let events = split_script(s).unwrap();
        assert!(!events[0][0].portrait_open);
    }

    #[test]
    fn clear_carries_portrait_and_reopens() {
        let s = b"#0001\r\n<FAC0005<MSG\r\nOne.<CLRTwo.<END";
        let events = split_script(s).unwrap();
        assert_eq!(events[0].len(), 2);
        assert_eq!(span_text(s, &events[0][0]), b"One.");
        assert_eq!(span_text(s, &events[0][1]), b"Two.");
        assert!(events[0][0].portrait_open);
        assert!(events[0][1].portrait_open);
    }

    #[test]
    fn close_resets_portrait() {
        let s = b"#0001\r\n<FAC0005<MSG\r\nOne.<CLO\r\n<MSG\r\nTwo.<END";
        let events = split_script(s).unwrap();
        assert_eq!(events[0].len(), 2);
        assert!(events[0][0].portrait_open);
        assert!(!events[0][1].portrait_open);
    }

    #[test]
    fn terminator_ends_the_event() {
        let s = b"#0001\r\n<MSG\r\nA.<END trailing <MSG\r\nB.";
        let events = split_script(s).unwrap();
        assert_eq!(events[0].len(), 1);
        assert_eq!(span_text(s, &events[0][0]), b"A.");
    }

    #[test]
    fn pending_buffer_flushes_at_event_end() {
        // No explicit CLO before END: the open buffer still becomes a span.
        let s = b"#0001\r\n<MSG\r\nLeft open<END";
        let events = split_script(s).unwrap();
        assert_eq!(span_text(s, &events[0][0]), b"Left open");
    }

    #[test]
    fn unknown_command_skips_event_only() {
        let s = b"#0001\r\n<MSG\r\nBad<QQQ\r\n#0002\r\n<MSG\r\nGood.<CLO\r\n<END";
        let events = split_script(s).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(span_text(s, &events[0][0]), b"Good.");
    }

    #[test]
    fn malformed_header_is_skipped() {
        let s = b"#12AB\r\n#0002\r\n<MSG\r\nOk.<END";
        let events = split_script(s).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(span_text(s, &events[0][0]), b"Ok.");
    }

    #[test]
    fn back_to_back_headers_keep_an_empty_slot() {
        let s = b"#0001\r\n#0002\r\n<MSG\r\nHi.<END";
        let events = split_script(s).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_empty());
        assert_eq!(events[1].len(), 1);
    }

    #[test]
    fn whitespace_only_buffer_yields_no_span() {
        let s = b"#0001\r\n<MSG\r\n\r\n<CLO\r\n<END";
        let events = split_script(s).unwrap();
        assert!(events[0].is_empty());
    }

    #[test]
    fn truncated_command_fails_the_script() {
        let s = b"#0001\r\n<MSG\r\nHi<FA";
        assert!(split_script(s).is_err());
    }

    #[test]
    fn event_scan_resumes_after_terminator() {
        let (stop, spans) = parse_event(b"<MSG\r\nA.<END#0002", 0).unwrap();
        assert_eq!(spans.len(), 1);
        // Scanning stopped just past <END, before the next header.
        assert_eq!(&b"<MSG\r\nA.<END#0002"[stop..], b"#0002");
    }
}
