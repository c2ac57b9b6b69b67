//! Unit and property tests for the line reader.

use proptest::prelude::*;
use rstest::rstest;

use super::*;
use crate::tests::support::{Chunk, ScriptedReader};

fn reader(chunks: impl IntoIterator<Item = Chunk>) -> LineReader {
    LineReader::new(PipeChannel::from_reader("test", ScriptedReader::new(chunks)))
}

fn line(bytes: &[u8], truncated: bool) -> LineRead {
    LineRead::Line(Line {
        bytes: bytes.to_vec(),
        truncated,
    })
}

#[rstest]
#[case(b"hello\n".as_slice(), b"hello".as_slice())]
#[case(b"hello\r\n".as_slice(), b"hello".as_slice())]
#[case(b"\n".as_slice(), b"".as_slice())]
fn strips_terminators(#[case] input: &[u8], #[case] expected: &[u8]) {
    let mut lines = reader([Chunk::data(input)]);
    assert_eq!(lines.get_line(64).expect("line"), line(expected, false));
    assert_eq!(lines.get_line(64).expect("closed"), LineRead::Closed);
}

#[rstest]
fn excess_bytes_wait_for_the_next_call() {
    let mut lines = reader([Chunk::data(b"one\ntwo\nthr"), Chunk::WouldBlock]);

    assert_eq!(lines.get_line(64).expect("first"), line(b"one", false));
    assert_eq!(lines.get_line(64).expect("second"), line(b"two", false));
    assert_eq!(lines.get_line(64).expect("third"), LineRead::Incomplete);
    assert_eq!(lines.buffered(), 3);
}

#[rstest]
fn incomplete_lines_are_preserved_across_polls() {
    let mut lines = reader([
        Chunk::data(b"abc"),
        Chunk::WouldBlock,
        Chunk::data(b"def\n"),
    ]);

    assert_eq!(lines.get_line(64).expect("poll"), LineRead::Incomplete);
    assert_eq!(lines.get_line(64).expect("line"), line(b"abcdef", false));
}

#[rstest]
fn trailing_partial_line_is_surfaced_once() {
    let mut lines = reader([Chunk::data(b"done\nleft"), Chunk::Eof]);

    assert_eq!(lines.get_line(64).expect("line"), line(b"done", false));
    assert_eq!(lines.get_line(64).expect("partial"), line(b"left", false));
    assert_eq!(lines.get_line(64).expect("closed"), LineRead::Closed);
    assert_eq!(lines.get_line(64).expect("still closed"), LineRead::Closed);
    assert!(lines.is_closed());
}

#[rstest]
fn overlong_lines_are_split_at_the_limit() {
    let mut lines = reader([Chunk::data(b"abcdefghij\nxy\n")]);

    assert_eq!(lines.get_line(4).expect("piece"), line(b"abcd", true));
    assert_eq!(lines.get_line(4).expect("piece"), line(b"efgh", true));
    assert_eq!(lines.get_line(4).expect("tail"), line(b"ij", false));
    assert_eq!(lines.get_line(4).expect("next"), line(b"xy", false));
}

#[rstest]
fn line_exactly_at_the_limit_is_not_truncated() {
    let mut lines = reader([Chunk::data(b"abcd\r\n")]);
    assert_eq!(lines.get_line(4).expect("line"), line(b"abcd", false));
}

#[rstest]
fn zero_limit_is_treated_as_one() {
    let mut lines = reader([Chunk::data(b"ab\n")]);

    assert_eq!(lines.get_line(0).expect("piece"), line(b"a", true));
    assert_eq!(lines.get_line(0).expect("tail"), line(b"b", false));
}

#[rstest]
fn channel_errors_propagate() {
    let mut lines = reader([Chunk::data(b"par"), Chunk::Fail(std::io::ErrorKind::BrokenPipe)]);
    assert!(lines.get_line(64).is_err());
    assert_eq!(lines.buffered(), 3);
}

#[rstest]
fn nonblocking_read_copies_into_the_caller_buffer() {
    let mut lines = reader([Chunk::data(b"eth0\n"), Chunk::WouldBlock, Chunk::Eof]);
    let mut buffer = [0_u8; 16];

    assert_eq!(
        read_line_nonblocking(&mut lines, &mut buffer, 16).expect("read"),
        NonBlockingRead::Read(4)
    );
    assert_eq!(buffer.get(..4), Some(&b"eth0"[..]));
    assert_eq!(
        read_line_nonblocking(&mut lines, &mut buffer, 16).expect("poll"),
        NonBlockingRead::WouldBlock
    );
    assert_eq!(
        read_line_nonblocking(&mut lines, &mut buffer, 16).expect("eof"),
        NonBlockingRead::Closed
    );
}

#[rstest]
fn nonblocking_read_respects_the_smaller_bound() {
    let mut lines = reader([Chunk::data(b"abcdef\n")]);
    let mut buffer = [0_u8; 3];

    assert_eq!(
        read_line_nonblocking(&mut lines, &mut buffer, 100).expect("read"),
        NonBlockingRead::Read(3)
    );
    assert_eq!(&buffer, b"abc");
    assert_eq!(
        read_line_nonblocking(&mut lines, &mut [], 100).expect("empty"),
        NonBlockingRead::Read(0)
    );
}

fn chunk_input(input: &[u8], cuts: &[usize]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut rest = input;
    let mut sizes = cuts.iter().cycle();
    while !rest.is_empty() {
        let size = sizes.next().copied().unwrap_or(1).min(rest.len());
        let (head, tail) = rest.split_at(size);
        chunks.push(Chunk::data(head));
        chunks.push(Chunk::WouldBlock);
        rest = tail;
    }
    chunks.push(Chunk::Eof);
    chunks
}

fn text_byte() -> impl Strategy<Value = u8> {
    prop_oneof![
        1 => Just(b'\n'),
        1 => Just(b'\r'),
        6 => any::<u8>().prop_filter("no terminators", |byte| *byte != b'\n' && *byte != b'\r'),
    ]
}

/// Lines as a reader should deliver them: one `\r` before each newline is
/// dropped and an unterminated tail is kept verbatim.
fn expected_lines(input: &[u8]) -> Vec<u8> {
    let mut expected = Vec::new();
    let mut segments = input.split(|byte| *byte == b'\n').peekable();
    while let Some(segment) = segments.next() {
        let terminated = segments.peek().is_some();
        if terminated {
            expected.extend_from_slice(segment.strip_suffix(b"\r").unwrap_or(segment));
            expected.push(b'\n');
        } else if !segment.is_empty() {
            expected.extend_from_slice(segment);
            expected.push(b'\n');
        }
    }
    expected
}

proptest! {
    #[test]
    fn chunked_input_reassembles_with_terminators_stripped(
        input in proptest::collection::vec(text_byte(), 0..512),
        cuts in proptest::collection::vec(1_usize..64, 1..16),
        limit in 1_usize..48,
    ) {
        let mut lines = reader(chunk_input(&input, &cuts));
        let mut rebuilt = Vec::new();
        let mut polls = 0;

        loop {
            polls += 1;
            prop_assert!(polls < 10_000, "reader did not terminate");
            match lines.get_line(limit).expect("scripted reads succeed") {
                LineRead::Line(piece) => {
                    prop_assert!(piece.bytes.len() <= limit);
                    rebuilt.extend_from_slice(&piece.bytes);
                    if !piece.truncated {
                        rebuilt.push(b'\n');
                    }
                }
                LineRead::Incomplete => {}
                LineRead::Closed => break,
            }
        }

        prop_assert_eq!(rebuilt, expected_lines(&input));
    }
}
