//! Dispatcher tests over scripted in-memory streams.

use std::io::ErrorKind;
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::errors::PREMATURE_CLOSE_MESSAGE;
use crate::tests::support::{Chunk, RecordedEvent, RecordingEvents, ScriptedReader};

#[fixture]
fn recorder() -> RecordingEvents {
    RecordingEvents::new()
}

fn limits() -> DispatchLimits {
    DispatchLimits {
        poll_interval: Duration::from_millis(1),
        ..DispatchLimits::default()
    }
}

fn dispatcher(
    control: impl IntoIterator<Item = Chunk>,
    diagnostics: impl IntoIterator<Item = Chunk>,
    events: RecordingEvents,
) -> EventDispatcher<RecordingEvents> {
    EventDispatcher::new(
        PipeChannel::from_reader("stderr", ScriptedReader::new(control)),
        Some(PipeChannel::from_reader(
            "stdout",
            ScriptedReader::new(diagnostics),
        )),
        events,
        SessionStatus::new(),
        limits(),
    )
}

fn pump_to_end(dispatcher: &mut EventDispatcher<RecordingEvents>) {
    for _ in 0..100 {
        if dispatcher.pump().expect("pump") == Pump::Finished {
            return;
        }
    }
    panic!("dispatcher did not finish");
}

#[rstest]
fn delivers_a_short_capture_in_order(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher([Chunk::data(b"F/tmp/a.pcapng\nP42\n")], [], recorder.clone());

    assert_eq!(dispatcher.await_start(|| {}).expect("start"), StartOutcome::Running);
    assert_eq!(dispatcher.status().state(), SessionState::Running);
    pump_to_end(&mut dispatcher);

    assert_eq!(
        recorder.events(),
        vec![
            RecordedEvent::NewFile(String::from("/tmp/a.pcapng")),
            RecordedEvent::Packets(42),
            RecordedEvent::Closed(None),
        ]
    );
    assert_eq!(dispatcher.status().state(), SessionState::Stopped);
    assert_eq!(dispatcher.status().packets(), 42);
}

#[rstest]
fn silent_exit_is_a_premature_close(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher([], [], recorder.clone());

    let error = dispatcher.await_start(|| {}).expect_err("start should fail");

    assert!(matches!(error, SyncError::PrematureClose { diagnostic: None }));
    assert_eq!(error.primary_message(), PREMATURE_CLOSE_MESSAGE);
    assert_eq!(dispatcher.status().state(), SessionState::Failed);
    assert!(recorder.events().is_empty());
}

#[rstest]
fn diagnostics_explain_a_premature_close(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [Chunk::WouldBlock, Chunk::Eof],
        [Chunk::data(b"You don't have permission to capture on eth0\n")],
        recorder,
    );

    let error = dispatcher.await_start(|| {}).expect_err("start should fail");

    assert_eq!(
        error.primary_message(),
        "You don't have permission to capture on eth0"
    );
}

#[rstest]
fn closed_message_carries_its_diagnostic_when_nothing_else_was_said(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher([Chunk::data(b"Zinterface eth9 vanished\n")], [], recorder);

    let error = dispatcher.await_start(|| {}).expect_err("start should fail");

    assert_eq!(error.primary_message(), "interface eth9 vanished");
}

#[rstest]
fn closing_diagnostic_wins_over_stdout_noise(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [Chunk::WouldBlock, Chunk::data(b"Zinterface eth9 vanished\n")],
        [Chunk::data(b"noise\n")],
        recorder,
    );

    let error = dispatcher.await_start(|| {}).expect_err("start should fail");

    assert_eq!(error.primary_message(), "interface eth9 vanished");
}

#[rstest]
#[case(b"Ebad filter\0syntax error\n".as_slice(), "bad filter", Some("syntax error"))]
#[case(b"Bexpression matches nothing\n".as_slice(), "expression matches nothing", None)]
fn worker_errors_fail_start_up(
    recorder: RecordingEvents,
    #[case] control: &[u8],
    #[case] primary: &str,
    #[case] secondary: Option<&str>,
) {
    let mut dispatcher = dispatcher([Chunk::data(control)], [], recorder);

    let error = dispatcher.await_start(|| {}).expect_err("start should fail");

    assert_eq!(error.primary_message(), primary);
    assert_eq!(error.secondary_message().as_deref(), secondary);
    assert_eq!(dispatcher.status().state(), SessionState::Failed);
}

#[rstest]
fn capture_filter_errors_name_the_interface(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher([Chunk::data(b"C2\0syntax error in filter\n")], [], recorder);

    let error = dispatcher.await_start(|| {}).expect_err("start should fail");

    assert!(matches!(
        error,
        SyncError::CaptureFilter { index: 2, ref message } if message == "syntax error in filter"
    ));
}

#[rstest]
fn rejected_first_file_requests_a_stop() {
    let recorder = RecordingEvents::rejecting();
    let mut dispatcher = dispatcher([Chunk::data(b"F/tmp/a\n")], [], recorder);

    assert_eq!(dispatcher.await_start(|| {}).expect("start"), StartOutcome::Rejected);
    assert!(dispatcher.wants_stop());
}

#[rstest]
fn progress_runs_while_waiting(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [
            Chunk::WouldBlock,
            Chunk::data(b"F/tm"),
            Chunk::WouldBlock,
            Chunk::data(b"p/a\n"),
        ],
        [],
        recorder,
    );
    let mut polls = 0;

    dispatcher.await_start(|| polls += 1).expect("start");

    assert_eq!(polls, 2);
}

#[rstest]
fn partial_lines_wait_for_completion(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [
            Chunk::data(b"Fa\nP4"),
            Chunk::WouldBlock,
            Chunk::data(b"2\nD3\0eth0\n"),
            Chunk::WouldBlock,
        ],
        [],
        recorder.clone(),
    );
    dispatcher.await_start(|| {}).expect("start");

    assert_eq!(dispatcher.pump().expect("pump"), Pump::Idle);
    assert_eq!(dispatcher.pump().expect("pump"), Pump::Dispatched(2));
    assert_eq!(dispatcher.status().drops(), 3);
    assert_eq!(
        recorder.events().get(1..),
        Some(
            &[
                RecordedEvent::Packets(42),
                RecordedEvent::Drops(3, Some(String::from("eth0"))),
            ][..]
        )
    );
}

#[rstest]
fn repeated_malformed_lines_escalate_once(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [Chunk::data(b"Fa\nQ1\nQ2\nP1\nQ3\nQ4\nQ5\n")],
        [],
        recorder.clone(),
    );
    dispatcher.await_start(|| {}).expect("start");
    pump_to_end(&mut dispatcher);

    let errors: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|event| matches!(event, RecordedEvent::Error(..)))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.first(),
        Some(RecordedEvent::Error(primary, Some(_))) if primary == PROTOCOL_MISMATCH
    ));
    assert_eq!(dispatcher.status().packets(), 1);
}

#[rstest]
fn counters_before_start_are_protocol_violations(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher([Chunk::data(b"P1\nD2\nS\nF/tmp/a\n")], [], recorder.clone());

    dispatcher.await_start(|| {}).expect("start");

    assert_eq!(dispatcher.status().packets(), 0);
    assert_eq!(
        recorder.events().first(),
        Some(&RecordedEvent::Error(
            String::from(PROTOCOL_MISMATCH),
            Some(String::from(
                "3 consecutive malformed control lines, last: success message received before the capture started"
            )),
        ))
    );
}

#[rstest]
fn running_errors_go_to_callbacks(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [Chunk::data(
            b"Fa\nEdisk full\0stopped writing\nC0\0bad\nBno match\nS\nZ\n",
        )],
        [],
        recorder.clone(),
    );
    dispatcher.await_start(|| {}).expect("start");
    pump_to_end(&mut dispatcher);

    let events = recorder.events();
    assert!(events.contains(&RecordedEvent::Error(
        String::from("disk full"),
        Some(String::from("stopped writing"))
    )));
    assert!(events.contains(&RecordedEvent::CFilterError(0, String::from("bad"))));
    assert!(events.contains(&RecordedEvent::Error(String::from("no match"), None)));
    assert_eq!(recorder.closed_count(), 1);
}

#[rstest]
fn closed_message_prefers_its_own_diagnostic(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [Chunk::data(b"Fa\nZout of disk space\n")],
        [Chunk::data(b"noise\n")],
        recorder.clone(),
    );
    dispatcher.await_start(|| {}).expect("start");
    pump_to_end(&mut dispatcher);

    assert_eq!(
        recorder.events().last(),
        Some(&RecordedEvent::Closed(Some(String::from("out of disk space"))))
    );
}

#[rstest]
fn eof_reports_accumulated_diagnostics(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [Chunk::data(b"Fa\n"), Chunk::WouldBlock, Chunk::Eof],
        [Chunk::data(b"first\nsecond\n")],
        recorder.clone(),
    );
    dispatcher.await_start(|| {}).expect("start");
    pump_to_end(&mut dispatcher);

    assert_eq!(
        recorder.events().last(),
        Some(&RecordedEvent::Closed(Some(String::from("first\nsecond"))))
    );
}

#[rstest]
fn channel_failure_while_running_fails_the_session(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [Chunk::data(b"Fa\n"), Chunk::Fail(ErrorKind::ConnectionReset)],
        [],
        recorder.clone(),
    );
    dispatcher.await_start(|| {}).expect("start");

    assert!(dispatcher.pump().is_err());
    assert_eq!(dispatcher.status().state(), SessionState::Failed);
    assert!(matches!(
        recorder.events().last(),
        Some(RecordedEvent::Closed(Some(text))) if text.contains("stderr")
    ));
    assert_eq!(dispatcher.pump().expect("finished"), Pump::Finished);
    assert_eq!(recorder.closed_count(), 1);
}

#[rstest]
fn stopping_keeps_delivering_messages(recorder: RecordingEvents) {
    let mut dispatcher = dispatcher(
        [
            Chunk::data(b"Fa\n"),
            Chunk::WouldBlock,
            Chunk::data(b"P5\nP6\n"),
        ],
        [],
        recorder.clone(),
    );
    dispatcher.await_start(|| {}).expect("start");
    dispatcher.pump().expect("pump");

    dispatcher.begin_stopping();
    assert_eq!(dispatcher.status().state(), SessionState::Stopping);
    pump_to_end(&mut dispatcher);

    assert_eq!(dispatcher.status().packets(), 11);
    assert_eq!(dispatcher.status().state(), SessionState::Stopped);
}

#[rstest]
fn overlong_control_lines_are_skipped_whole(recorder: RecordingEvents) {
    let mut long_line = b"F".to_vec();
    long_line.extend(std::iter::repeat_n(b'x', 40));
    long_line.extend_from_slice(b"\nP7\n");
    let mut dispatcher = EventDispatcher::new(
        PipeChannel::from_reader("stderr", ScriptedReader::new([Chunk::data(b"Fa\n"), Chunk::Data(long_line)])),
        None,
        recorder.clone(),
        SessionStatus::new(),
        DispatchLimits {
            line_limit: 16,
            ..limits()
        },
    );
    dispatcher.await_start(|| {}).expect("start");
    pump_to_end(&mut dispatcher);

    assert_eq!(
        recorder.events(),
        vec![
            RecordedEvent::NewFile(String::from("a")),
            RecordedEvent::Packets(7),
            RecordedEvent::Closed(None),
        ]
    );
}
