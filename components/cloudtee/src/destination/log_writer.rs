//! Batching Log Writer - responsibility and behavior
//!
//! Turns the byte stream into log events and appends them, in order, to one
//! log stream of a token-sequenced log service.
//!
//! Key responsibilities:
//! - Resolve the stream name from the output name and prepare the remote side
//!   (create the group when allowed, create the stream, or recover the token
//!   of an existing stream).
//! - Run a line splitter that turns the pipe into events, one per non-empty
//!   line, stamped with the wall-clock time at scan. A line never occupies
//!   more memory than one event may carry; longer lines are cut into
//!   consecutive events.
//! - Run a batching loop that flushes when `buffer_lines` lines arrived since
//!   the last attempt, when the flush interval elapses with a non-empty batch,
//!   and once more after close.
//! - Thread the sequence token from every accepted append into the next one.
//!
//! Important design notes:
//! - Only the batching loop talks to the service, so appends for a stream never
//!   overlap.
//! - Cancellation ends the batching loop but never the drain. After it, the
//!   worker waits for the splitter to reach end-of-stream and flushes what is
//!   left.
//! - A failed append keeps its events for the next flush. When the service
//!   rejects the token and names the expected one, that token is used next.

// Local crates
use crate::destination::{
    LogDestination,
    log_batch::{FlushReason, LogBatch},
};
use crate::helpers::{load_config::CloudwatchSettings, naming::log_stream_name};
use crate::log_service::{
    LogEvent, LogService, LogServiceError, MAX_EVENT_MESSAGE_BYTES, SequenceToken,
};
use crate::writer::{
    error::DestinationError,
    pipe::PipeReader,
    scoped_writer::{ErrorReporter, ScopedWriter, WorkerContext},
};

// External crates
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{Instrument, instrument};

/// Tag put on log groups this tool creates.
pub const GENERATED_BY_TAG: (&str, &str) = ("GeneratedBy", "cloudtee");

/// Log stream destination: a scoped writer whose worker batches lines.
#[derive(Debug)]
pub struct LogWriter {
    destination: LogDestination,
    inner: ScopedWriter,
}

impl LogWriter {
    /// Prepare the log stream for `output_name` and start the batching worker.
    #[instrument(
        name = "cloudtee_log_writer::new",
        target = "destination::log_writer",
        skip_all,
        fields(output_name = %output_name),
        level = "debug"
    )]
    pub async fn new(
        service: Arc<dyn LogService>,
        settings: &CloudwatchSettings,
        output_name: &str,
    ) -> Result<Self, DestinationError> {
        let destination = LogDestination {
            group: settings.log_group.clone(),
            stream: log_stream_name(output_name),
        };
        let locator = destination.to_string();

        let token = prepare_log_stream(service.as_ref(), &destination, settings.create_log_group)
            .await
            .map_err(|source| DestinationError::LogSetup {
                locator: locator.clone(),
                source,
            })?;
        tracing::debug!(destination = %locator, token = ?token, "Log stream prepared");

        let flusher = Flusher {
            service,
            destination: destination.clone(),
            token,
        };
        let flush_interval = settings.flush_interval;
        let buffer_lines = settings.buffer_lines;

        let inner = ScopedWriter::builder(locator)
            .worker(move |ctx| run_worker(ctx, flusher, flush_interval, buffer_lines))
            .spawn()
            .await?;

        Ok(Self { destination, inner })
    }

    /// Forward `buf` to the line splitter.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, DestinationError> {
        self.inner.write(buf).await
    }

    /// Terminate a trailing partial line, then close the worker and drain.
    pub async fn close(&mut self) -> Result<(), DestinationError> {
        tracing::debug!(destination = %self.destination, "Closing log writer");
        let pending = match self.inner.write_unpolled(b"\n").await {
            Ok(()) => None,
            Err(err) if err.is_pipe_closed() => None,
            Err(err) => Some(err),
        };
        self.inner.close().await?;
        pending.map_or(Ok(()), Err)
    }

    pub(crate) fn abort(&mut self) {
        self.inner.abort();
    }
}

impl fmt::Display for LogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.destination.fmt(f)
    }
}

/// Make sure `destination` exists and return the token for its next append.
///
/// `None` is returned for a stream that was just created or never written to.
pub async fn prepare_log_stream(
    service: &dyn LogService,
    destination: &LogDestination,
    create_group: bool,
) -> Result<Option<SequenceToken>, LogServiceError> {
    let streams = match service
        .describe_log_streams(&destination.group, &destination.stream)
        .await
    {
        Ok(streams) => streams,
        Err(err) if err.is_log_group_not_found() && create_group => {
            tracing::info!(log_group = %destination.group, "Creating log group");
            service
                .create_log_group(&destination.group, &[GENERATED_BY_TAG])
                .await?;
            Vec::new()
        }
        Err(err) => return Err(err),
    };

    if let Some(existing) = streams.into_iter().find(|s| s.name == destination.stream) {
        return Ok(existing.upload_sequence_token);
    }

    tracing::info!(log_stream = %destination.stream, "Creating log stream");
    service
        .create_log_stream(&destination.group, &destination.stream)
        .await?;
    Ok(None)
}

/// Owns the service handle and the sequence token of one stream.
#[derive(Debug)]
struct Flusher {
    service: Arc<dyn LogService>,
    destination: LogDestination,
    token: Option<SequenceToken>,
}

impl Flusher {
    /// Append the whole batch, chunk by chunk, threading the token.
    #[instrument(
        name = "cloudtee_log_writer::flush",
        target = "destination::log_writer",
        skip_all,
        fields(reason = %reason, events = batch.len()),
        level = "debug"
    )]
    async fn flush(
        &mut self,
        batch: &mut LogBatch,
        reason: FlushReason,
    ) -> Result<(), DestinationError> {
        batch.begin_attempt();
        tracing::debug!("Put log events");

        while !batch.is_empty() {
            let chunk = batch.next_chunk();
            let count = chunk.len();
            let result = self
                .service
                .put_log_events(
                    &self.destination.group,
                    &self.destination.stream,
                    chunk,
                    self.token.as_ref(),
                )
                .await;
            match result {
                Ok(next) => {
                    self.token = next;
                    batch.consume(count);
                }
                Err(source) => {
                    tracing::error!(error = %source, retained = batch.len(), "Put log events failed");
                    if let Some(expected) = source.expected_token() {
                        tracing::warn!(expected = %expected, "Adopting the sequence token expected by the service");
                        self.token = Some(expected.clone());
                    }
                    return Err(DestinationError::LogAppend {
                        locator: self.destination.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    async fn flush_and_report(
        &mut self,
        batch: &mut LogBatch,
        reason: FlushReason,
        errors: &ErrorReporter,
    ) {
        if let Err(err) = self.flush(batch, reason).await {
            errors.report(err);
        }
    }
}

async fn run_worker(
    ctx: WorkerContext,
    mut flusher: Flusher,
    flush_interval: Duration,
    buffer_lines: usize,
) {
    let WorkerContext {
        pipe,
        cancel,
        errors,
        locator,
    } = ctx;
    tracing::debug!("Start log writer");

    // Rendezvous queue: the splitter runs at most one line ahead of the batcher.
    let (line_tx, mut lines) = mpsc::channel::<LogEvent>(1);
    let span = tracing::debug_span!("line_splitter");
    let splitter = tokio::spawn(
        split_lines(pipe, line_tx, errors.clone(), Arc::clone(&locator)).instrument(span),
    );

    let mut batch = LogBatch::new(buffer_lines);
    let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut lines_open = true;

    loop {
        tokio::select! {
            line = lines.recv(), if lines_open => match line {
                Some(event) => {
                    if batch.push(event) {
                        flusher.flush_and_report(&mut batch, FlushReason::BufferFull, &errors).await;
                    }
                }
                None => lines_open = false,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flusher.flush_and_report(&mut batch, FlushReason::Interval, &errors).await;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    tracing::debug!(buffered = batch.len(), "Draining log writer");
    while let Some(event) = lines.recv().await {
        batch.push(event);
    }
    if let Err(join_err) = splitter.await {
        errors.report(DestinationError::WorkerPanicked {
            locator: locator.to_string(),
            message: join_err.to_string(),
        });
    }
    if !batch.is_empty() {
        flusher.flush_and_report(&mut batch, FlushReason::Close, &errors).await;
    }
    tracing::debug!("End log writer");
}

/// Scan `pipe` into non-empty records until end-of-stream. A line longer than
/// one event allows becomes several consecutive records.
async fn split_lines(
    mut pipe: PipeReader,
    lines: mpsc::Sender<LogEvent>,
    errors: ErrorReporter,
    locator: Arc<str>,
) {
    // Starts with the incomplete tail of a character cut at the size cap, if any.
    let mut buf = Vec::new();
    loop {
        let limit = MAX_EVENT_MESSAGE_BYTES.saturating_sub(buf.len()) as u64;
        let read = (&mut pipe).take(limit).read_until(b'\n', &mut buf).await;
        let (record, carry) = match read {
            Ok(0) if buf.is_empty() => break,
            Ok(_) if buf.ends_with(b"\n") || buf.len() < MAX_EVENT_MESSAGE_BYTES => {
                (trim_line_ending(&buf), Vec::new())
            }
            Ok(_) => {
                let cut = buf.len() - incomplete_tail(&buf);
                let (head, tail) = buf.split_at(cut);
                (head, tail.to_vec())
            }
            Err(source) => {
                errors.report(DestinationError::Scan {
                    locator: locator.to_string(),
                    source,
                });
                break;
            }
        };

        if !record.is_empty() {
            for message in split_message(String::from_utf8_lossy(record).into_owned()) {
                if lines.send(LogEvent::now(message)).await.is_err() {
                    tracing::debug!("Batching loop is gone, stop scanning");
                    return;
                }
            }
        }
        buf = carry;
    }
}

/// Number of bytes at the end of `bytes` that start a character but do not
/// complete it.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Cut `message` at character boundaries into pieces that each fit one event.
/// Only lossy replacement of invalid bytes can push a record over the cap.
fn split_message(mut message: String) -> Vec<String> {
    let mut pieces = Vec::new();
    while message.len() > MAX_EVENT_MESSAGE_BYTES {
        let mut cut = MAX_EVENT_MESSAGE_BYTES;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        let rest = message.split_off(cut);
        pieces.push(message);
        message = rest;
    }
    pieces.push(message);
    pieces
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_service::MAX_EVENT_BYTES;
    use crate::log_service::memory::MemoryLogService;
    use crate::writer::error::ErrorClass;
    use tokio::time::timeout;

    const GROUP: &str = "/g";

    fn settings(buffer_lines: usize, flush_interval: Duration) -> CloudwatchSettings {
        CloudwatchSettings {
            log_group: GROUP.to_string(),
            flush_interval,
            buffer_lines,
            create_log_group: false,
        }
    }

    fn messages(events: &[LogEvent]) -> Vec<&str> {
        events.iter().map(|e| e.message.as_str()).collect()
    }

    async fn wait_for_calls(service: &MemoryLogService, count: usize) {
        timeout(Duration::from_secs(5), service.wait_for_put_calls(count))
            .await
            .expect("timed out waiting for put_log_events");
    }

    #[test]
    fn line_endings_are_stripped() {
        assert_eq!(trim_line_ending(b"a\r\n"), b"a");
        assert_eq!(trim_line_ending(b"a\n"), b"a");
        assert_eq!(trim_line_ending(b"a"), b"a");
        assert_eq!(trim_line_ending(b"\n"), b"");
    }

    #[test]
    fn cut_characters_are_detected_at_the_end() {
        let e_acute = "\u{e9}".as_bytes();
        let snowman = "\u{2603}".as_bytes();
        assert_eq!(incomplete_tail(b"abc"), 0);
        assert_eq!(incomplete_tail(&[b'a', e_acute[0]]), 1);
        assert_eq!(incomplete_tail(&[b'a', e_acute[0], e_acute[1]]), 0);
        assert_eq!(incomplete_tail(&[b'a', snowman[0], snowman[1]]), 2);
        assert_eq!(incomplete_tail(&[]), 0);
    }

    #[test]
    fn long_messages_are_cut_at_character_boundaries() {
        let message = format!("{}\u{e9}tail", "a".repeat(MAX_EVENT_MESSAGE_BYTES - 1));
        let pieces = split_message(message);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].len(), MAX_EVENT_MESSAGE_BYTES - 1);
        assert_eq!(pieces[1], "\u{e9}tail");
        assert_eq!(split_message("short".to_string()), ["short"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn line_over_the_event_cap_becomes_several_events() {
        let service = Arc::new(MemoryLogService::new().with_group(GROUP));
        let mut writer = LogWriter::new(
            service.clone(),
            &settings(50, Duration::from_secs(3600)),
            "out",
        )
        .await
        .unwrap();

        let line: String = (0..3 * MAX_EVENT_MESSAGE_BYTES + 10)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        for chunk in line.as_bytes().chunks(32 * 1024) {
            writer.write(chunk).await.unwrap();
        }
        writer.write(b"\nnext\n").await.unwrap();
        writer.close().await.unwrap();

        let events = service.events(GROUP, "out");
        let sizes: Vec<usize> = events.iter().map(|e| e.message.len()).collect();
        assert_eq!(
            sizes,
            [MAX_EVENT_MESSAGE_BYTES, MAX_EVENT_MESSAGE_BYTES, MAX_EVENT_MESSAGE_BYTES, 10, 4]
        );
        let rejoined: String = events[..4].iter().map(|e| e.message.as_str()).collect();
        assert_eq!(rejoined, line);
        assert_eq!(events[4].message, "next");
        assert!(
            service
                .put_calls()
                .iter()
                .all(|call| call.events.iter().all(|e| e.encoded_size() <= MAX_EVENT_BYTES))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn character_on_the_cap_stays_whole() {
        let service = Arc::new(MemoryLogService::new().with_group(GROUP));
        let mut writer = LogWriter::new(
            service.clone(),
            &settings(50, Duration::from_secs(3600)),
            "out",
        )
        .await
        .unwrap();

        let line = format!("{}\u{e9}\n", "a".repeat(MAX_EVENT_MESSAGE_BYTES - 1));
        writer.write(line.as_bytes()).await.unwrap();
        writer.close().await.unwrap();

        let events = service.events(GROUP, "out");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "a".repeat(MAX_EVENT_MESSAGE_BYTES - 1));
        assert_eq!(events[1].message, "\u{e9}");
    }

    #[tokio::test]
    async fn missing_group_fails_unless_creation_is_enabled() {
        let service = MemoryLogService::new();
        let destination = LogDestination {
            group: GROUP.to_string(),
            stream: "out".to_string(),
        };

        let err = prepare_log_stream(&service, &destination, false)
            .await
            .unwrap_err();
        assert!(err.is_log_group_not_found());
        assert!(!service.has_group(GROUP));

        let token = prepare_log_stream(&service, &destination, true).await.unwrap();
        assert_eq!(token, None);
        assert!(service.has_stream(GROUP, "out"));
        assert_eq!(
            service.group_tags(GROUP),
            vec![("GeneratedBy".to_string(), "cloudtee".to_string())]
        );
    }

    #[tokio::test]
    async fn existing_stream_token_is_recovered() {
        let service = MemoryLogService::new()
            .with_stream(GROUP, "out-archive", Some("other"))
            .with_stream(GROUP, "out", Some("seed"));
        let destination = LogDestination {
            group: GROUP.to_string(),
            stream: "out".to_string(),
        };

        let token = prepare_log_stream(&service, &destination, false).await.unwrap();
        assert_eq!(token, Some(SequenceToken::from("seed")));
    }

    #[tokio::test]
    async fn construction_error_names_the_destination() {
        let service = Arc::new(MemoryLogService::new());
        let err = LogWriter::new(service, &settings(50, Duration::from_secs(5)), "out.log")
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Construction);
        assert!(err.to_string().contains("LogGroup=/g, LogStream=out"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_buffer_flushes_exactly_once_in_order() {
        let service = Arc::new(MemoryLogService::new().with_group(GROUP));
        let mut writer = LogWriter::new(
            service.clone(),
            &settings(3, Duration::from_secs(3600)),
            "out.log",
        )
        .await
        .unwrap();
        assert_eq!(writer.to_string(), "LogGroup=/g, LogStream=out");

        writer.write(b"one\ntwo\n\nthree\n").await.unwrap();
        wait_for_calls(&service, 1).await;

        let calls = service.put_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(messages(&calls[0].events), ["one", "two", "three"]);
        assert_eq!(calls[0].sequence_token, None);

        writer.close().await.unwrap();
        assert_eq!(service.put_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_buffer_waits_for_the_interval() {
        let service = Arc::new(MemoryLogService::new().with_group(GROUP));
        let mut writer = LogWriter::new(service.clone(), &settings(3, Duration::from_secs(5)), "out")
            .await
            .unwrap();

        writer.write(b"a\nb\n").await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(service.put_calls().is_empty());

        service.wait_for_put_calls(1).await;
        let calls = service.put_calls();
        assert_eq!(messages(&calls[0].events), ["a", "b"]);

        writer.close().await.unwrap();
        assert_eq!(service.put_calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tokens_are_threaded_between_flushes() {
        let service = Arc::new(MemoryLogService::new().with_stream(GROUP, "out", Some("seed")));
        let mut writer = LogWriter::new(
            service.clone(),
            &settings(2, Duration::from_secs(3600)),
            "out",
        )
        .await
        .unwrap();

        writer.write(b"a\nb\n").await.unwrap();
        wait_for_calls(&service, 1).await;
        writer.write(b"c\nd\n").await.unwrap();
        wait_for_calls(&service, 2).await;
        writer.close().await.unwrap();

        let calls = service.put_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].sequence_token, Some(SequenceToken::from("seed")));
        assert_eq!(calls[1].sequence_token, calls[0].returned_token);
        assert_eq!(messages(&service.events(GROUP, "out")), ["a", "b", "c", "d"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_drains_a_trailing_partial_line() {
        let service = Arc::new(MemoryLogService::new().with_group(GROUP));
        let mut writer = LogWriter::new(
            service.clone(),
            &settings(50, Duration::from_secs(3600)),
            "out",
        )
        .await
        .unwrap();

        writer.write(b"first\r\nsecond").await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        let calls = service.put_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(messages(&calls[0].events), ["first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_flush_keeps_events_for_the_drain() {
        let service = Arc::new(MemoryLogService::new().with_group(GROUP));
        service.fail_next_put(LogServiceError::Service {
            operation: "PutLogEvents",
            message: "throttled".to_string(),
        });
        let mut writer = LogWriter::new(
            service.clone(),
            &settings(2, Duration::from_secs(3600)),
            "out",
        )
        .await
        .unwrap();

        let written = writer.write(b"a\nb\n").await;
        wait_for_calls(&service, 1).await;
        let closed = writer.close().await;

        let err = written.err().or(closed.err()).expect("failure must surface");
        assert_eq!(err.class(), ErrorClass::Transfer);

        let calls = service.put_calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].accepted);
        assert!(calls[1].accepted);
        assert_eq!(calls[1].sequence_token, None);
        assert_eq!(messages(&service.events(GROUP, "out")), ["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_token_is_replaced_by_the_expected_one() {
        let service = Arc::new(MemoryLogService::new().with_stream(GROUP, "out", Some("seed")));
        let mut writer = LogWriter::new(
            service.clone(),
            &settings(2, Duration::from_secs(3600)),
            "out",
        )
        .await
        .unwrap();

        // Another producer appends and moves the token on.
        service
            .put_log_events(
                GROUP,
                "out",
                &[LogEvent::new("other", 1)],
                Some(&SequenceToken::from("seed")),
            )
            .await
            .unwrap();

        let written = writer.write(b"a\nb\n").await;
        wait_for_calls(&service, 2).await;
        let closed = writer.close().await;

        let err = written.err().or(closed.err()).expect("stale token must surface");
        assert_eq!(err.class(), ErrorClass::Protocol);

        let calls = service.put_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].sequence_token, calls[0].returned_token);
        assert_eq!(messages(&service.events(GROUP, "out")), ["other", "a", "b"]);
    }
}
