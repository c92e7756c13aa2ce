use futures_util::{Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::ChatError;
use crate::event::{DATA_PREFIX, EventError, EventKind, StreamEvent};

/// Receives live progress while a reply streams in.
pub trait StreamObserver {
    /// Called with the whole answer accumulated so far, after every fragment.
    fn on_answer(&mut self, _answer: &str) {}
    /// Called when a conversation id is first seen, or replaced at stream end.
    fn on_conversation_id(&mut self, _conversation_id: &str) {}
}

impl StreamObserver for () {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub answer: String,
    /// Last message id seen, empty when the service sent none.
    pub message_id: String,
    pub conversation_id: Option<String>,
}

/// Incremental decoder for a blank-line-delimited event stream.
///
/// Bytes are buffered until a full event has arrived, so the result does not
/// depend on where the transport split the chunks. Malformed events are
/// logged and skipped.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no delimiter.
    scanned: usize,
    reply: ChatReply,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self) -> &str {
        &self.reply.answer
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.reply.conversation_id.as_deref()
    }

    pub fn feed<O: StreamObserver + ?Sized>(&mut self, chunk: &[u8], observer: &mut O) {
        self.pending
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        // Back up one byte: the delimiter may straddle two chunks.
        let mut from = self.scanned.saturating_sub(1);
        while let Some(end) = find_delimiter(&self.pending, from) {
            let event: Vec<u8> = self.pending.drain(..end + 2).collect();
            self.handle_raw(&event[..end], observer);
            from = 0;
        }
        self.scanned = self.pending.len();
    }

    /// Processes whatever is still buffered as a final event.
    pub fn finish<O: StreamObserver + ?Sized>(mut self, observer: &mut O) -> ChatReply {
        let rest = std::mem::take(&mut self.pending);
        if !rest.iter().all(u8::is_ascii_whitespace) {
            self.handle_raw(&rest, observer);
        }
        self.reply
    }

    fn handle_raw<O: StreamObserver + ?Sized>(&mut self, raw: &[u8], observer: &mut O) {
        let text = String::from_utf8_lossy(raw);
        let Some(payload) = text.trim_start_matches('\n').strip_prefix(DATA_PREFIX) else {
            trace!("skipping non-data event");
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }
        match StreamEvent::parse(payload) {
            Ok(event) => self.apply(event, observer),
            Err(EventError::NotAnObject) => {
                warn!(payload, "skipping event that is not a JSON object");
            }
            Err(err) => {
                warn!(error = %err, payload, "skipping malformed event");
            }
        }
    }

    fn apply<O: StreamObserver + ?Sized>(&mut self, event: StreamEvent, observer: &mut O) {
        match event.kind {
            EventKind::Message => {
                if let Some(id) = event.conversation_id
                    && self.reply.conversation_id.is_none()
                {
                    observer.on_conversation_id(&id);
                    self.reply.conversation_id = Some(id);
                }
                if let Some(fragment) = event.answer {
                    self.reply.answer.push_str(&fragment);
                }
                observer.on_answer(&self.reply.answer);
                if let Some(message_id) = event.message_id {
                    self.reply.message_id = message_id;
                }
            }
            EventKind::MessageEnd => {
                if let Some(id) = event.conversation_id
                    && self.reply.conversation_id.as_deref() != Some(id.as_str())
                {
                    debug!(conversation_id = %id, "conversation id updated at stream end");
                    observer.on_conversation_id(&id);
                    self.reply.conversation_id = Some(id);
                }
            }
            EventKind::Other(kind) => {
                trace!(kind, "ignoring event");
            }
        }
    }
}

fn find_delimiter(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| from + i)
}

/// Drains a byte stream through a [`StreamDecoder`] until the source ends.
///
/// Only a failure to read from the source ends the loop early; bad events
/// never do. There is no internal timeout.
pub async fn decode_stream<S, B, E, O>(stream: S, observer: &mut O) -> Result<ChatReply, ChatError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
    O: StreamObserver + ?Sized,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = StreamDecoder::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ChatError::Body(Box::new(e)))?;
        decoder.feed(chunk.as_ref(), observer);
    }
    Ok(decoder.finish(observer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[derive(Default)]
    struct Recorder {
        answers: Vec<String>,
        conversation_ids: Vec<String>,
    }

    impl StreamObserver for Recorder {
        fn on_answer(&mut self, answer: &str) {
            self.answers.push(answer.to_string());
        }

        fn on_conversation_id(&mut self, conversation_id: &str) {
            self.conversation_ids.push(conversation_id.to_string());
        }
    }

    const HELLO: &str = concat!(
        "data: {\"event\":\"message\",\"answer\":\"Hel\"}\n\n",
        "data: {\"event\":\"message\",\"answer\":\"lo\"}\n\n",
        "data: {\"event\":\"message_end\",\"conversation_id\":\"c1\"}\n\n",
    );

    fn decode_chunks(chunks: &[&[u8]]) -> (ChatReply, Recorder) {
        let mut recorder = Recorder::default();
        let mut decoder = StreamDecoder::new();
        for chunk in chunks {
            decoder.feed(chunk, &mut recorder);
        }
        (decoder.finish(&mut recorder), recorder)
    }

    #[test]
    fn accumulates_answer_and_captures_id_at_end() {
        let (reply, recorder) = decode_chunks(&[HELLO.as_bytes()]);
        assert_eq!(reply.answer, "Hello");
        assert_eq!(reply.conversation_id.as_deref(), Some("c1"));
        assert_eq!(recorder.answers, ["Hel", "Hello"]);
        assert_eq!(recorder.conversation_ids, ["c1"]);
    }

    #[test]
    fn result_is_independent_of_chunking() {
        let raw = concat!(
            "data: {\"event\":\"message\",\"answer\":\"Grüße \",\"conversation_id\":\"c9\",\"message_id\":\"m1\"}\n\n",
            "data: {\"event\":\"ping\"}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"aus 東京\",\"message_id\":\"m2\"}\r\n\r\n",
            "data: {\"event\":\"message_end\",\"conversation_id\":\"c9\"}\n\n",
        )
        .as_bytes();
        let (whole, _) = decode_chunks(&[raw]);
        assert_eq!(whole.answer, "Grüße aus 東京");
        assert_eq!(whole.message_id, "m2");
        assert_eq!(whole.conversation_id.as_deref(), Some("c9"));

        for size in 1..=17 {
            let chunks: Vec<&[u8]> = raw.chunks(size).collect();
            let (reply, _) = decode_chunks(&chunks);
            assert_eq!(reply, whole, "chunk size {size}");
        }
        for split in 0..raw.len() {
            let (head, tail) = raw.split_at(split);
            let (reply, _) = decode_chunks(&[head, tail]);
            assert_eq!(reply, whole, "split at {split}");
        }
    }

    #[test]
    fn first_conversation_id_wins_until_stream_end() {
        let (reply, recorder) = decode_chunks(&[concat!(
            "data: {\"event\":\"message\",\"answer\":\"a\",\"conversation_id\":\"first\"}\n\n",
            "data: {\"event\":\"message\",\"answer\":\"b\",\"conversation_id\":\"second\"}\n\n",
            "data: {\"event\":\"message_end\",\"conversation_id\":\"final\"}\n\n",
        )
        .as_bytes()]);
        assert_eq!(reply.answer, "ab");
        assert_eq!(reply.conversation_id.as_deref(), Some("final"));
        assert_eq!(recorder.conversation_ids, ["first", "final"]);
    }

    #[test]
    fn message_end_with_same_id_does_not_renotify() {
        let (_, recorder) = decode_chunks(&[concat!(
            "data: {\"event\":\"message\",\"answer\":\"a\",\"conversation_id\":\"c1\"}\n\n",
            "data: {\"event\":\"message_end\",\"conversation_id\":\"c1\"}\n\n",
        )
        .as_bytes()]);
        assert_eq!(recorder.conversation_ids, ["c1"]);
    }

    #[test]
    fn malformed_events_are_skipped() {
        let (reply, recorder) = decode_chunks(&[concat!(
            "data: {\"event\":\"message\",\"answer\":\"one \"}\n\n",
            "data: {not: valid, json\n\n",
            "data: {event: \"message\", answer: \"two \"}\n\n",
            "data: {\"event\":\"message\",\"answer\":\n\n",
            "data:\n\n",
            "event: ping\n\n",
            ": keep-alive comment\n\n",
            "data: {\"event\":\"message\",\"answer\":\"three\"}\n\n",
        )
        .as_bytes()]);
        assert_eq!(reply.answer, "one two three");
        assert_eq!(recorder.answers.len(), 3);
    }

    #[test]
    fn message_without_answer_still_reports_progress() {
        let (reply, recorder) = decode_chunks(&[
            &b"data: {\"event\":\"message\",\"message_id\":\"m1\"}\n\n"[..],
        ]);
        assert_eq!(reply.answer, "");
        assert_eq!(reply.message_id, "m1");
        assert_eq!(recorder.answers, [""]);
    }

    #[test]
    fn trailing_event_without_delimiter_is_processed() {
        let (reply, _) = decode_chunks(&[
            &b"data: {\"event\":\"message\",\"answer\":\"x\"}\n\n"[..],
            &b"data: {\"event\":\"message_end\",\"conversation_id\":\"tail\"}"[..],
        ]);
        assert_eq!(reply.conversation_id.as_deref(), Some("tail"));
    }

    #[test]
    fn partial_event_is_not_rescanned() {
        let mut decoder = StreamDecoder::new();
        let answer = "x".repeat(4096);
        let raw = format!("data: {{\"event\":\"message\",\"answer\":\"{answer}\"}}\n\n");
        let (body, end) = raw.as_bytes().split_at(raw.len() - 2);
        for byte in body.chunks(1) {
            decoder.feed(byte, &mut ());
            assert_eq!(decoder.scanned, decoder.pending.len());
        }
        decoder.feed(&end[..1], &mut ());
        assert_eq!(decoder.answer(), "");
        decoder.feed(&end[1..], &mut ());
        assert_eq!(decoder.answer(), answer);
        assert!(decoder.pending.is_empty());
        assert_eq!(decoder.scanned, 0);
    }

    #[test]
    fn delimiter_search_starts_at_offset() {
        assert_eq!(find_delimiter(b"a\n\nb\n\n", 0), Some(1));
        assert_eq!(find_delimiter(b"a\n\nb\n\n", 2), Some(4));
        assert_eq!(find_delimiter(b"ab", 5), None);
    }

    #[test]
    fn empty_stream_yields_empty_reply() {
        let (reply, recorder) = decode_chunks(&[]);
        assert_eq!(reply, ChatReply::default());
        assert!(recorder.answers.is_empty());
    }

    #[tokio::test]
    async fn decode_stream_drains_source() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = HELLO
            .as_bytes()
            .chunks(5)
            .map(Ok)
            .collect();
        let mut recorder = Recorder::default();
        let reply = decode_stream(stream::iter(chunks), &mut recorder)
            .await
            .unwrap();
        assert_eq!(reply.answer, "Hello");
        assert_eq!(reply.conversation_id.as_deref(), Some("c1"));
        assert_eq!(recorder.answers.last().map(String::as_str), Some("Hello"));
    }

    #[tokio::test]
    async fn decode_stream_surfaces_read_errors() {
        let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
            Ok(&b"data: {\"event\":\"message\",\"answer\":\"partial\"}\n\n"[..]),
            Err(std::io::Error::other("connection reset")),
        ];
        let mut recorder = Recorder::default();
        let err = decode_stream(stream::iter(chunks), &mut recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Body(_)));
        assert_eq!(recorder.answers, ["partial"]);
    }
}
