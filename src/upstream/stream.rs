use crate::logging::{self, LogLevel};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// 上游读取任务与 HTTP 层之间的有界通道容量。
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// 单行上限：超过仍未见换行即视为上游异常。
pub const MAX_LINE_BYTES: usize = 1 << 20;

const DONE_SENTINEL: &str = "[DONE]";
const DATA_PREFIX: &str = "data: ";

/// 流式阶段向调用方交付的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// 原样转发的 `data: ` 负载。
    Chunk(String),
    /// 流开始后发生的失败；之后不再有任何事件。
    Error(StreamFailure),
}

/// 流开始后的传输层失败（连接中断、读超时等）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub message: String,
}

#[derive(Serialize)]
struct FailureBody<'a> {
    error: FailureInner<'a>,
}

#[derive(Serialize)]
struct FailureInner<'a> {
    message: &'a str,
    r#type: &'static str,
}

impl StreamFailure {
    /// `{"error":{"message":...,"type":"request_error"}}`
    pub fn payload(&self) -> String {
        let body = FailureBody {
            error: FailureInner {
                message: &self.message,
                r#type: "request_error",
            },
        };
        sonic_rs::to_string(&body).unwrap_or_default()
    }
}

/// 惰性、不可重放的事件序列。
pub type ChunkStream = ReceiverStream<StreamEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome<'a> {
    Data(&'a str),
    Done,
    Skip,
}

/// 解析一行 SSE：只转发 `data: ` 行（空负载照转），`[DONE]` 为终止哨兵。
pub fn classify_line(line: &str) -> LineOutcome<'_> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Skip;
    };
    if payload.trim() == DONE_SENTINEL {
        return LineOutcome::Done;
    }
    LineOutcome::Data(payload)
}

/// 跨网络分片拼接完整行。
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// 取出下一条完整行（不含换行符）。
    pub fn next_line(&mut self) -> Option<String> {
        let nl = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=nl).take(nl).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// 缓冲中尚未换行的部分是否已超过单行上限。
    pub fn is_overflowing(&self) -> bool {
        self.buf.len() > MAX_LINE_BYTES
    }

    /// 上游关闭时残留的未换行内容。
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// 读取任务的结束方式（用于日志）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    Completed { chunks: usize },
    Eof { chunks: usize },
    Failed { chunks: usize, message: String },
    Cancelled { chunks: usize },
}

/// 启动上游读取任务，返回供 HTTP 层消费的事件流。
pub fn spawn_reader(resp: reqwest::Response, log_level: LogLevel, identity: String) -> ChunkStream {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let started = std::time::Instant::now();

    tokio::spawn(async move {
        let raw = log_level.upstream_enabled() && log_level.raw_enabled();
        let outcome = pump(Box::pin(resp.bytes_stream()), &tx, |line| {
            if raw {
                logging::upstream_stream_line_raw(line.as_bytes());
            }
        })
        .await;

        match &outcome {
            PumpOutcome::Completed { chunks } => {
                tracing::info!(identity = %identity, chunks, "流式聊天请求完成");
            }
            PumpOutcome::Eof { chunks } => {
                tracing::warn!(identity = %identity, chunks, "上游流未发送 [DONE] 即关闭");
            }
            PumpOutcome::Failed { chunks, message } => {
                tracing::error!(identity = %identity, chunks, error = %message, "上游流读取失败");
            }
            PumpOutcome::Cancelled { chunks } => {
                tracing::info!(identity = %identity, chunks, "客户端已断开，停止读取上游流");
            }
        }

        if log_level.client_enabled() {
            let (chunks, error) = match &outcome {
                PumpOutcome::Completed { chunks }
                | PumpOutcome::Eof { chunks }
                | PumpOutcome::Cancelled { chunks } => (*chunks, None),
                PumpOutcome::Failed { chunks, message } => (*chunks, Some(message.as_str())),
            };
            logging::client_stream_response(200, started.elapsed(), chunks, error);
        }
        // resp 在此处随任务结束被释放，上游连接随之归还/关闭。
    });

    ReceiverStream::new(rx)
}

/// 把上游字节流逐行转成事件写入通道。
///
/// 接收端关闭后立即返回；传输错误只下发一次 `StreamEvent::Error`。
pub async fn pump<S, B, E, L>(
    mut upstream: S,
    tx: &mpsc::Sender<StreamEvent>,
    mut on_line: L,
) -> PumpOutcome
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    L: FnMut(&str),
{
    let mut lines = LineBuffer::default();
    let mut chunks = 0usize;

    loop {
        let item = tokio::select! {
            biased;
            _ = tx.closed() => return PumpOutcome::Cancelled { chunks },
            item = upstream.next() => item,
        };

        let bytes = match item {
            Some(Ok(b)) => b,
            Some(Err(e)) => return fail(tx, e.to_string(), chunks).await,
            None => break,
        };

        lines.push(bytes.as_ref());
        while let Some(line) = lines.next_line() {
            on_line(&line);
            match classify_line(&line) {
                LineOutcome::Skip => {}
                LineOutcome::Done => return PumpOutcome::Completed { chunks },
                LineOutcome::Data(payload) => {
                    if tx.send(StreamEvent::Chunk(payload.to_string())).await.is_err() {
                        return PumpOutcome::Cancelled { chunks };
                    }
                    chunks += 1;
                }
            }
        }

        if lines.is_overflowing() {
            let message = format!("upstream line exceeds {MAX_LINE_BYTES} bytes");
            return fail(tx, message, chunks).await;
        }
    }

    // 上游关闭：处理最后一行未换行的残留。
    if let Some(line) = lines.take_rest() {
        on_line(&line);
        match classify_line(&line) {
            LineOutcome::Done => return PumpOutcome::Completed { chunks },
            LineOutcome::Data(payload) => {
                if tx.send(StreamEvent::Chunk(payload.to_string())).await.is_err() {
                    return PumpOutcome::Cancelled { chunks };
                }
                chunks += 1;
            }
            LineOutcome::Skip => {}
        }
    }
    PumpOutcome::Eof { chunks }
}

/// 下发唯一一条终止错误事件。
async fn fail(tx: &mpsc::Sender<StreamEvent>, message: String, chunks: usize) -> PumpOutcome {
    let failure = StreamFailure {
        message: message.clone(),
    };
    // 接收端可能已关闭，发送失败无需处理。
    let _ = tx.send(StreamEvent::Error(failure)).await;
    PumpOutcome::Failed { chunks, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn ok_parts(parts: &[&'static str]) -> Vec<Result<&'static [u8], std::io::Error>> {
        parts.iter().copied().map(|p| Ok(p.as_bytes())).collect()
    }

    #[test]
    fn classify_line_handles_prefix_and_sentinel() {
        assert_eq!(classify_line(r#"data: {"a":1}"#), LineOutcome::Data(r#"{"a":1}"#));
        assert_eq!(classify_line("data: {\"a\":1}\r"), LineOutcome::Data("{\"a\":1}"));
        assert_eq!(classify_line("data:{\"a\":1}"), LineOutcome::Skip);
        assert_eq!(classify_line("data: "), LineOutcome::Data(""));
        assert_eq!(classify_line("data: [DONE]"), LineOutcome::Done);
        assert_eq!(classify_line("data: [DONE] "), LineOutcome::Done);
        assert_eq!(classify_line(": keep-alive"), LineOutcome::Skip);
        assert_eq!(classify_line("event: ping"), LineOutcome::Skip);
        assert_eq!(classify_line(""), LineOutcome::Skip);
    }

    #[test]
    fn line_buffer_joins_partial_lines() {
        let mut lb = LineBuffer::default();
        lb.push(b"data: {\"a\"");
        assert_eq!(lb.next_line(), None);
        lb.push(b":1}\n\ndata: x");
        assert_eq!(lb.next_line().as_deref(), Some("data: {\"a\":1}"));
        assert_eq!(lb.next_line().as_deref(), Some(""));
        assert_eq!(lb.next_line(), None);
        assert_eq!(lb.take_rest().as_deref(), Some("data: x"));
        assert_eq!(lb.take_rest(), None);
    }

    #[tokio::test]
    async fn forwards_chunks_in_order_and_stops_at_done() {
        let (tx, rx) = mpsc::channel(16);
        let upstream = futures::stream::iter(ok_parts(&[
            "data: {\"a\":1}\n\n",
            "data: {\"b\"",
            ":2}\n\ndata: [DONE]\n\n",
            "data: {\"c\":3}\n\n",
        ]));

        let outcome = pump(upstream, &tx, |_| {}).await;
        assert_eq!(outcome, PumpOutcome::Completed { chunks: 2 });
        drop(tx);
        assert_eq!(
            drain(rx),
            vec![
                StreamEvent::Chunk(r#"{"a":1}"#.to_string()),
                StreamEvent::Chunk(r#"{"b":2}"#.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn transport_error_mid_stream_yields_one_terminal_event() {
        let (tx, rx) = mpsc::channel(16);
        let upstream = futures::stream::iter(vec![
            Ok(&b"data: {\"a\":1}\n\n"[..]),
            Err(std::io::Error::other("connection reset")),
            Ok(&b"data: {\"b\":2}\n\n"[..]),
        ]);

        let outcome = pump(upstream, &tx, |_| {}).await;
        assert!(matches!(outcome, PumpOutcome::Failed { chunks: 1, .. }));
        drop(tx);

        let events = drain(rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Chunk(r#"{"a":1}"#.to_string()));
        let StreamEvent::Error(failure) = &events[1] else {
            panic!("expected terminal error, got {:?}", events[1]);
        };
        assert_eq!(
            failure.payload(),
            r#"{"error":{"message":"connection reset","type":"request_error"}}"#
        );
    }

    #[tokio::test]
    async fn eof_without_sentinel_flushes_trailing_line() {
        let (tx, rx) = mpsc::channel(16);
        let upstream = futures::stream::iter(ok_parts(&["data: {\"a\":1}\n", "data: tail"]));
        let outcome = pump(upstream, &tx, |_| {}).await;
        assert_eq!(outcome, PumpOutcome::Eof { chunks: 2 });
        drop(tx);
        assert_eq!(
            drain(rx),
            vec![
                StreamEvent::Chunk(r#"{"a":1}"#.to_string()),
                StreamEvent::Chunk("tail".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_a_stalled_upstream() {
        let (tx, rx) = mpsc::channel(16);
        // 永不产出数据的上游：只能靠接收端关闭来结束。
        let upstream = futures::stream::pending::<Result<&'static [u8], std::io::Error>>();

        let task = tokio::spawn(async move { pump(upstream, &tx, |_| {}).await });
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("pump should stop promptly")
            .unwrap();
        assert_eq!(outcome, PumpOutcome::Cancelled { chunks: 0 });
    }

    #[tokio::test]
    async fn empty_data_payload_is_forwarded() {
        let (tx, rx) = mpsc::channel(16);
        let upstream = futures::stream::iter(ok_parts(&["data: \n\ndata: x\n", "data: [DONE]\n"]));
        let outcome = pump(upstream, &tx, |_| {}).await;
        assert_eq!(outcome, PumpOutcome::Completed { chunks: 2 });
        drop(tx);
        assert_eq!(
            drain(rx),
            vec![
                StreamEvent::Chunk(String::new()),
                StreamEvent::Chunk("x".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn line_without_newline_past_limit_fails_once() {
        let (tx, rx) = mpsc::channel(16);
        let mut huge = b"data: ".to_vec();
        huge.resize(MAX_LINE_BYTES + 1, b'a');
        let upstream = futures::stream::iter(vec![
            Ok::<Vec<u8>, std::io::Error>(b"data: 1\n".to_vec()),
            Ok(huge),
            Ok(b"\ndata: 2\n".to_vec()),
        ]);

        let outcome = pump(upstream, &tx, |_| {}).await;
        assert!(matches!(outcome, PumpOutcome::Failed { chunks: 1, .. }));
        drop(tx);

        let events = drain(rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Chunk("1".to_string()));
        let StreamEvent::Error(failure) = &events[1] else {
            panic!("expected terminal error, got {:?}", events[1]);
        };
        assert!(failure.message.contains("exceeds"));
    }

    #[test]
    fn failure_payload_escapes_message() {
        let failure = StreamFailure {
            message: "bad \"quote\"".to_string(),
        };
        let v: serde_json::Value = serde_json::from_str(&failure.payload()).unwrap();
        assert_eq!(v["error"]["message"], "bad \"quote\"");
        assert_eq!(v["error"]["type"], "request_error");
    }

    #[tokio::test]
    async fn raw_lines_are_observed() {
        let (tx, _rx) = mpsc::channel(16);
        let upstream = futures::stream::iter(ok_parts(&[": ping\ndata: 1\ndata: [DONE]\n"]));
        let mut seen = Vec::new();
        pump(upstream, &tx, |l| seen.push(l.to_string())).await;
        assert_eq!(seen, vec![": ping", "data: 1", "data: [DONE]"]);
    }
}
