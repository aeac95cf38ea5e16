//! Text-frame transports: newline-delimited JSON over TCP and WebSocket text
//! messages. Both end up as the same `(Inbound, Outbound)` pair, so the
//! connection handler never knows which one it is talking to.

use std::future::ready;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::sink::Sink;
use futures_util::stream::{BoxStream, StreamExt};
use futures_util::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite};

/// Decoded text frames from the peer.
pub type Inbound = BoxStream<'static, Result<String, TransportError>>;

/// Text frames to the peer. Frames are shared with other recipients, hence
/// `Arc<str>`.
pub type Outbound = Pin<Box<dyn Sink<Arc<str>, Error = TransportError> + Send>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl TransportError {
    fn from_delimited(e: AnyDelimiterCodecError, max: usize) -> Self {
        match e {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => TransportError::FrameTooLarge { max },
            AnyDelimiterCodecError::Io(io) => TransportError::Io(io),
        }
    }

    fn from_websocket(e: tungstenite::Error, max: usize) -> Self {
        match e {
            tungstenite::Error::Capacity(_) => TransportError::FrameTooLarge { max },
            other => TransportError::WebSocket(other),
        }
    }
}

fn newline_codec(max_frame_len: usize) -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_frame_len)
}

/// Newline-delimited frames over a raw TCP stream. A frame is only yielded
/// once its newline (or EOF) has arrived. Bytes that are not UTF-8 are
/// replaced rather than failing the stream, so the protocol layer rejects
/// the frame like any other malformed one. Lines longer than `max_frame_len`
/// fail the stream with [`TransportError::FrameTooLarge`].
pub fn tcp_lines(stream: TcpStream, max_frame_len: usize) -> (Inbound, Outbound) {
    let (read, write) = stream.into_split();

    let inbound = FramedRead::new(read, newline_codec(max_frame_len))
        .map(move |chunk| match chunk {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes)
                .trim_end_matches('\r')
                .to_owned()),
            Err(e) => Err(TransportError::from_delimited(e, max_frame_len)),
        })
        .boxed();

    let writer = FramedWrite::new(write, newline_codec(usize::MAX));
    let outbound = SinkExt::<Arc<str>>::sink_map_err(writer, |e| {
        TransportError::from_delimited(e, usize::MAX)
    });

    (inbound, Box::pin(outbound))
}

/// Complete the WebSocket upgrade on `stream`, then carry frames as text
/// messages. Binary messages are passed on as lossy UTF-8 and rejected by
/// the decoder; control frames are handled by tungstenite.
pub async fn websocket(
    stream: TcpStream,
    max_frame_len: usize,
) -> Result<(Inbound, Outbound), TransportError> {
    let config = WebSocketConfig::default()
        .max_message_size(Some(max_frame_len))
        .max_frame_size(Some(max_frame_len));
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(config)).await?;
    let (sink, source) = ws.split();

    let inbound = source
        .take_while(|msg| ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(move |msg| {
            ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(_) => None,
                Err(tungstenite::Error::ConnectionClosed) => None,
                Err(e) => Some(Err(TransportError::from_websocket(e, max_frame_len))),
            })
        })
        .boxed();

    let outbound = sink
        .sink_map_err(TransportError::WebSocket)
        .with(|text: Arc<str>| ready(Ok::<_, TransportError>(Message::text(&*text))));

    Ok((inbound, Box::pin(outbound)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::Duration;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_tcp_lines_round_trip() {
        let (server, client) = pair().await;
        let (mut inbound, mut outbound) = tcp_lines(server, 1024);
        let (read, mut write) = client.into_split();

        write.write_all(b"{\"type\":\"clear\"}\n").await.unwrap();
        assert_eq!(
            inbound.next().await.unwrap().unwrap(),
            r#"{"type":"clear"}"#
        );

        outbound.send(Arc::from("hello")).await.unwrap();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_tcp_lines_rejects_long_frames() {
        let (server, client) = pair().await;
        let (mut inbound, _outbound) = tcp_lines(server, 16);
        let (_read, mut write) = client.into_split();

        write.write_all(&[b'x'; 64]).await.unwrap();
        write.write_all(b"\n").await.unwrap();
        match inbound.next().await {
            Some(Err(TransportError::FrameTooLarge { max })) => assert_eq!(max, 16),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_lines_replaces_invalid_utf8() {
        let (server, client) = pair().await;
        let (mut inbound, _outbound) = tcp_lines(server, 1024);
        let (_read, mut write) = client.into_split();

        write.write_all(b"\xff\xfe\n{\"type\":\"clear\"}\r\n").await.unwrap();
        assert_eq!(inbound.next().await.unwrap().unwrap(), "\u{fffd}\u{fffd}");
        // The stream keeps going after the bad line.
        assert_eq!(
            inbound.next().await.unwrap().unwrap(),
            r#"{"type":"clear"}"#
        );
    }

    #[tokio::test]
    async fn test_tcp_lines_waits_for_complete_frame() {
        let (server, client) = pair().await;
        let (mut inbound, _outbound) = tcp_lines(server, 1024);
        let (_read, mut write) = client.into_split();

        write.write_all(br#"{"type":"cl"#).await.unwrap();
        let early = tokio::time::timeout(Duration::from_millis(50), inbound.next()).await;
        assert!(early.is_err(), "partial frame was yielded");

        write.write_all(b"ear\"}\n").await.unwrap();
        assert_eq!(
            inbound.next().await.unwrap().unwrap(),
            r#"{"type":"clear"}"#
        );
    }

    #[tokio::test]
    async fn test_tcp_lines_ends_on_close() {
        let (server, client) = pair().await;
        let (mut inbound, _outbound) = tcp_lines(server, 1024);
        drop(client);
        assert!(inbound.next().await.is_none());
    }
}
