// probe: a bare raw-stream protocol client.
//
// Speaks frames and heartbeat literals directly with no correlation table,
// liveness, or reconnect logic, so tests can observe a server's exact wire
// behavior (flood cuts, forced closes, out-of-order responses).

use std::collections::VecDeque;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use ut_protocol::codec::{FrameDecoder, encode_frame};
use ut_protocol::{PING, PONG, UtRequest, UtResponse};

/// One observation from the server.
#[derive(Debug)]
pub enum ProbeEvent {
    Pong,
    Response(UtResponse),
    /// EOF: the server closed the connection.
    Eof,
}

pub struct RawProbe {
    stream: TcpStream,
    decoder: FrameDecoder,
    queued: VecDeque<UtResponse>,
}

impl RawProbe {
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        Ok(RawProbe {
            stream: TcpStream::connect(addr).await?,
            decoder: FrameDecoder::default(),
            queued: VecDeque::new(),
        })
    }

    pub async fn send_request(&mut self, request: &UtRequest) -> std::io::Result<()> {
        let body = serde_json::to_vec(request).expect("request serializes");
        let frame = encode_frame(request.kind(), request.id(), false, &body);
        self.stream.write_all(&frame).await
    }

    /// Write raw bytes; lets tests send malformed frames.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await
    }

    pub async fn send_ping(&mut self) -> std::io::Result<()> {
        self.stream.write_all(PING).await
    }

    /// Read until one event is available. Malformed inbound framing is
    /// reported as an error.
    pub async fn next_event(&mut self) -> std::io::Result<ProbeEvent> {
        let mut buf = [0_u8; 4096];
        loop {
            if let Some(response) = self.queued.pop_front() {
                return Ok(ProbeEvent::Response(response));
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(ProbeEvent::Eof);
            }
            if &buf[..n] == PONG {
                return Ok(ProbeEvent::Pong);
            }
            self.decoder.push(&buf[..n]);
            loop {
                match self.decoder.next_frame() {
                    Ok(Some(frame)) => {
                        let response: UtResponse = serde_json::from_slice(&frame.payload)
                            .map_err(std::io::Error::other)?;
                        self.queued.push_back(response);
                    }
                    Ok(None) => break,
                    Err(err) => return Err(std::io::Error::other(err.to_string())),
                }
            }
        }
    }

    /// Read events until a response for `id` arrives; other responses are
    /// kept aside in arrival order.
    pub async fn response_for(&mut self, id: u64) -> std::io::Result<UtResponse> {
        let mut seen = Vec::new();
        loop {
            match self.next_event().await? {
                ProbeEvent::Response(response) if response.id == id => {
                    // Preserve anything read past while hunting for `id`.
                    for resp in seen.into_iter().rev() {
                        self.queued.push_front(resp);
                    }
                    return Ok(response);
                }
                ProbeEvent::Response(other) => seen.push(other),
                ProbeEvent::Pong => {}
                ProbeEvent::Eof => {
                    return Err(std::io::Error::other("eof while waiting for response"));
                }
            }
        }
    }
}
