use crate::error::{Result, TenaxError};
use crate::protocol::TrackerMessage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a tracker frame. Peer tables are tiny; anything larger is
/// a corrupt stream.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Encode a message into a framed buffer: `[len: u32 LE][rkyv payload]`.
fn encode_message(msg: &TrackerMessage) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| TenaxError::EncodeFailed(e.to_string()))?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn decode_message(bytes: &[u8]) -> Result<TrackerMessage> {
    rkyv::from_bytes::<TrackerMessage, rkyv::rancor::Error>(bytes)
        .map_err(|e| TenaxError::DecodeFailed(e.to_string()))
}

/// Write a `[len: u32 LE][rkyv payload]` frame.
pub(crate) async fn send_frame(stream: &mut TcpStream, msg: &TrackerMessage) -> Result<()> {
    let buf = encode_message(msg)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one `[len: u32 LE][rkyv payload]` frame.
pub(crate) async fn recv_frame(stream: &mut TcpStream) -> Result<TrackerMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TenaxError::DecodeFailed(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    decode_message(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let msg = TrackerMessage::Assign {
            rank: 2,
            world_size: 4,
            epoch: 9,
            peers: vec![(0, "127.0.0.1:1".into()), (2, "127.0.0.1:2".into())],
        };
        let sent = msg.clone();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            recv_frame(&mut stream).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        send_frame(&mut client, &msg).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_message(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
