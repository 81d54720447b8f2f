use crate::error::{Result, TenaxError};
use crate::types::Rank;
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest, Ready};
use tokio::net::TcpStream;

/// A connection to one neighbouring worker.
///
/// Each link carries two TCP streams: `data` for collective payloads,
/// message-passing words and recovery transfers, and `ctrl` for the reset
/// handshake. The per-operation `size_read`/`size_write` counters are reset
/// before every recovery transfer; `sent_total`/`recv_total` span the life
/// of the streams and let a drained receiver know when it has consumed every
/// byte the peer sent before a reset (the urgent-mark analogue).
pub(crate) struct Link {
    peer: Rank,
    data: TcpStream,
    ctrl: TcpStream,
    size_read: usize,
    size_write: usize,
    sent_total: u64,
    recv_total: u64,
    buffer: Vec<u8>,
    bad: bool,
}

impl Link {
    pub(crate) fn new(peer: Rank, data: TcpStream, ctrl: TcpStream) -> Self {
        Self {
            peer,
            data,
            ctrl,
            size_read: 0,
            size_write: 0,
            sent_total: 0,
            recv_total: 0,
            buffer: Vec::new(),
            bad: false,
        }
    }

    pub(crate) fn peer(&self) -> Rank {
        self.peer
    }

    pub(crate) fn size_read(&self) -> usize {
        self.size_read
    }

    pub(crate) fn size_write(&self) -> usize {
        self.size_write
    }

    pub(crate) fn sent_total(&self) -> u64 {
        self.sent_total
    }

    pub(crate) fn recv_total(&self) -> u64 {
        self.recv_total
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn bad_socket(&self) -> bool {
        self.bad
    }

    /// Mark the link unusable. The underlying sockets are actually closed
    /// when the link set is rebuilt and the streams drop.
    pub(crate) fn mark_bad(&mut self) {
        self.bad = true;
    }

    /// Allocate (or re-allocate) the pass-through ring buffer.
    pub(crate) fn init_buffer(&mut self, size: usize) {
        self.buffer.resize(size.max(1), 0);
    }

    /// Reset the per-operation counters. Lifetime totals are preserved.
    pub(crate) fn reset_size(&mut self) {
        self.size_read = 0;
        self.size_write = 0;
    }

    pub(crate) fn link_down_error(&self, reason: impl Into<String>) -> TenaxError {
        TenaxError::link_down(self.peer, reason)
    }

    // ── readiness ───────────────────────────────────────────────────

    pub(crate) async fn data_ready(&self, interest: Interest) -> std::io::Result<Ready> {
        self.data.ready(interest).await
    }

    pub(crate) async fn data_writable(&self) -> std::io::Result<()> {
        self.data.writable().await
    }

    pub(crate) async fn ctrl_readable(&self) -> std::io::Result<()> {
        self.ctrl.readable().await
    }

    pub(crate) async fn ctrl_writable(&self) -> std::io::Result<()> {
        self.ctrl.writable().await
    }

    // ── non-blocking counter-framed data ops ────────────────────────

    /// Read from the data stream into `buf[size_read..max]`, advancing
    /// `size_read`. Returns false when the link is beyond use.
    pub(crate) fn try_read_to_array(&mut self, buf: &mut [u8], max: usize) -> bool {
        if self.bad {
            return false;
        }
        if self.size_read >= max {
            return true;
        }
        match self.data.try_read(&mut buf[self.size_read..max]) {
            Ok(0) => {
                self.bad = true;
                false
            }
            Ok(n) => {
                self.size_read += n;
                self.recv_total += n as u64;
                true
            }
            Err(e) if would_block(&e) => true,
            Err(_) => {
                self.bad = true;
                false
            }
        }
    }

    /// Write `buf[size_write..max]` to the data stream, advancing
    /// `size_write`. Returns false when the link is beyond use.
    pub(crate) fn try_write_from_array(&mut self, buf: &[u8], max: usize) -> bool {
        if self.bad {
            return false;
        }
        if self.size_write >= max {
            return true;
        }
        match self.data.try_write(&buf[self.size_write..max]) {
            Ok(n) => {
                self.size_write += n;
                self.sent_total += n as u64;
                true
            }
            Err(e) if would_block(&e) => true,
            Err(_) => {
                self.bad = true;
                false
            }
        }
    }

    /// Read from the data stream into the ring buffer at offset
    /// `size_read % buffer_size`, never overwriting bytes past
    /// `protect_start` that a requester has not yet consumed, and never
    /// reading past `max_total` payload bytes.
    pub(crate) fn try_read_to_ring_buffer(&mut self, protect_start: usize, max_total: usize) -> bool {
        if self.bad {
            return false;
        }
        let bsz = self.buffer.len();
        debug_assert!(bsz > 0, "ring buffer not allocated");
        let ngap = self.size_read - protect_start;
        assert!(ngap <= bsz, "ring buffer boundary check");
        let offset = self.size_read % bsz;
        let nmax = (bsz - ngap)
            .min(bsz - offset)
            .min(max_total - self.size_read);
        if nmax == 0 {
            return true;
        }
        match self.data.try_read(&mut self.buffer[offset..offset + nmax]) {
            Ok(0) => {
                self.bad = true;
                false
            }
            Ok(n) => {
                self.size_read += n;
                self.recv_total += n as u64;
                true
            }
            Err(e) if would_block(&e) => true,
            Err(_) => {
                self.bad = true;
                false
            }
        }
    }

    /// Contiguous ring-buffer slice starting at `start`.
    pub(crate) fn ring_chunk(&self, start: usize, len: usize) -> &[u8] {
        &self.buffer[start..start + len]
    }

    /// Forward bytes taken from another link's ring buffer, advancing this
    /// link's `size_write`.
    pub(crate) fn try_write_ring(&mut self, chunk: &[u8]) -> bool {
        if self.bad {
            return false;
        }
        match self.data.try_write(chunk) {
            Ok(n) => {
                self.size_write += n;
                self.sent_total += n as u64;
                true
            }
            Err(e) if would_block(&e) => true,
            Err(_) => {
                self.bad = true;
                false
            }
        }
    }

    // ── raw data-stream ops (pointer-managed by the caller) ─────────

    /// Non-blocking read; the caller manages its own progress pointers.
    pub(crate) fn try_read_data(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.data.try_read(buf)?;
        self.recv_total += n as u64;
        Ok(n)
    }

    /// Non-blocking write; the caller manages its own progress pointers.
    pub(crate) fn try_write_data(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.data.try_write(buf)?;
        self.sent_total += n as u64;
        Ok(n)
    }

    /// Read and discard data-stream bytes until the lifetime received total
    /// reaches `limit`. Returns false when the link is beyond use.
    pub(crate) fn try_drain_data(&mut self, limit: u64) -> bool {
        if self.bad {
            return false;
        }
        debug_assert!(!self.buffer.is_empty(), "drain needs the ring buffer");
        let remain = limit.saturating_sub(self.recv_total) as usize;
        if remain == 0 {
            return true;
        }
        let cap = remain.min(self.buffer.len());
        match self.data.try_read(&mut self.buffer[..cap]) {
            Ok(0) => {
                self.bad = true;
                false
            }
            Ok(n) => {
                self.recv_total += n as u64;
                true
            }
            Err(e) if would_block(&e) => true,
            Err(_) => {
                self.bad = true;
                false
            }
        }
    }

    // ── blocking data-stream ops ────────────────────────────────────

    pub(crate) async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.data.read_exact(buf).await {
            Ok(_) => {
                self.recv_total += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.bad = true;
                Err(TenaxError::link_down(self.peer, e.to_string()))
            }
        }
    }

    pub(crate) async fn send_exact(&mut self, buf: &[u8]) -> Result<()> {
        match self.data.write_all(buf).await {
            Ok(()) => {
                self.sent_total += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.bad = true;
                Err(TenaxError::link_down(self.peer, e.to_string()))
            }
        }
    }

    /// Blocking single-byte read, used for the in-band reset mark.
    pub(crate) async fn read_data_byte(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.recv_exact(&mut b).await?;
        Ok(b[0])
    }

    // ── control-stream ops ──────────────────────────────────────────

    pub(crate) fn try_write_ctrl(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.ctrl.try_write(buf)
    }

    pub(crate) fn try_read_ctrl(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.ctrl.try_read(buf)
    }

    pub(crate) async fn ctrl_send_exact(&mut self, buf: &[u8]) -> Result<()> {
        match self.ctrl.write_all(buf).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.bad = true;
                Err(TenaxError::link_down(self.peer, e.to_string()))
            }
        }
    }

    pub(crate) async fn ctrl_recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.ctrl.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.bad = true;
                Err(TenaxError::link_down(self.peer, e.to_string()))
            }
        }
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// Borrow two distinct slice elements mutably, for pass-through forwarding
/// where one link's ring buffer feeds another link's stream.
pub(crate) fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b, "pass-through source and sink must differ");
    if a < b {
        let (lo, hi) = items.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = items.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Link;
    use tokio::net::{TcpListener, TcpStream};

    /// A connected pair of links over localhost; the first end sees peer
    /// rank 1, the second peer rank 0.
    pub(crate) async fn link_pair() -> (Link, Link) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (data, _) = listener.accept().await.unwrap();
            let (ctrl, _) = listener.accept().await.unwrap();
            (data, ctrl)
        });

        let data_a = TcpStream::connect(addr).await.unwrap();
        let ctrl_a = TcpStream::connect(addr).await.unwrap();
        let (data_b, ctrl_b) = accept.await.unwrap();

        for s in [&data_a, &ctrl_a, &data_b, &ctrl_b] {
            s.set_nodelay(true).unwrap();
        }

        (Link::new(1, data_a, ctrl_a), Link::new(0, data_b, ctrl_b))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::link_pair;
    use super::*;

    #[tokio::test]
    async fn test_exact_ops_track_totals() {
        let (mut a, mut b) = link_pair().await;
        a.send_exact(&[1, 2, 3, 4]).await.unwrap();
        let mut got = [0u8; 4];
        b.recv_exact(&mut got).await.unwrap();
        assert_eq!(got, [1, 2, 3, 4]);
        assert_eq!(a.sent_total(), 4);
        assert_eq!(b.recv_total(), 4);
    }

    #[tokio::test]
    async fn test_counter_framed_transfer() {
        let (mut a, mut b) = link_pair().await;
        a.reset_size();
        b.reset_size();

        let payload = vec![0xABu8; 4096];
        let mut got = vec![0u8; 4096];
        loop {
            if a.size_write() < payload.len() {
                a.data_writable().await.unwrap();
                assert!(a.try_write_from_array(&payload, payload.len()));
            }
            if b.size_read() < got.len() {
                b.data_ready(Interest::READABLE).await.unwrap();
                assert!(b.try_read_to_array(&mut got, 4096));
            }
            if a.size_write() == payload.len() && b.size_read() == got.len() {
                break;
            }
        }
        assert_eq!(got, payload);
        assert_eq!(b.recv_total(), 4096);
    }

    #[tokio::test]
    async fn test_ring_buffer_respects_protection_window() {
        let (mut a, mut b) = link_pair().await;
        b.init_buffer(8);
        b.reset_size();

        a.send_exact(&[9u8; 64]).await.unwrap();

        // With nothing consumed (protect_start = 0), the ring can absorb at
        // most its capacity even though 64 bytes are in flight.
        loop {
            b.data_ready(Interest::READABLE).await.unwrap();
            assert!(b.try_read_to_ring_buffer(0, 64));
            if b.size_read() == 8 {
                break;
            }
        }
        assert!(b.try_read_to_ring_buffer(0, 64));
        assert_eq!(b.size_read(), 8, "ring must not overwrite unconsumed data");
        assert_eq!(b.ring_chunk(0, 8), &[9u8; 64][..8]);
    }

    #[tokio::test]
    async fn test_zero_read_marks_bad() {
        let (a, mut b) = link_pair().await;
        drop(a);
        let mut got = vec![0u8; 4];
        loop {
            b.data_ready(Interest::READABLE).await.unwrap();
            if !b.try_read_to_array(&mut got, 4) {
                break;
            }
        }
        assert!(b.bad_socket());
    }

    #[test]
    fn test_pair_mut_disjoint() {
        let mut v = vec![1, 2, 3];
        let (x, y) = pair_mut(&mut v, 0, 2);
        *x += 10;
        *y += 20;
        assert_eq!(v, vec![11, 2, 23]);

        let (x, y) = pair_mut(&mut v, 2, 0);
        *x += 100;
        *y += 200;
        assert_eq!(v, vec![211, 2, 123]);
    }
}
