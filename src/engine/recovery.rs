//! Link drain/resync and the streaming transfers that move a recovered
//! payload from its holders to every requester.

use crate::engine::base::BaseEngine;
use crate::engine::routing::RecoverRole;
use crate::error::{Result, TenaxError};
use crate::protocol::{OOB_RESET, RESET_ACK, RESET_MARK};
use crate::transport::link::pair_mut;
use crate::transport::watcher::LinkWatcher;
use futures::future::select_all;

/// The payload buffer of one recovery transfer, borrowed according to role:
/// holders only read it, the requester fills it, pass-through nodes touch
/// only their ring buffers.
pub(crate) enum RecoverBuf<'a> {
    Have(&'a [u8]),
    Request(&'a mut [u8]),
    Pass,
}

impl RecoverBuf<'_> {
    pub(crate) fn role(&self) -> RecoverRole {
        match self {
            RecoverBuf::Have(_) => RecoverRole::HaveData,
            RecoverBuf::Request(_) => RecoverRole::RequestData,
            RecoverBuf::Pass => RecoverRole::PassData,
        }
    }
}

/// Reset announcement frame on the control stream: tag + pre-reset total.
const ANNOUNCE_BYTES: usize = 9;

impl BaseEngine {
    /// Drain and resynchronize every live link after an error.
    ///
    /// Each side announces on the control stream how many data bytes it had
    /// sent before the reset, writes one in-band `RESET_MARK`, discards
    /// inbound data up to the peer's announced total, then confirms with a
    /// blocking mark/ack exchange. Idempotent; both sides must run it.
    #[allow(dead_code)] // escalation path; see check_and_recover
    pub(crate) async fn try_reset_links(&mut self) -> Result<()> {
        let nlink = self.links.len();
        if nlink == 0 {
            return Ok(());
        }
        let ring_bytes = self.cfg.ring_buffer_bytes;
        for link in &mut self.links {
            link.init_buffer(ring_bytes);
            link.reset_size();
        }

        // Announcements carry the totals as they stood before the in-band
        // mark below, so the peer drains exactly up to the mark byte.
        let announce: Vec<[u8; ANNOUNCE_BYTES]> = self
            .links
            .iter()
            .map(|l| {
                let mut frame = [0u8; ANNOUNCE_BYTES];
                frame[0] = OOB_RESET;
                frame[1..9].copy_from_slice(&l.sent_total().to_le_bytes());
                frame
            })
            .collect();

        // Phase 1: push the announcement and the mark out on every link,
        // non-blocking, until both are fully written everywhere.
        let mut ann_written = vec![0usize; nlink];
        let mut mark_written = vec![false; nlink];
        loop {
            let mut pending_ctrl = Vec::new();
            let mut pending_data = Vec::new();
            for i in 0..nlink {
                if self.links[i].bad_socket() {
                    continue;
                }
                if ann_written[i] < ANNOUNCE_BYTES {
                    match self.links[i].try_write_ctrl(&announce[i][ann_written[i]..]) {
                        Ok(0) => self.links[i].mark_bad(),
                        Ok(n) => ann_written[i] += n,
                        Err(e) if is_would_block(&e) => {}
                        Err(_) => self.links[i].mark_bad(),
                    }
                }
                if ann_written[i] == ANNOUNCE_BYTES && !mark_written[i] {
                    match self.links[i].try_write_data(&[RESET_MARK]) {
                        Ok(1) => mark_written[i] = true,
                        Ok(_) => {}
                        Err(e) if is_would_block(&e) => {}
                        Err(_) => self.links[i].mark_bad(),
                    }
                }
                if self.links[i].bad_socket() {
                    continue;
                }
                if ann_written[i] < ANNOUNCE_BYTES {
                    pending_ctrl.push(i);
                } else if !mark_written[i] {
                    pending_data.push(i);
                }
            }
            if pending_ctrl.is_empty() && pending_data.is_empty() {
                break;
            }
            let mut futs: Vec<futures::future::BoxFuture<'_, ()>> = Vec::new();
            for &i in &pending_ctrl {
                let link = &self.links[i];
                futs.push(Box::pin(async move {
                    let _ = link.ctrl_writable().await;
                }));
            }
            for &i in &pending_data {
                let link = &self.links[i];
                futs.push(Box::pin(async move {
                    let _ = link.data_writable().await;
                }));
            }
            select_all(futs).await;
        }

        // Phase 2: wait for the peer's announcement to arrive, the
        // urgent-data analogue of waiting on the exception set.
        for i in 0..nlink {
            if !self.links[i].bad_socket() && self.links[i].ctrl_readable().await.is_err() {
                self.links[i].mark_bad();
            }
        }

        // Phase 3: parse the announced totals and discard data up to the
        // mark on every link.
        let mut ann_in = vec![[0u8; ANNOUNCE_BYTES]; nlink];
        let mut ann_got = vec![0usize; nlink];
        let mut announced: Vec<Option<u64>> = vec![None; nlink];
        loop {
            let mut pending_ctrl = Vec::new();
            let mut pending_data = Vec::new();
            for i in 0..nlink {
                if self.links[i].bad_socket() {
                    continue;
                }
                if announced[i].is_none() {
                    match self.links[i].try_read_ctrl(&mut ann_in[i][ann_got[i]..]) {
                        Ok(0) => self.links[i].mark_bad(),
                        Ok(n) => {
                            ann_got[i] += n;
                            if ann_got[i] == ANNOUNCE_BYTES {
                                assert_eq!(ann_in[i][0], OOB_RESET, "unexpected control byte");
                                announced[i] = Some(u64::from_le_bytes(
                                    ann_in[i][1..9].try_into().unwrap(),
                                ));
                            }
                        }
                        Err(e) if is_would_block(&e) => {}
                        Err(_) => self.links[i].mark_bad(),
                    }
                }
                if let Some(limit) = announced[i] {
                    if !self.links[i].try_drain_data(limit) {
                        continue;
                    }
                }
                if self.links[i].bad_socket() {
                    continue;
                }
                match announced[i] {
                    None => pending_ctrl.push(i),
                    Some(limit) => {
                        if self.links[i].recv_total() < limit {
                            pending_data.push(i);
                        }
                    }
                }
            }
            if pending_ctrl.is_empty() && pending_data.is_empty() {
                break;
            }
            let mut futs: Vec<futures::future::BoxFuture<'_, ()>> = Vec::new();
            for &i in &pending_ctrl {
                let link = &self.links[i];
                futs.push(Box::pin(async move {
                    let _ = link.ctrl_readable().await;
                }));
            }
            for &i in &pending_data {
                let link = &self.links[i];
                futs.push(Box::pin(async move {
                    let _ = link.data_ready(tokio::io::Interest::READABLE).await;
                }));
            }
            select_all(futs).await;
        }

        // Phase 4: blocking synchronization. Consume the in-band mark and
        // trade acks; after this both directions are empty.
        for i in 0..nlink {
            if self.links[i].bad_socket() {
                continue;
            }
            match self.links[i].read_data_byte().await {
                Ok(mark) => assert_eq!(mark, RESET_MARK, "stream not positioned at the mark"),
                Err(_) => continue,
            }
            let _ = self.links[i].ctrl_send_exact(&[RESET_ACK]).await;
        }
        for i in 0..nlink {
            if self.links[i].bad_socket() {
                continue;
            }
            let mut ack = [0u8; 1];
            if self.links[i].ctrl_recv_exact(&mut ack).await.is_ok() {
                assert_eq!(ack[0], RESET_ACK, "unexpected ack byte");
            }
        }

        for link in &self.links {
            if link.bad_socket() {
                return Err(TenaxError::link_down(link.peer(), "link lost during reset"));
            }
        }
        Ok(())
    }

    /// Move `size` payload bytes from every holder to every requester along
    /// the routes picked by `try_decide_routing`. Nodes with nothing to send
    /// or receive short-circuit to success.
    ///
    /// Per-link invariants: `size_read <= size`; for pass-through,
    /// `size_write <= size_read(recv_link)` with the ring buffer capped at
    /// `min_write + buffer_size`; for holders, `size_write <= size`.
    pub(crate) async fn try_recover_data(
        &mut self,
        mut data: RecoverBuf<'_>,
        size: usize,
        recv_link: i32,
        req_in: &[bool],
    ) -> Result<()> {
        let nlink = self.links.len();
        if nlink == 0 || size == 0 {
            return Ok(());
        }
        assert_eq!(req_in.len(), nlink, "request vector covers every link");
        let role = data.role();

        let mut involved = role == RecoverRole::RequestData;
        for (i, &asked) in req_in.iter().enumerate() {
            if asked {
                assert_ne!(i as i32, recv_link, "cannot serve the link we receive on");
                involved = true;
            }
        }
        if !involved {
            return Ok(());
        }
        assert!(
            recv_link >= 0 || role == RecoverRole::HaveData,
            "only holders run without a source link"
        );
        let rl = recv_link.max(0) as usize;

        for link in &mut self.links {
            link.reset_size();
        }

        loop {
            let mut watcher = LinkWatcher::new(nlink);
            let mut finished = true;
            for i in 0..nlink {
                if i as i32 == recv_link && self.links[i].size_read() != size {
                    watcher.watch_read(i);
                    finished = false;
                }
                if req_in[i] && self.links[i].size_write() != size {
                    let source_ahead = match role {
                        RecoverRole::HaveData => true,
                        _ => self.links[rl].size_read() != self.links[i].size_write(),
                    };
                    if source_ahead {
                        watcher.watch_write(i);
                    }
                    finished = false;
                }
                watcher.watch_except(i);
            }
            if finished {
                return Ok(());
            }
            let ready = watcher.wait(&self.links).await;
            for i in 0..nlink {
                if ready.except(i) {
                    return Err(TenaxError::ResetSignal);
                }
            }

            match &mut data {
                RecoverBuf::Request(buf) => {
                    if ready.readable(rl) && !self.links[rl].try_read_to_array(buf, size) {
                        return Err(self.links[rl].link_down_error("recovery read failed"));
                    }
                    let have = self.links[rl].size_read();
                    for i in 0..nlink {
                        if req_in[i]
                            && self.links[i].size_write() != have
                            && ready.writable(i)
                            && !self.links[i].try_write_from_array(buf, have)
                        {
                            return Err(self.links[i].link_down_error("recovery forward failed"));
                        }
                    }
                }
                RecoverBuf::Have(buf) => {
                    for i in 0..nlink {
                        if req_in[i]
                            && ready.writable(i)
                            && !self.links[i].try_write_from_array(buf, size)
                        {
                            return Err(self.links[i].link_down_error("recovery send failed"));
                        }
                    }
                }
                RecoverBuf::Pass => {
                    let buffer_size = self.links[rl].buffer_size();
                    if ready.readable(rl) {
                        let mut min_write = size;
                        for i in 0..nlink {
                            if req_in[i] {
                                min_write = min_write.min(self.links[i].size_write());
                            }
                        }
                        assert!(
                            min_write <= self.links[rl].size_read(),
                            "pass-through boundary check"
                        );
                        if !self.links[rl].try_read_to_ring_buffer(min_write, size) {
                            return Err(self.links[rl].link_down_error("pass-through read failed"));
                        }
                    }
                    for i in 0..nlink {
                        if req_in[i]
                            && ready.writable(i)
                            && self.links[rl].size_read() != self.links[i].size_write()
                        {
                            let (src, dst) = pair_mut(&mut self.links, rl, i);
                            let start = dst.size_write() % buffer_size;
                            let nwrite =
                                (buffer_size - start).min(src.size_read() - dst.size_write());
                            let chunk = src.ring_chunk(start, nwrite);
                            if !dst.try_write_ring(chunk) {
                                let err = dst.link_down_error("pass-through forward failed");
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stream a buffer window around the ring: receive
    /// `buf[read_ptr..read_end]` from `prev`, send `buf[write_ptr..write_end]`
    /// to `next`, never sending bytes that have not been received yet.
    /// This is the streaming primitive for ring-structured state replication.
    #[allow(dead_code)]
    pub(crate) async fn ring_passing(
        &mut self,
        buf: &mut [u8],
        mut read_ptr: usize,
        read_end: usize,
        mut write_ptr: usize,
        write_end: usize,
        prev: usize,
        next: usize,
    ) -> Result<()> {
        if self.links.is_empty() || read_end == 0 {
            return Ok(());
        }
        assert!(write_end <= read_end, "can only forward received bytes");
        assert!(read_ptr <= read_end, "ring boundary check");
        assert!(write_ptr <= write_end, "ring boundary check");

        loop {
            let mut watcher = LinkWatcher::new(self.links.len());
            let mut finished = true;
            if read_ptr != read_end {
                watcher.watch_read(prev);
                finished = false;
            }
            if write_ptr < read_ptr && write_ptr != write_end {
                watcher.watch_write(next);
                finished = false;
            }
            watcher.watch_except(prev);
            watcher.watch_except(next);
            if finished {
                return Ok(());
            }
            let ready = watcher.wait(&self.links).await;
            if ready.except(prev) || ready.except(next) {
                return Err(TenaxError::ResetSignal);
            }
            if read_ptr != read_end && ready.readable(prev) {
                match self.links[prev].try_read_data(&mut buf[read_ptr..read_end]) {
                    Ok(0) => {
                        self.links[prev].mark_bad();
                        return Err(self.links[prev].link_down_error("ring peer closed"));
                    }
                    Ok(n) => read_ptr += n,
                    Err(e) if is_would_block(&e) => {}
                    Err(e) => {
                        self.links[prev].mark_bad();
                        return Err(self.links[prev].link_down_error(e.to_string()));
                    }
                }
            }
            if write_ptr != write_end && write_ptr < read_ptr && ready.writable(next) {
                let limit = write_end.min(read_ptr);
                match self.links[next].try_write_data(&buf[write_ptr..limit]) {
                    Ok(n) => write_ptr += n,
                    Err(e) if is_would_block(&e) => {}
                    Err(e) => {
                        self.links[next].mark_bad();
                        return Err(self.links[next].link_down_error(e.to_string()));
                    }
                }
            }
        }
    }
}

fn is_would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
