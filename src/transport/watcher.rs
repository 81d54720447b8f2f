use crate::transport::link::Link;
use futures::FutureExt;
use futures::future::{BoxFuture, select_all};
use tokio::io::Interest;

enum WatchEvent {
    Data(usize, tokio::io::Ready),
    DataError(usize),
    Except(usize),
}

/// Readiness multiplexer over the link set: watch (read | write | except) on
/// a small set of links, wake on any.
///
/// "Exception" readiness is the control stream becoming readable: the peer
/// has begun a reset handshake mid-transfer.
pub(crate) struct LinkWatcher {
    read: Vec<bool>,
    write: Vec<bool>,
    except: Vec<bool>,
}

pub(crate) struct ReadySet {
    readable: Vec<bool>,
    writable: Vec<bool>,
    except: Vec<bool>,
}

impl ReadySet {
    pub(crate) fn readable(&self, i: usize) -> bool {
        self.readable[i]
    }

    pub(crate) fn writable(&self, i: usize) -> bool {
        self.writable[i]
    }

    pub(crate) fn except(&self, i: usize) -> bool {
        self.except[i]
    }
}

impl LinkWatcher {
    pub(crate) fn new(nlink: usize) -> Self {
        Self {
            read: vec![false; nlink],
            write: vec![false; nlink],
            except: vec![false; nlink],
        }
    }

    pub(crate) fn watch_read(&mut self, i: usize) {
        self.read[i] = true;
    }

    pub(crate) fn watch_write(&mut self, i: usize) {
        self.write[i] = true;
    }

    pub(crate) fn watch_except(&mut self, i: usize) {
        self.except[i] = true;
    }

    /// Wait until at least one watched link is ready, then drain every other
    /// already-ready future without blocking so a single wake services all
    /// currently-ready links.
    pub(crate) async fn wait(&self, links: &[Link]) -> ReadySet {
        let nlink = links.len();
        let mut futs: Vec<BoxFuture<'_, WatchEvent>> = Vec::new();

        for (i, link) in links.iter().enumerate() {
            if link.bad_socket() {
                continue;
            }
            let interest = match (self.read[i], self.write[i]) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };
            if let Some(interest) = interest {
                futs.push(Box::pin(async move {
                    match link.data_ready(interest).await {
                        Ok(ready) => WatchEvent::Data(i, ready),
                        Err(_) => WatchEvent::DataError(i),
                    }
                }));
            }
            if self.except[i] {
                futs.push(Box::pin(async move {
                    // Any control-stream traffic (or its loss) counts as an
                    // exceptional condition; the caller sorts out which.
                    let _ = link.ctrl_readable().await;
                    WatchEvent::Except(i)
                }));
            }
        }

        let mut out = ReadySet {
            readable: vec![false; nlink],
            writable: vec![false; nlink],
            except: vec![false; nlink],
        };
        if futs.is_empty() {
            return out;
        }

        let (first, _, rest) = select_all(futs).await;
        out.apply(first);
        for fut in rest {
            if let Some(ev) = fut.now_or_never() {
                out.apply(ev);
            }
        }
        out
    }
}

impl ReadySet {
    fn apply(&mut self, ev: WatchEvent) {
        match ev {
            WatchEvent::Data(i, ready) => {
                if ready.is_readable() || ready.is_read_closed() {
                    self.readable[i] = true;
                }
                if ready.is_writable() || ready.is_write_closed() {
                    self.writable[i] = true;
                }
            }
            WatchEvent::DataError(i) => {
                // Surface the failure through the try_* path.
                self.readable[i] = true;
                self.writable[i] = true;
            }
            WatchEvent::Except(i) => self.except[i] = true,
        }
    }
}
