use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::backend::{Backend, ChannelStream};
use crate::pending::{pending, PendingResult, ResultSink};
use crate::{Address, Error, Result};

type ChannelWriter = Arc<Mutex<WriteHalf<Box<dyn ChannelStream>>>>;

/// Handed back once a channel's socket has connected.
#[derive(Debug)]
pub struct OpenedChannel {
    pub psm: u16,

    /// Resolves with an error when this socket is torn down, whether by the
    /// peer, an I/O failure, a close request or a session disconnect.
    pub closed: PendingResult<()>,
}

#[derive(Debug, Default)]
struct Socket {
    // Bumped for every new socket so a reader task for a replaced socket
    // can't tear down its successor
    generation: u64,
    writer: Option<ChannelWriter>,
    cancel_reader: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    closed: Option<ResultSink<()>>,

    // Persists across sockets for the lifetime of the channel
    receiver: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Debug)]
struct Channel {
    psm: u16,

    // Serializes open() calls for this psm across the backend await
    open_lock: Mutex<()>,
    socket: StdMutex<Socket>,
}

impl Channel {
    fn new(psm: u16) -> Self {
        Self {
            psm,
            open_lock: Mutex::new(()),
            socket: StdMutex::new(Socket::default()),
        }
    }

    /// Tears down the current socket, if it's still `generation` (or any
    /// socket when `generation` is `None`).
    fn teardown(&self, generation: Option<u64>, reason: &str) {
        let mut socket = self.socket.lock().unwrap();
        if let Some(generation) = generation {
            if socket.generation != generation {
                trace!("Ignoring teardown of replaced L2CAP socket (psm={})", self.psm);
                return;
            }
        }
        if socket.writer.is_none() && socket.closed.is_none() {
            return;
        }

        debug!("Closing L2CAP socket (psm={}): {}", self.psm, reason);
        socket.writer = None;
        if let Some(cancel) = socket.cancel_reader.take() {
            let _ = cancel.send(());
        }
        // The reader exits on cancellation, dropping its half of the stream
        socket.reader = None;
        if let Some(closed) = socket.closed.take() {
            closed.resolve(Err(Error::ChannelClosed {
                psm: self.psm,
                reason: reason.to_string(),
            }));
        }
    }

    fn deliver(&self, bytes: Vec<u8>) {
        let socket = self.socket.lock().unwrap();
        match &socket.receiver {
            Some(receiver) => {
                if receiver.send(bytes).is_err() {
                    trace!("L2CAP receiver for psm={} dropped", self.psm);
                }
            }
            None => trace!("Dropping {} bytes on psm={} with no receiver", bytes.len(), self.psm),
        }
    }

    fn current_writer(&self) -> Option<(u64, ChannelWriter)> {
        let socket = self.socket.lock().unwrap();
        socket.writer.as_ref().map(|writer| (socket.generation, writer.clone()))
    }
}

async fn run_reader(channel: Arc<Channel>, generation: u64,
                    mut stream: ReadHalf<Box<dyn ChannelStream>>,
                    mut cancel: oneshot::Receiver<()>, buffer_size: usize) {
    trace!("Starting L2CAP reader task (psm={})", channel.psm);
    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            _ = &mut cancel => {
                break;
            }
            read = stream.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        channel.teardown(Some(generation), "L2Cap channel disconnected");
                        break;
                    }
                    Ok(len) => channel.deliver(buf[..len].to_vec()),
                    Err(err) => {
                        debug!("L2CAP read error (psm={}): {:?}", channel.psm, err);
                        channel.teardown(Some(generation), "L2Cap read pipe broken");
                        break;
                    }
                }
            }
        }
    }
    trace!("Finished L2CAP reader task (psm={})", channel.psm);
}

/// Independent byte-stream channels keyed by PSM. None of this goes
/// through the GATT command queue.
#[derive(Debug)]
pub(crate) struct ChannelManager {
    channels: DashMap<u16, Arc<Channel>>,
    read_buffer: usize,
}

impl ChannelManager {
    pub(crate) fn new(read_buffer: usize) -> Self {
        Self {
            channels: DashMap::new(),
            read_buffer: read_buffer.max(1),
        }
    }

    fn ensure_channel(&self, psm: u16) -> Arc<Channel> {
        self.channels
            .entry(psm)
            .or_insert_with(|| Arc::new(Channel::new(psm)))
            .value()
            .clone()
    }

    fn get_channel(&self, psm: u16) -> Option<Arc<Channel>> {
        self.channels.get(&psm).map(|entry| entry.value().clone())
    }

    pub(crate) async fn open(&self, backend: &dyn Backend, address: &Address, psm: u16,
                             secure: bool) -> Result<OpenedChannel> {
        let channel = self.ensure_channel(psm);
        let _guard = channel.open_lock.lock().await;

        channel.teardown(None, "L2CAP disconnected");

        trace!("Opening L2CAP channel psm={} secure={}", psm, secure);
        let stream = match backend.open_channel(address, psm, secure).await {
            Ok(stream) => stream,
            Err(err) => {
                // Keep the entry only if something is listening on it
                self.channels.remove_if(&psm, |_, current| {
                    Arc::ptr_eq(current, &channel)
                        && current.socket.lock().unwrap().receiver.is_none()
                });
                return Err(err);
            }
        };

        // The channel may have been closed while we were connecting
        match self.get_channel(psm) {
            Some(current) if Arc::ptr_eq(&current, &channel) => {}
            _ => {
                return Err(Error::ChannelClosed {
                    psm,
                    reason: "L2CAP disconnected".to_string(),
                });
            }
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (closed_sink, closed) = pending();

        let mut socket = channel.socket.lock().unwrap();
        socket.generation += 1;
        let generation = socket.generation;
        socket.writer = Some(Arc::new(Mutex::new(write_half)));
        socket.cancel_reader = Some(cancel_tx);
        socket.closed = Some(closed_sink);
        let reader_channel = channel.clone();
        let buffer_size = self.read_buffer;
        socket.reader = Some(tokio::spawn(async move {
            run_reader(reader_channel, generation, read_half, cancel_rx, buffer_size).await
        }));

        Ok(OpenedChannel { psm, closed })
    }

    pub(crate) async fn write(&self, psm: u16, bytes: &[u8]) -> Result<()> {
        let not_connected = || Error::NotConnected(format!("L2CAP PSM {} not connected.", psm));
        let channel = self.get_channel(psm).ok_or_else(not_connected)?;
        let (generation, writer) = channel.current_writer().ok_or_else(not_connected)?;

        let result = {
            let mut writer = writer.lock().await;
            match writer.write_all(bytes).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = result {
            channel.teardown(Some(generation), "L2Cap write pipe broken");
            return Err(Error::ChannelIo(err));
        }
        Ok(())
    }

    /// Registers (or replaces) the inbound data stream for `psm`.
    pub(crate) fn read(&self, psm: u16) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.ensure_channel(psm);
        channel.socket.lock().unwrap().receiver = Some(tx);
        rx
    }

    pub(crate) fn is_open(&self, psm: u16) -> bool {
        match self.get_channel(psm) {
            Some(channel) => channel.socket.lock().unwrap().writer.is_some(),
            None => false,
        }
    }

    pub(crate) fn close(&self, psm: u16) {
        if let Some((_, channel)) = self.channels.remove(&psm) {
            channel.teardown(None, "L2CAP disconnected");
        }
    }

    pub(crate) fn close_all(&self) {
        let channels: Vec<Arc<Channel>> =
            self.channels.iter().map(|entry| entry.value().clone()).collect();
        self.channels.clear();
        for channel in channels {
            channel.teardown(None, "L2CAP disconnected");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeBackend;
    use std::str::FromStr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn address() -> Address {
        Address::from_str("F1:E2:D3:C4:B5:A6").unwrap()
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let backend = FakeBackend::new(vec![]);
        let channels = ChannelManager::new(4096);
        let mut inbound = channels.read(1);

        let _opened = channels.open(&backend, &address(), 1, false).await.unwrap();
        assert!(channels.is_open(1));
        let mut peer = backend.take_channel_peer(1).unwrap();

        channels.write(1, &[0x01, 0x02]).await.unwrap();
        let mut echo = [0u8; 2];
        peer.read_exact(&mut echo).await.unwrap();
        peer.write_all(&echo).await.unwrap();

        let received = timeout(Duration::from_secs(1), inbound.recv()).await.unwrap().unwrap();
        assert_eq!(received, vec![0x01, 0x02]);
    }

    #[tokio::test]
    async fn write_without_socket_fails_fast() {
        let channels = ChannelManager::new(4096);
        match channels.write(7, &[1]).await {
            Err(Error::NotConnected(msg)) => assert_eq!(msg, "L2CAP PSM 7 not connected."),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!channels.is_open(7));
    }

    #[tokio::test]
    async fn peer_close_tears_down_socket() {
        let backend = FakeBackend::new(vec![]);
        let channels = ChannelManager::new(16);
        let opened = channels.open(&backend, &address(), 3, true).await.unwrap();
        let peer = backend.take_channel_peer(3).unwrap();
        drop(peer);

        let closed = timeout(Duration::from_secs(1), opened.closed).await.unwrap();
        assert!(matches!(closed, Err(Error::ChannelClosed { psm: 3, .. })));
        assert!(!channels.is_open(3));
        assert!(matches!(channels.write(3, &[1]).await, Err(Error::NotConnected(_))));
    }

    #[tokio::test]
    async fn reopen_replaces_socket_and_keeps_receiver() {
        let backend = FakeBackend::new(vec![]);
        let channels = ChannelManager::new(64);
        let mut inbound = channels.read(5);

        let first = channels.open(&backend, &address(), 5, false).await.unwrap();
        let _stale_peer = backend.take_channel_peer(5).unwrap();
        let _second = channels.open(&backend, &address(), 5, false).await.unwrap();
        assert!(matches!(first.closed.await, Err(Error::ChannelClosed { .. })));

        let mut peer = backend.take_channel_peer(5).unwrap();
        peer.write_all(b"hi").await.unwrap();
        let received = timeout(Duration::from_secs(1), inbound.recv()).await.unwrap().unwrap();
        assert_eq!(received, b"hi".to_vec());

        channels.close(5);
        channels.close(5);
        assert_eq!(channels.len(), 0);
    }

    #[tokio::test]
    async fn refused_open_leaves_no_entry() {
        let backend = FakeBackend::new(vec![]);
        backend.refuse_channel(9);
        backend.refuse_channel(10);
        let channels = ChannelManager::new(64);

        assert!(channels.open(&backend, &address(), 9, false).await.is_err());
        assert!(!channels.is_open(9));
        assert_eq!(channels.len(), 0);

        // A registered receiver keeps its entry for a later open
        let _inbound = channels.read(10);
        assert!(channels.open(&backend, &address(), 10, false).await.is_err());
        assert_eq!(channels.len(), 1);
    }
}
