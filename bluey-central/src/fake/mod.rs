//! An in-process backend with no radio behind it.
//!
//! Every request a session makes is recorded as a [`FakeRequest`] and
//! nothing completes on its own: the owner of the [`FakeBackend`] plays
//! the part of the platform stack by emitting [`BackendEvent`]s for the
//! most recent link and by driving the peer end of opened channels.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::trace;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::backend::{Backend, BackendEvent, ChannelStream, ConnectionPriority, GattLink, LinkEvents};
use crate::characteristic::{CharacteristicKey, WriteType};
use crate::service::ServiceInfo;
use crate::{Address, Error, Result};

const CHANNEL_BUFFER: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub enum FakeRequest {
    Connect {
        auto_connect: bool,
    },
    DiscoverServices,
    Read(CharacteristicKey),
    Write {
        target: CharacteristicKey,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotification {
        target: CharacteristicKey,
        enable: bool,
    },
    WriteDescriptor {
        target: CharacteristicKey,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    ReadRssi,
    RequestMtu(u16),
    ConnectionPriority(ConnectionPriority),
    Refresh,
    Disconnect,
    Close,
    OpenChannel {
        psm: u16,
        secure: bool,
    },
}

#[derive(Debug)]
struct FakeState {
    services: StdMutex<Vec<ServiceInfo>>,
    events: StdMutex<Option<LinkEvents>>,
    requests_tx: mpsc::UnboundedSender<FakeRequest>,
    requests_rx: Mutex<mpsc::UnboundedReceiver<FakeRequest>>,
    channel_peers: StdMutex<HashMap<u16, DuplexStream>>,
    refused_psms: StdMutex<HashSet<u16>>,
}

impl FakeState {
    fn record(&self, request: FakeRequest) {
        trace!("Fake backend request: {:?}", request);
        let _ = self.requests_tx.send(request);
    }
}

#[derive(Clone, Debug)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    /// `services` is the attribute table every link will report as
    /// discovered.
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(FakeState {
                services: StdMutex::new(services),
                events: StdMutex::new(None),
                requests_tx,
                requests_rx: Mutex::new(requests_rx),
                channel_peers: StdMutex::new(HashMap::new()),
                refused_psms: StdMutex::new(HashSet::new()),
            }),
        }
    }

    pub fn set_services(&self, services: Vec<ServiceInfo>) {
        *self.state.services.lock().unwrap() = services;
    }

    /// Sends an event as if from the most recently created link. Returns
    /// false if there's no link or the session has gone away.
    pub fn emit(&self, event: BackendEvent) -> bool {
        match &*self.state.events.lock().unwrap() {
            Some(events) => events.send(event),
            None => false,
        }
    }

    /// The event sender of the most recently created link.
    pub fn link_events(&self) -> Option<LinkEvents> {
        self.state.events.lock().unwrap().clone()
    }

    /// Waits for the next request issued by the session.
    pub async fn next_request(&self) -> Option<FakeRequest> {
        self.state.requests_rx.lock().await.recv().await
    }

    /// Returns a request that has already been issued, without waiting.
    pub fn try_next_request(&self) -> Option<FakeRequest> {
        match self.state.requests_rx.try_lock() {
            Ok(mut rx) => rx.try_recv().ok(),
            Err(_) => None,
        }
    }

    /// Takes the peer end of the last channel opened for `psm`.
    pub fn take_channel_peer(&self, psm: u16) -> Option<DuplexStream> {
        self.state.channel_peers.lock().unwrap().remove(&psm)
    }

    /// Makes future attempts to open `psm` fail.
    pub fn refuse_channel(&self, psm: u16) {
        self.state.refused_psms.lock().unwrap().insert(psm);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn connect_gatt(&self, _address: &Address, auto_connect: bool, events: LinkEvents)
                    -> Result<Arc<dyn GattLink>> {
        *self.state.events.lock().unwrap() = Some(events);
        self.state.record(FakeRequest::Connect { auto_connect });
        Ok(Arc::new(FakeLink {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_channel(&self, _address: &Address, psm: u16, secure: bool)
                          -> Result<Box<dyn ChannelStream>> {
        self.state.record(FakeRequest::OpenChannel { psm, secure });
        if self.state.refused_psms.lock().unwrap().contains(&psm) {
            return Err(Error::ChannelClosed {
                psm,
                reason: "Connection refused".to_string(),
            });
        }
        let (local, peer) = tokio::io::duplex(CHANNEL_BUFFER);
        self.state.channel_peers.lock().unwrap().insert(psm, peer);
        Ok(Box::new(local))
    }
}

#[derive(Debug)]
struct FakeLink {
    state: Arc<FakeState>,
    closed: AtomicBool,
}

impl FakeLink {
    fn request(&self, request: FakeRequest) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NoConnection);
        }
        self.state.record(request);
        Ok(())
    }
}

impl GattLink for FakeLink {
    fn discover_services(&self) -> Result<()> {
        self.request(FakeRequest::DiscoverServices)
    }

    fn services(&self) -> Vec<ServiceInfo> {
        self.state.services.lock().unwrap().clone()
    }

    fn read_characteristic(&self, target: &CharacteristicKey) -> Result<()> {
        self.request(FakeRequest::Read(*target))
    }

    fn write_characteristic(&self, target: &CharacteristicKey, value: &[u8], write_type: WriteType)
                            -> Result<()> {
        self.request(FakeRequest::Write {
            target: *target,
            value: value.to_vec(),
            write_type,
        })
    }

    fn set_characteristic_notification(&self, target: &CharacteristicKey, enable: bool)
                                       -> Result<()> {
        self.request(FakeRequest::SetNotification { target: *target, enable })
    }

    fn write_descriptor(&self, target: &CharacteristicKey, descriptor: Uuid, value: &[u8])
                        -> Result<()> {
        self.request(FakeRequest::WriteDescriptor {
            target: *target,
            descriptor,
            value: value.to_vec(),
        })
    }

    fn read_remote_rssi(&self) -> Result<()> {
        self.request(FakeRequest::ReadRssi)
    }

    fn request_mtu(&self, mtu: u16) -> Result<()> {
        self.request(FakeRequest::RequestMtu(mtu))
    }

    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()> {
        self.request(FakeRequest::ConnectionPriority(priority))
    }

    fn refresh(&self) -> Result<()> {
        self.request(FakeRequest::Refresh)
    }

    fn disconnect(&self) {
        let _ = self.request(FakeRequest::Disconnect);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.record(FakeRequest::Close);
        }
    }
}
