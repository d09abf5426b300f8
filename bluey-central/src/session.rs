use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{Backend, BackendEvent, ConnectionPriority, GattLink, LinkEvents};
use crate::channel::{ChannelManager, OpenedChannel};
use crate::characteristic::{CharacteristicInfo, CharacteristicProperties, WriteType};
use crate::command::{Command, CommandQueue};
use crate::connection::{ConnectSink, ConnectionState, LinkState, RetryPolicy, RetryRules};
use crate::descriptor::{CLIENT_CHARACTERISTIC_CONFIGURATION, ENABLE_INDICATION_VALUE,
                        ENABLE_NOTIFICATION_VALUE};
use crate::notification::{Notification, NotificationRegistry};
use crate::peripheral::PeripheralInfo;
use crate::pending::{pending, PendingResult};
use crate::service::ServiceInfo;
use crate::uuid::BluetoothUuid;
use crate::{Address, Error, GattStatus, Result};

use anyhow::anyhow;

const DISCONNECTED_REASON: &str = "Peripheral Disconnected";

#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's not public API for SessionInner
// we don't really leak anything
#[derive(Debug)]
pub struct SessionInner {
    config: SessionConfig,
    retry: RetryRules,
    backend: Arc<dyn Backend>,

    // Each link is handed a clone of this (tagged with the link's
    // generation) and the RX end is owned by the task spawned in `start()`
    backend_bus: mpsc::UnboundedSender<(u64, BackendEvent)>,

    link_state: StdMutex<LinkState>,
    rssi: StdMutex<Option<i16>>,

    queue: CommandQueue,
    notifications: NotificationRegistry,
    channels: ChannelManager,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let link_state = match self.link_state.get_mut() {
            Ok(link_state) => link_state,
            Err(poisoned) => poisoned.into_inner(),
        };
        link_state.abort_retry();
        link_state.abort_refresh(Error::SessionClosed);
        link_state.release_link(true);
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    address: Address,
    name: Option<String>,
    retry: RetryPolicy,

    // Size of the buffer each channel reader reads into, which bounds the
    // size of each inbound chunk
    channel_read_buffer: usize,
}

impl SessionConfig {
    pub fn new(address: Address) -> SessionConfig {
        SessionConfig {
            address,
            name: None,
            retry: RetryPolicy::default(),
            channel_read_buffer: 4096,
        }
    }

    /// The advertised device name, matched against the retry policy's
    /// name patterns.
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) -> &mut Self {
        self.retry = retry;
        self
    }

    pub fn set_channel_read_buffer(&mut self, size: usize) -> &mut Self {
        self.channel_read_buffer = size;
        self
    }

    pub async fn start(self, backend: Arc<dyn Backend>) -> Result<Session> {
        Session::start(self, backend).await
    }
}

impl Session {
    // The task processing backend events (and any deferred retry/refresh
    // tasks) only hold a Weak<> reference to the SessionInner, otherwise
    // there would be a circular reference and it wouldn't be possible to
    // drop a Session. They `upgrade` it while doing work and `wrap()` the
    // result back into a Session.
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    async fn start(config: SessionConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        let retry = config.retry.compile()?;

        let (backend_bus_tx, backend_bus_rx) = mpsc::unbounded_channel();
        let channels = ChannelManager::new(config.channel_read_buffer);
        let session = Session {
            inner: Arc::new(SessionInner {
                config,
                retry,
                backend,
                backend_bus: backend_bus_tx,
                link_state: StdMutex::new(LinkState::default()),
                rssi: StdMutex::new(None),
                queue: CommandQueue::new(),
                notifications: NotificationRegistry::new(),
                channels,
            }),
        };

        let weak_session = Arc::downgrade(&session.inner);
        tokio::spawn(async move { Session::run_backend_task(weak_session, backend_bus_rx).await });

        Ok(session)
    }

    pub fn address(&self) -> &Address {
        &self.config.address
    }

    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.link_state.lock().unwrap().state
    }

    /// A snapshot of what's known about the peripheral: the services from
    /// the last discovery and the last RSSI reading.
    pub fn info(&self) -> PeripheralInfo {
        let link = self.link_state.lock().unwrap().link.clone();
        self.build_info(link.as_deref())
    }

    fn build_info(&self, link: Option<&dyn GattLink>) -> PeripheralInfo {
        PeripheralInfo {
            address: self.config.address.clone(),
            name: self.config.name.clone(),
            rssi: *self.rssi.lock().unwrap(),
            services: link.map(|link| link.services()).unwrap_or_default(),
        }
    }

    fn link_lost(&self, reason: &str) -> Error {
        Error::LinkLost {
            address: self.config.address.clone(),
            reason: reason.to_string(),
        }
    }

    fn not_connected(&self) -> Error {
        Error::NotConnected(format!("Peripheral {} not connected.", self.config.address))
    }

    // Fails everything that depended on the current link
    fn teardown_link_dependents(&self, reason: &str) {
        self.queue.drain(|| self.link_lost(reason), &self.notifications);
        self.notifications.clear(|| self.link_lost(reason));
        self.channels.close_all();
    }

    /// Starts connecting to the peripheral, replacing any existing
    /// connection.
    ///
    /// The returned stream yields the discovered [`PeripheralInfo`] each
    /// time the connection is (re)established, and errors for failed
    /// attempts. It ends after a terminal failure, or without an error if
    /// `disconnect()` is called. With `auto_connect` the stream stays
    /// open across failures while the platform keeps trying to reconnect.
    pub fn connect(&self, auto_connect: bool) -> mpsc::UnboundedReceiver<Result<PeripheralInfo>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut link_state = self.link_state.lock().unwrap();
        link_state.abort_retry();
        link_state.retries = 0;
        self.connect_locked(&mut link_state, auto_connect, Some(tx));
        rx
    }

    fn connect_locked(&self, link_state: &mut LinkState, auto_connect: bool,
                      caller: Option<ConnectSink>) {
        if let Some(sink) = caller {
            link_state.connect_sink = Some(sink);
        }
        link_state.abort_refresh(
            Error::Other(anyhow!("refreshDeviceCache aborted due to new connect call")));

        link_state.release_link(true);
        self.teardown_link_dependents(DISCONNECTED_REASON);

        let generation = link_state.next_generation();
        link_state.auto_connect = auto_connect;
        link_state.state = ConnectionState::Connecting;

        info!("Connecting to {} (auto_connect={}, generation={})",
              self.config.address, auto_connect, generation);
        let events = LinkEvents::new(generation, self.backend_bus.clone());
        match self.backend.connect_gatt(&self.config.address, auto_connect, events) {
            Ok(link) => {
                link_state.link = Some(link);
            }
            Err(err) => {
                warn!("Failed to start connecting to {}: {:?}", self.config.address, err);
                link_state.state = ConnectionState::Disconnected;
                link_state.report(Err(err), true);
            }
        }
    }

    fn retry_connect(&self, generation: u64) {
        let mut link_state = self.link_state.lock().unwrap();
        if link_state.generation != generation
           || link_state.state != ConnectionState::Connecting
           || link_state.link.is_some()
        {
            trace!("Dropping stale reconnect attempt for generation {}", generation);
            return;
        }
        link_state.retry_task = None;
        let auto_connect = link_state.auto_connect;
        self.connect_locked(&mut link_state, auto_connect, None);
    }

    /// Disconnects at the caller's request.
    ///
    /// The link is disconnected and closed straight away, the connect
    /// stream ends without an error, queued commands fail and all channels
    /// are closed. Any later events from the old link are ignored.
    pub fn disconnect(&self) {
        let mut link_state = self.link_state.lock().unwrap();
        info!("Disconnecting from {}", self.config.address);

        link_state.abort_retry();
        link_state.abort_refresh(self.link_lost(DISCONNECTED_REASON));
        link_state.retries = 0;
        link_state.connect_sink = None;

        link_state.state = ConnectionState::Disconnecting;
        link_state.release_link(true);
        link_state.next_generation();
        self.teardown_link_dependents(DISCONNECTED_REASON);
        link_state.state = ConnectionState::Disconnected;
    }

    fn on_link_connected(&self, generation: u64) -> Result<()> {
        let mut link_state = self.link_state.lock().unwrap();
        if link_state.generation != generation {
            return Ok(());
        }

        let state = link_state.state;
        match state {
            ConnectionState::Connecting => {}
            // The platform reconnected a link we kept for auto_connect
            ConnectionState::Disconnected if link_state.auto_connect && link_state.link.is_some() => {
                link_state.state = ConnectionState::Connecting;
            }
            _ => {
                warn!("Spurious, unbalanced/redundant Connected notification from backend");
                return Ok(());
            }
        }

        trace!("Link to {} connected, discovering services", self.config.address);
        let link = link_state.link.clone().ok_or(Error::NoConnection)?;
        if let Err(err) = link.discover_services() {
            debug!("Failed to start service discovery: {:?}", err);
            self.peripheral_disconnected(&mut link_state, "Service discovery failed");
        }
        Ok(())
    }

    // Terminal loss of the connection, as opposed to a platform disconnect
    // that might be retried
    fn peripheral_disconnected(&self, link_state: &mut LinkState, reason: &str) {
        link_state.abort_refresh(self.link_lost(reason));
        link_state.release_link(true);
        self.teardown_link_dependents(reason);
        link_state.state = ConnectionState::Disconnected;
        link_state.retries = 0;
        link_state.report(Err(self.link_lost(reason)), true);
    }

    fn on_services_discovered(&self, generation: u64, status: GattStatus) -> Result<()> {
        let mut link_state = self.link_state.lock().unwrap();
        if link_state.generation != generation {
            return Ok(());
        }

        match link_state.state {
            ConnectionState::Connecting | ConnectionState::Connected { services_discovered: false } => {}
            _ => {
                warn!("Spurious ServicesDiscovered notification from backend (state={:?})",
                      link_state.state);
                return Ok(());
            }
        }

        if status.is_success() {
            trace!("Services discovered for {}", self.config.address);
            link_state.state = ConnectionState::Connected { services_discovered: true };
            link_state.retries = 0;
            let info = self.build_info(link_state.link.as_deref());
            link_state.deliver_discovery(info);
        } else {
            debug!("Service discovery failed for {}, status={}", self.config.address, status);
            if let Some(sink) = link_state.refresh_sink.take() {
                sink.resolve(Err(Error::operation_failed("Service refresh", status)));
            }
            self.peripheral_disconnected(&mut link_state, "Service discovery failed");
        }
        Ok(())
    }

    fn on_link_disconnected(&self, generation: u64, status: GattStatus) -> Result<()> {
        let mut link_state = self.link_state.lock().unwrap();
        if link_state.generation != generation || link_state.link.is_none() {
            trace!("Ignoring disconnect for a released link");
            return Ok(());
        }

        info!("{} disconnected, status={}", self.config.address, status);
        link_state.abort_refresh(self.link_lost(DISCONNECTED_REASON));
        self.teardown_link_dependents(DISCONNECTED_REASON);

        let retry = &self.retry;
        if retry.should_retry(status, link_state.retries, self.name()) {
            link_state.retries += 1;
            link_state.release_link(false);
            link_state.state = ConnectionState::Connecting;

            debug!("Retrying connection to {} ({}/{}) in {:?}",
                   self.config.address, link_state.retries, retry.max_attempts, retry.delay);
            let delay = retry.delay;
            let weak_session = Arc::downgrade(&self.inner);
            link_state.retry_task = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak_session.upgrade() {
                    Session::wrap(inner).retry_connect(generation);
                }
            }));
            return Ok(());
        }

        link_state.retries = 0;
        link_state.state = ConnectionState::Disconnected;
        // With auto_connect the platform keeps trying on the same link
        if !link_state.auto_connect {
            link_state.release_link(false);
        }
        link_state.report(Err(self.link_lost(DISCONNECTED_REASON)), true);
        Ok(())
    }

    fn on_command_completion(&self, event: BackendEvent) {
        if let BackendEvent::RssiRead { rssi, status } = &event {
            if status.is_success() {
                *self.rssi.lock().unwrap() = Some(*rssi);
            }
        }
        if self.queue.complete(&event, &self.notifications) {
            self.process_commands();
        }
    }

    // Commands are only ever dispatched on a connected link
    fn current_link(&self) -> Option<Arc<dyn GattLink>> {
        let link_state = self.link_state.lock().unwrap();
        if link_state.is_connected() {
            link_state.link.clone()
        } else {
            None
        }
    }

    fn process_commands(&self) {
        self.queue.process(|| self.current_link(), &self.notifications);
    }

    fn submit(&self, command: Command) {
        self.queue.enqueue(command);
        self.process_commands();
    }

    fn resolve_characteristic<F>(&self, service: Uuid, characteristic: Uuid, find: F)
                                 -> Result<CharacteristicInfo>
        where F: Fn(&ServiceInfo, Uuid) -> Option<&CharacteristicInfo>
    {
        let link = {
            let link_state = self.link_state.lock().unwrap();
            if !link_state.is_connected() {
                return Err(self.not_connected());
            }
            link_state.link.clone().ok_or(Error::NoConnection)?
        };

        let services = link.services();
        let service_info = services.iter()
                                   .find(|s| s.uuid == service)
                                   .ok_or_else(|| {
                                       Error::NotFound(format!("Service {}", service.to_short_string()))
                                   })?;
        find(service_info, characteristic).cloned().ok_or_else(|| {
            Error::NotFound(format!("Characteristic {}", characteristic.to_short_string()))
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.link_state.lock().unwrap().is_connected() {
            Ok(())
        } else {
            Err(self.not_connected())
        }
    }

    /// Queues a read of a characteristic, preferring one with the READ
    /// property if the uuid appears more than once.
    pub fn read(&self, service: Uuid, characteristic: Uuid) -> PendingResult<Vec<u8>> {
        let found = self.resolve_characteristic(service, characteristic,
                                                ServiceInfo::find_readable_characteristic);
        let target = match found {
            Ok(info) => info.key(service),
            Err(err) => return PendingResult::ready(Err(err)),
        };
        let (sink, pending) = pending();
        self.submit(Command::Read { target, sink });
        pending
    }

    pub fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8], write_type: WriteType)
                 -> PendingResult<()> {
        let found = self.resolve_characteristic(service, characteristic, |s, uuid| {
            s.find_writable_characteristic(uuid, write_type)
        });
        let target = match found {
            Ok(info) => info.key(service),
            Err(err) => return PendingResult::ready(Err(err)),
        };
        let (sink, pending) = pending();
        self.submit(Command::Write { target, value: value.to_vec(), write_type, sink });
        pending
    }

    /// Queues enabling notifications (or indications, if that's all the
    /// characteristic supports).
    ///
    /// The first result resolves once the peripheral has acknowledged the
    /// CCCD write; values then arrive on the stream until unsubscribing or
    /// disconnecting.
    pub fn subscribe(&self, service: Uuid, characteristic: Uuid)
                     -> (PendingResult<()>, mpsc::UnboundedReceiver<Notification>) {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let found = self.resolve_characteristic(service, characteristic,
                                                ServiceInfo::find_notify_characteristic);
        let info = match found {
            Ok(info) => info,
            Err(err) => return (PendingResult::ready(Err(err)), stream_rx),
        };

        let enable_value = if info.properties.contains(CharacteristicProperties::NOTIFY) {
            ENABLE_NOTIFICATION_VALUE
        } else {
            ENABLE_INDICATION_VALUE
        };
        let (sink, pending) = pending();
        self.submit(Command::Subscribe {
            target: info.key(service),
            enable_value,
            has_cccd: info.has_descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION),
            sink,
            stream: stream_tx,
        });
        (pending, stream_rx)
    }

    pub fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> PendingResult<()> {
        let found = self.resolve_characteristic(service, characteristic,
                                                ServiceInfo::find_notify_characteristic);
        let info = match found {
            Ok(info) => info,
            Err(err) => return PendingResult::ready(Err(err)),
        };
        let (sink, pending) = pending();
        self.submit(Command::Unsubscribe {
            target: info.key(service),
            has_cccd: info.has_descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION),
            sink,
        });
        pending
    }

    pub fn read_rssi(&self) -> PendingResult<i16> {
        if let Err(err) = self.ensure_connected() {
            return PendingResult::ready(Err(err));
        }
        let (sink, pending) = pending();
        self.submit(Command::ReadRssi { sink });
        pending
    }

    /// Queues an MTU negotiation, resolving to the MTU the peripheral
    /// agreed to.
    pub fn request_mtu(&self, mtu: u16) -> PendingResult<u16> {
        if let Err(err) = self.ensure_connected() {
            return PendingResult::ready(Err(err));
        }
        let (sink, pending) = pending();
        self.submit(Command::RequestMtu { mtu, sink });
        pending
    }

    /// A hint to the platform; ignored if not connected.
    pub fn request_connection_priority(&self, priority: ConnectionPriority) {
        let link_state = self.link_state.lock().unwrap();
        match (&link_state.link, link_state.is_connected()) {
            (Some(link), true) => {
                if let Err(err) = link.request_connection_priority(priority) {
                    debug!("Connection priority request failed: {:?}", err);
                }
            }
            _ => trace!("Ignoring connection priority request while not connected"),
        }
    }

    /// Drops the platform's attribute cache and rediscovers services after
    /// `delay`.
    ///
    /// The rediscovered services are delivered here rather than to the
    /// connect stream. A new `connect()` aborts a pending refresh.
    pub fn refresh_device_cache(&self, delay: Duration) -> PendingResult<PeripheralInfo> {
        let mut link_state = self.link_state.lock().unwrap();
        let link = match (&link_state.link, link_state.is_connected()) {
            (Some(link), true) => link.clone(),
            _ => return PendingResult::ready(Err(self.not_connected())),
        };
        link_state.abort_refresh(
            Error::Other(anyhow!("refreshDeviceCache superseded by a new call")));

        if let Err(err) = link.refresh() {
            debug!("Failed to refresh device cache: {:?}", err);
            return PendingResult::ready(Err(Error::Other(anyhow!("Service refresh failed"))));
        }

        let (sink, pending) = pending();
        link_state.refresh_sink = Some(sink);
        link_state.state = ConnectionState::Connected { services_discovered: false };

        let generation = link_state.generation;
        let weak_session = Arc::downgrade(&self.inner);
        link_state.refresh_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak_session.upgrade() {
                Session::wrap(inner).rediscover(generation);
            }
        }));
        pending
    }

    fn rediscover(&self, generation: u64) {
        let mut link_state = self.link_state.lock().unwrap();
        if link_state.generation != generation {
            return;
        }
        link_state.refresh_task = None;
        let started = match &link_state.link {
            Some(link) => link.discover_services(),
            None => Err(Error::NoConnection),
        };
        if let Err(err) = started {
            debug!("Failed to start service rediscovery: {:?}", err);
            link_state.state = ConnectionState::Connected { services_discovered: true };
            if let Some(sink) = link_state.refresh_sink.take() {
                sink.resolve(Err(Error::Other(anyhow!("Service refresh failed"))));
            }
        }
    }

    /// Opens a channel to `psm`, replacing any socket already open for it.
    pub async fn open_channel(&self, psm: u16, secure: bool) -> Result<OpenedChannel> {
        self.channels.open(&*self.backend, &self.config.address, psm, secure).await
    }

    pub fn close_channel(&self, psm: u16) {
        self.channels.close(psm);
    }

    pub async fn write_channel(&self, psm: u16, bytes: &[u8]) -> Result<()> {
        self.channels.write(psm, bytes).await
    }

    /// Registers the stream that receives inbound data for `psm`,
    /// replacing any previously registered one. Data that arrives while
    /// nothing is registered is dropped.
    pub fn read_channel(&self, psm: u16) -> mpsc::UnboundedReceiver<Vec<u8>> {
        self.channels.read(psm)
    }

    pub fn is_channel_open(&self, psm: u16) -> bool {
        self.channels.is_open(psm)
    }

    async fn run_backend_task(weak_session_inner: Weak<SessionInner>,
                              backend_bus: mpsc::UnboundedReceiver<(u64, BackendEvent)>) {
        trace!("Starting task to process backend events from the backend_bus...");

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(backend_bus);
        tokio::pin!(stream);
        while let Some((generation, event)) = stream.next().await {
            // We only hold a strong reference back to the Session while we're
            // processing a backend event otherwise we would be holding a circular reference...
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Exiting backend event processor task since Session has been dropped");
                    break;
                }
            };

            if session.link_state.lock().unwrap().generation != generation {
                trace!("Ignoring event from stale link (generation {}): {:?}", generation, event);
                continue;
            }

            trace!("Backend event: {:?}", event);
            match event {
                BackendEvent::Connected => {
                    if let Err(err) = session.on_link_connected(generation) {
                        log::error!("Error handling link connected event: {:?}", err);
                    }
                }
                BackendEvent::Disconnected { status } => {
                    if let Err(err) = session.on_link_disconnected(generation, status) {
                        log::error!("Error handling link disconnected event: {:?}", err);
                    }
                }
                BackendEvent::ServicesDiscovered { status } => {
                    if let Err(err) = session.on_services_discovered(generation, status) {
                        log::error!("Error handling services discovered event: {:?}", err);
                    }
                }
                BackendEvent::CharacteristicChanged { target, value } => {
                    session.notifications.forward(&target, value);
                }
                event => session.on_command_completion(event),
            }
        }

        trace!("Finished task processing backend events from the backend_bus");
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        !self.queue.is_processing() && self.queue.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.notifications.len()
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
