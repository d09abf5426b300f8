use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{trace, warn};
use tokio::sync::mpsc;

use crate::backend::{BackendEvent, GattLink};
use crate::characteristic::{CharacteristicKey, WriteType};
use crate::descriptor::{CLIENT_CHARACTERISTIC_CONFIGURATION, DISABLE_NOTIFICATION_VALUE};
use crate::notification::{Notification, NotificationRegistry};
use crate::pending::ResultSink;
use crate::uuid::BluetoothUuid;
use crate::{Error, Result};

/// One GATT request waiting for its turn on the link.
///
/// Targets have already been resolved against the discovered attribute
/// table by the time a command is queued.
#[derive(Debug)]
pub(crate) enum Command {
    Read {
        target: CharacteristicKey,
        sink: ResultSink<Vec<u8>>,
    },
    Write {
        target: CharacteristicKey,
        value: Vec<u8>,
        write_type: WriteType,
        sink: ResultSink<()>,
    },
    Subscribe {
        target: CharacteristicKey,
        // Notify or indicate enable value for the CCCD
        enable_value: [u8; 2],
        has_cccd: bool,
        sink: ResultSink<()>,
        stream: mpsc::UnboundedSender<Notification>,
    },
    Unsubscribe {
        target: CharacteristicKey,
        has_cccd: bool,
        sink: ResultSink<()>,
    },
    ReadRssi {
        sink: ResultSink<i16>,
    },
    RequestMtu {
        mtu: u16,
        sink: ResultSink<u16>,
    },
}

impl Command {
    pub(crate) fn fail(self, err: Error) {
        match self {
            Command::Read { sink, .. } => sink.resolve(Err(err)),
            Command::Write { sink, .. } => sink.resolve(Err(err)),
            Command::Subscribe { sink, .. } => sink.resolve(Err(err)),
            Command::Unsubscribe { sink, .. } => sink.resolve(Err(err)),
            Command::ReadRssi { sink } => sink.resolve(Err(err)),
            Command::RequestMtu { sink, .. } => sink.resolve(Err(err)),
        }
    }
}

/// The request currently occupying the link, waiting on its completion
/// event. Subscriptions keep their sink in the notification registry.
#[derive(Debug)]
enum InFlight {
    Read {
        target: CharacteristicKey,
        sink: ResultSink<Vec<u8>>,
    },
    Write {
        target: CharacteristicKey,
        sink: ResultSink<()>,
    },
    Subscribe {
        target: CharacteristicKey,
    },
    Unsubscribe {
        target: CharacteristicKey,
        sink: ResultSink<()>,
    },
    ReadRssi {
        sink: ResultSink<i16>,
    },
    RequestMtu {
        sink: ResultSink<u16>,
    },
}

impl InFlight {
    fn fail(self, err: Error, registry: &NotificationRegistry) {
        match self {
            InFlight::Read { sink, .. } => sink.resolve(Err(err)),
            InFlight::Write { sink, .. } => sink.resolve(Err(err)),
            InFlight::Subscribe { target } => registry.fail(&target, err),
            // Unsubscribing can't fail once the bookkeeping is gone
            InFlight::Unsubscribe { sink, .. } => sink.resolve(Ok(())),
            InFlight::ReadRssi { sink } => sink.resolve(Err(err)),
            InFlight::RequestMtu { sink } => sink.resolve(Err(err)),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Command>,
    in_flight: Option<InFlight>,

    // Bumped by every drain. A dispatcher that popped its command before a
    // drain no longer owns the admission flag.
    epoch: u64,
}

enum Dispatch {
    // The link has a request outstanding
    Awaiting,
    // The command resolved without occupying the link
    Done,
    // A drain happened while dispatching
    Drained,
}

/// FIFO executor that keeps at most one request outstanding on the link.
///
/// Whoever wins the `processing` flag dispatches; everyone else just
/// appends. The flag stays set while a request is in flight and is only
/// released by its completion (or by `drain`). It is only ever released
/// while holding the state lock.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    state: Mutex<QueueState>,
    processing: AtomicBool,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&self, command: Command) {
        trace!("Queueing command: {:?}", command);
        self.state.lock().unwrap().pending.push_back(command);
    }

    #[cfg(test)]
    pub(crate) fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    fn try_admit(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // Borrowing the locked state keeps releases ordered with `epoch`
    fn release(&self, _state: &QueueState) {
        self.processing.store(false, Ordering::Release);
    }

    /// Dispatches queued commands until one is left waiting on the link or
    /// the queue is empty. Returns immediately if another caller is already
    /// dispatching or a command is in flight.
    ///
    /// `current_link` returns `None` unless the peripheral is connected, in
    /// which case the command fails with [`Error::NoConnection`].
    pub(crate) fn process<F>(&self, current_link: F, registry: &NotificationRegistry)
        where F: Fn() -> Option<Arc<dyn GattLink>>
    {
        loop {
            if !self.try_admit() {
                return;
            }

            let (command, epoch) = {
                let mut state = self.state.lock().unwrap();
                match state.pending.pop_front() {
                    Some(command) => (command, state.epoch),
                    None => {
                        // Anything queued after this point is dispatched by
                        // whoever queued it
                        self.release(&state);
                        return;
                    }
                }
            };

            let dispatch = match current_link() {
                Some(link) => self.execute(command, epoch, &*link, registry),
                None => {
                    command.fail(Error::NoConnection);
                    Dispatch::Done
                }
            };
            match dispatch {
                Dispatch::Awaiting | Dispatch::Drained => return,
                Dispatch::Done => {
                    let state = self.state.lock().unwrap();
                    if state.epoch != epoch {
                        return;
                    }
                    self.release(&state);
                }
            }
        }
    }

    // The in-flight record is stored before the request is issued since the
    // completion may be handled on the backend task before the link call
    // returns here.
    fn issue<F>(&self, in_flight: InFlight, epoch: u64, registry: &NotificationRegistry,
                request: F) -> Dispatch
        where F: FnOnce() -> Result<()>
    {
        {
            let mut state = self.state.lock().unwrap();
            if state.epoch != epoch {
                drop(state);
                trace!("Queue drained while dispatching {:?}", in_flight);
                in_flight.fail(Error::NoConnection, registry);
                return Dispatch::Drained;
            }
            if let Some(stale) = state.in_flight.replace(in_flight) {
                warn!("Dispatching over a command that never completed: {:?}", stale);
            }
        }
        match request() {
            Ok(()) => Dispatch::Awaiting,
            Err(err) => {
                let in_flight = self.state.lock().unwrap().in_flight.take();
                match in_flight {
                    Some(in_flight) => {
                        in_flight.fail(err, registry);
                        Dispatch::Done
                    }
                    // Already failed by a drain
                    None => Dispatch::Drained,
                }
            }
        }
    }

    fn execute(&self, command: Command, epoch: u64, link: &dyn GattLink,
               registry: &NotificationRegistry) -> Dispatch {
        trace!("Dispatching command: {:?}", command);
        match command {
            Command::Read { target, sink } => {
                self.issue(InFlight::Read { target, sink }, epoch, registry,
                           || link.read_characteristic(&target))
            }
            Command::Write { target, value, write_type, sink } => {
                self.issue(InFlight::Write { target, sink }, epoch, registry,
                           || link.write_characteristic(&target, &value, write_type))
            }
            Command::Subscribe { target, enable_value, has_cccd, sink, stream } => {
                let name = target.characteristic.to_short_string();
                if let Err(err) = link.set_characteristic_notification(&target, true) {
                    trace!("set_characteristic_notification failed: {:?}", err);
                    sink.resolve(Err(Error::Other(anyhow::anyhow!(
                        "Failed to register notification for {}", name))));
                    return Dispatch::Done;
                }
                if !has_cccd {
                    if let Err(err) = link.set_characteristic_notification(&target, false) {
                        trace!("Failed to disable notification delivery: {:?}", err);
                    }
                    sink.resolve(Err(Error::Other(anyhow::anyhow!(
                        "Set notification failed for {}", name))));
                    return Dispatch::Done;
                }

                registry.begin(target, sink, stream);
                self.issue(InFlight::Subscribe { target }, epoch, registry, || {
                    link.write_descriptor(&target, CLIENT_CHARACTERISTIC_CONFIGURATION, &enable_value)
                        .map_err(|_| Error::Other(anyhow::anyhow!(
                            "Failed to set client characteristic notification for {}", name)))
                })
            }
            Command::Unsubscribe { target, has_cccd, sink } => {
                registry.remove(&target);
                if let Err(err) = link.set_characteristic_notification(&target, false) {
                    trace!("Ignoring failure to disable notification delivery: {:?}", err);
                }
                if !has_cccd {
                    sink.resolve(Ok(()));
                    return Dispatch::Done;
                }
                self.issue(InFlight::Unsubscribe { target, sink }, epoch, registry, || {
                    link.write_descriptor(&target, CLIENT_CHARACTERISTIC_CONFIGURATION,
                                          &DISABLE_NOTIFICATION_VALUE)
                })
            }
            Command::ReadRssi { sink } => {
                self.issue(InFlight::ReadRssi { sink }, epoch, registry, || link.read_remote_rssi())
            }
            Command::RequestMtu { mtu, sink } => {
                self.issue(InFlight::RequestMtu { sink }, epoch, registry, || link.request_mtu(mtu))
            }
        }
    }

    /// Resolves the in-flight command if `event` is its completion.
    ///
    /// Returns true if a command completed, in which case the admission
    /// flag has been released and the caller should `process()` again.
    pub(crate) fn complete(&self, event: &BackendEvent, registry: &NotificationRegistry) -> bool {
        let in_flight = {
            let mut state = self.state.lock().unwrap();
            let matches = match (&state.in_flight, event) {
                (Some(InFlight::Read { target, .. }),
                 BackendEvent::CharacteristicRead { target: completed, .. }) => target == completed,
                (Some(InFlight::Write { target, .. }),
                 BackendEvent::CharacteristicWritten { target: completed, .. }) => target == completed,
                (Some(InFlight::Subscribe { target }),
                 BackendEvent::DescriptorWritten { target: completed, descriptor, .. }) |
                (Some(InFlight::Unsubscribe { target, .. }),
                 BackendEvent::DescriptorWritten { target: completed, descriptor, .. }) => {
                    target == completed && *descriptor == CLIENT_CHARACTERISTIC_CONFIGURATION
                }
                (Some(InFlight::ReadRssi { .. }), BackendEvent::RssiRead { .. }) => true,
                (Some(InFlight::RequestMtu { .. }), BackendEvent::MtuChanged { .. }) => true,
                _ => false,
            };
            if !matches {
                if let BackendEvent::MtuChanged { .. } = event {
                    trace!("Unsolicited MTU change: {:?}", event);
                } else {
                    warn!("Spurious completion that doesn't match the in-flight command: {:?}",
                          event);
                }
                return false;
            }
            self.release(&state);
            state.in_flight.take()
        };

        match (in_flight, event) {
            (Some(InFlight::Read { sink, .. }), BackendEvent::CharacteristicRead { status, value, .. }) => {
                if status.is_success() {
                    sink.resolve(Ok(value.clone()));
                } else {
                    sink.resolve(Err(Error::operation_failed("Read", *status)));
                }
            }
            (Some(InFlight::Write { sink, .. }), BackendEvent::CharacteristicWritten { status, .. }) => {
                if status.is_success() {
                    sink.resolve(Ok(()));
                } else {
                    sink.resolve(Err(Error::operation_failed("Write", *status)));
                }
            }
            (Some(InFlight::Subscribe { target }), BackendEvent::DescriptorWritten { status, .. }) => {
                registry.confirm(&target, *status);
            }
            (Some(InFlight::Unsubscribe { sink, .. }), BackendEvent::DescriptorWritten { status, .. }) => {
                if !status.is_success() {
                    trace!("Ignoring failed CCCD disable write, status={}", status);
                }
                sink.resolve(Ok(()));
            }
            (Some(InFlight::ReadRssi { sink }), BackendEvent::RssiRead { rssi, status }) => {
                if status.is_success() {
                    sink.resolve(Ok(*rssi));
                } else {
                    sink.resolve(Err(Error::operation_failed("Read RSSI", *status)));
                }
            }
            (Some(InFlight::RequestMtu { sink }), BackendEvent::MtuChanged { mtu, status }) => {
                if status.is_success() {
                    sink.resolve(Ok(*mtu));
                } else {
                    sink.resolve(Err(Error::operation_failed("Request MTU", *status)));
                }
            }
            (in_flight, _) => {
                // Matched above, so unreachable unless the match arms drift apart
                warn!("Completion handling mismatch for {:?}", in_flight);
            }
        }
        true
    }

    /// Fails every queued and in-flight command and returns to idle.
    pub(crate) fn drain(&self, reason: impl Fn() -> Error, registry: &NotificationRegistry) {
        let (pending, in_flight) = {
            let mut state = self.state.lock().unwrap();
            state.epoch += 1;
            self.release(&state);
            (std::mem::take(&mut state.pending), state.in_flight.take())
        };
        if !pending.is_empty() || in_flight.is_some() {
            trace!("Draining {} queued commands (in flight: {})",
                   pending.len(), in_flight.is_some());
        }

        if let Some(in_flight) = in_flight {
            match in_flight {
                // Unlike a failed write, a lost link still errors an unsubscribe
                InFlight::Unsubscribe { sink, .. } => sink.resolve(Err(reason())),
                in_flight => in_flight.fail(reason(), registry),
            }
        }
        for command in pending {
            command.fail(reason());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LinkEvents};
    use crate::fake::{FakeBackend, FakeRequest};
    use crate::pending::{pending, PendingResult};
    use crate::uuid::uuid_from_u16;
    use crate::{Address, GattStatus};
    use std::str::FromStr;

    fn key(characteristic: u16) -> CharacteristicKey {
        CharacteristicKey {
            service: uuid_from_u16(0x180D),
            characteristic: uuid_from_u16(characteristic),
            instance: 0,
        }
    }

    fn connected_link(backend: &FakeBackend) -> Arc<dyn GattLink> {
        let (bus, _rx) = mpsc::unbounded_channel();
        let address = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
        let link = backend.connect_gatt(&address, false, LinkEvents::new(1, bus)).unwrap();
        assert_eq!(backend.try_next_request(), Some(FakeRequest::Connect { auto_connect: false }));
        link
    }

    fn read(queue: &CommandQueue, target: CharacteristicKey) -> PendingResult<Vec<u8>> {
        let (sink, result) = pending();
        queue.enqueue(Command::Read { target, sink });
        result
    }

    #[tokio::test]
    async fn one_outstanding_in_fifo_order() {
        let backend = FakeBackend::new(vec![]);
        let link = connected_link(&backend);
        let queue = CommandQueue::new();
        let registry = NotificationRegistry::new();

        let first = read(&queue, key(0x2A37));
        let second = read(&queue, key(0x2A38));
        queue.process(|| Some(link.clone()), &registry);

        assert_eq!(backend.try_next_request(), Some(FakeRequest::Read(key(0x2A37))));
        assert_eq!(backend.try_next_request(), None);
        assert!(queue.is_processing());
        assert_eq!(queue.len(), 1);

        // Nothing else is dispatched while a request is outstanding
        queue.process(|| Some(link.clone()), &registry);
        assert_eq!(backend.try_next_request(), None);

        // A completion for some other characteristic doesn't release the link
        let stray = BackendEvent::CharacteristicRead {
            target: key(0x2A38),
            status: GattStatus::SUCCESS,
            value: vec![],
        };
        assert!(!queue.complete(&stray, &registry));

        let completed = BackendEvent::CharacteristicRead {
            target: key(0x2A37),
            status: GattStatus::SUCCESS,
            value: vec![72],
        };
        assert!(queue.complete(&completed, &registry));
        queue.process(|| Some(link.clone()), &registry);
        assert_eq!(backend.try_next_request(), Some(FakeRequest::Read(key(0x2A38))));
        assert_eq!(first.await.unwrap(), vec![72]);

        let failed = BackendEvent::CharacteristicRead {
            target: key(0x2A38),
            status: GattStatus::GATT_ERROR,
            value: vec![],
        };
        assert!(queue.complete(&failed, &registry));
        assert!(matches!(second.await, Err(Error::OperationFailed { .. })));
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn missing_link_fails_each_command_and_advances() {
        let queue = CommandQueue::new();
        let registry = NotificationRegistry::new();
        let first = read(&queue, key(0x2A37));
        let second = read(&queue, key(0x2A38));

        queue.process(|| None, &registry);

        assert!(matches!(first.await, Err(Error::NoConnection)));
        assert!(matches!(second.await, Err(Error::NoConnection)));
        assert!(!queue.is_processing());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn drain_during_dispatch_keeps_link_idle() {
        let backend = FakeBackend::new(vec![]);
        let link = connected_link(&backend);
        let queue = CommandQueue::new();
        let registry = NotificationRegistry::new();

        let first = read(&queue, key(0x2A37));
        // The link goes away after the command was popped but before it's issued
        queue.process(|| {
            queue.drain(|| Error::NoConnection, &registry);
            Some(link.clone())
        }, &registry);

        assert!(matches!(first.await, Err(Error::NoConnection)));
        assert_eq!(backend.try_next_request(), None);
        assert!(!queue.is_processing());

        // The queue is usable again
        let _second = read(&queue, key(0x2A38));
        queue.process(|| Some(link.clone()), &registry);
        assert_eq!(backend.try_next_request(), Some(FakeRequest::Read(key(0x2A38))));
        assert!(queue.is_processing());
    }

    #[tokio::test]
    async fn subscribe_without_cccd_disables_delivery() {
        let backend = FakeBackend::new(vec![]);
        let link = connected_link(&backend);
        let queue = CommandQueue::new();
        let registry = NotificationRegistry::new();

        let (sink, subscribed) = pending();
        let (stream, _values) = mpsc::unbounded_channel();
        queue.enqueue(Command::Subscribe {
            target: key(0x2A39),
            enable_value: [1, 0],
            has_cccd: false,
            sink,
            stream,
        });
        queue.process(|| Some(link.clone()), &registry);

        assert!(subscribed.await.is_err());
        assert_eq!(backend.try_next_request(),
                   Some(FakeRequest::SetNotification { target: key(0x2A39), enable: true }));
        assert_eq!(backend.try_next_request(),
                   Some(FakeRequest::SetNotification { target: key(0x2A39), enable: false }));
        assert_eq!(registry.len(), 0);
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn drain_fails_queued_and_in_flight() {
        let backend = FakeBackend::new(vec![]);
        let link = connected_link(&backend);
        let queue = CommandQueue::new();
        let registry = NotificationRegistry::new();

        let in_flight = read(&queue, key(0x2A37));
        let queued = read(&queue, key(0x2A38));
        queue.process(|| Some(link.clone()), &registry);

        queue.drain(|| Error::Other(anyhow::anyhow!("gone")), &registry);
        assert!(matches!(in_flight.await, Err(Error::Other(_))));
        assert!(matches!(queued.await, Err(Error::Other(_))));
        assert!(!queue.is_processing());

        // A late completion for the drained read is ignored
        let late = BackendEvent::CharacteristicRead {
            target: key(0x2A37),
            status: GattStatus::SUCCESS,
            value: vec![],
        };
        assert!(!queue.complete(&late, &registry));
    }
}
