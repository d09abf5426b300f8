use dashmap::DashMap;
use log::{trace, warn};
use tokio::sync::mpsc;

use crate::characteristic::CharacteristicKey;
use crate::pending::ResultSink;
use crate::uuid::BluetoothUuid;
use crate::{Error, GattStatus};

/// One value pushed by the peripheral for a subscribed characteristic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub value: Vec<u8>,

    /// Counts up from zero for each value delivered to this subscription
    pub sequence: u64,
}

#[derive(Debug)]
enum SubscriptionState {
    // The enable value has been written to the CCCD but not acknowledged
    Pending(ResultSink<()>),
    Active,
}

#[derive(Debug)]
struct Subscription {
    state: SubscriptionState,
    stream: mpsc::UnboundedSender<Notification>,
    next_sequence: u64,
}

/// Tracks which characteristics have notifications enabled and where
/// their values should go.
#[derive(Debug, Default)]
pub(crate) struct NotificationRegistry {
    subscriptions: DashMap<CharacteristicKey, Subscription>,
}

impl NotificationRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a pending subscription just before the CCCD write is issued.
    pub(crate) fn begin(&self, target: CharacteristicKey, confirm: ResultSink<()>,
                        stream: mpsc::UnboundedSender<Notification>) {
        let subscription = Subscription {
            state: SubscriptionState::Pending(confirm),
            stream,
            next_sequence: 0,
        };
        if self.subscriptions.insert(target, subscription).is_some() {
            trace!("Replaced existing subscription for {}", target.characteristic.to_short_string());
        }
    }

    /// Drops a subscription that couldn't be set up, failing its confirmation.
    pub(crate) fn fail(&self, target: &CharacteristicKey, err: Error) {
        if let Some((_, subscription)) = self.subscriptions.remove(target) {
            if let SubscriptionState::Pending(confirm) = subscription.state {
                confirm.resolve(Err(err));
            }
        }
    }

    /// Handles the completion of the CCCD write for a pending subscription.
    pub(crate) fn confirm(&self, target: &CharacteristicKey, status: GattStatus) {
        if !status.is_success() {
            let err = Error::operation_failed(
                format!("Enable notification for {}", target.characteristic.to_short_string()),
                status);
            self.fail(target, err);
            return;
        }

        match self.subscriptions.get_mut(target) {
            Some(mut subscription) => {
                let state = std::mem::replace(&mut subscription.state, SubscriptionState::Active);
                match state {
                    SubscriptionState::Pending(confirm) => confirm.resolve(Ok(())),
                    SubscriptionState::Active => {
                        warn!("Spurious, redundant CCCD write confirmation for {:?}", target);
                    }
                }
            }
            None => warn!("Spurious CCCD write confirmation for unknown subscription {:?}", target),
        }
    }

    /// Returns whether there was a subscription to remove.
    pub(crate) fn remove(&self, target: &CharacteristicKey) -> bool {
        match self.subscriptions.remove(target) {
            Some((_, subscription)) => {
                if let SubscriptionState::Pending(confirm) = subscription.state {
                    confirm.resolve(Err(Error::Other(anyhow::anyhow!("Unsubscribed"))));
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn forward(&self, target: &CharacteristicKey, value: Vec<u8>) {
        match self.subscriptions.get_mut(target) {
            Some(mut subscription) => {
                if let SubscriptionState::Active = subscription.state {
                    let sequence = subscription.next_sequence;
                    subscription.next_sequence += 1;
                    // The low-level registration stays until the caller
                    // unsubscribes, even if they've dropped the stream
                    if subscription.stream.send(Notification { value, sequence }).is_err() {
                        trace!("Notification stream for {:?} closed by receiver", target);
                    }
                } else {
                    trace!("Dropping value for {:?} received before subscription confirmed", target);
                }
            }
            None => trace!("Ignoring value change for unsubscribed {:?}", target),
        }
    }

    /// Removes every subscription, failing any still waiting to be confirmed.
    /// Dropping the senders closes each caller's stream.
    pub(crate) fn clear(&self, reason: impl Fn() -> Error) {
        let targets: Vec<CharacteristicKey> =
            self.subscriptions.iter().map(|entry| *entry.key()).collect();
        for target in targets {
            self.fail(&target, reason());
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, target: &CharacteristicKey) -> bool {
        self.subscriptions.contains_key(target)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::pending;
    use crate::uuid::uuid_from_u16;

    fn heart_rate() -> CharacteristicKey {
        CharacteristicKey {
            service: uuid_from_u16(0x180d),
            characteristic: uuid_from_u16(0x2a37),
            instance: 0,
        }
    }

    #[tokio::test]
    async fn values_flow_only_once_active() {
        let registry = NotificationRegistry::new();
        let (sink, confirmed) = pending();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.begin(heart_rate(), sink, tx);

        registry.forward(&heart_rate(), vec![0]);
        registry.confirm(&heart_rate(), GattStatus::SUCCESS);
        confirmed.await.unwrap();

        registry.forward(&heart_rate(), vec![1]);
        registry.forward(&heart_rate(), vec![2]);
        assert_eq!(rx.recv().await.unwrap(), Notification { value: vec![1], sequence: 0 });
        assert_eq!(rx.recv().await.unwrap(), Notification { value: vec![2], sequence: 1 });

        registry.clear(|| Error::NoConnection);
        assert!(rx.recv().await.is_none());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn failed_cccd_write_removes_entry() {
        let registry = NotificationRegistry::new();
        let (sink, confirmed) = pending();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.begin(heart_rate(), sink, tx);
        assert!(registry.contains(&heart_rate()));

        registry.confirm(&heart_rate(), GattStatus::GATT_ERROR);
        assert!(matches!(confirmed.await, Err(Error::OperationFailed { .. })));
        assert!(!registry.contains(&heart_rate()));
        assert!(rx.recv().await.is_none());
        assert!(!registry.remove(&heart_rate()));
    }
}
