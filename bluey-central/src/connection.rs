use std::sync::Arc;
use std::time::Duration;

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::GattLink;
use crate::peripheral::PeripheralInfo;
use crate::pending::ResultSink;
use crate::{Error, GattStatus, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected {
        services_discovered: bool,
    },
    Disconnecting,
}

/// Governs automatic reconnection after a transient link error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The disconnect status that's considered worth retrying
    pub transient_status: GattStatus,
    pub max_attempts: u32,
    pub delay: Duration,

    /// If set, only devices whose name matches one of these regular
    /// expressions are retried
    pub retry_names: Option<Vec<String>>,

    /// Devices whose name matches any of these are never retried
    pub never_retry_names: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transient_status: GattStatus::GATT_ERROR,
            max_attempts: 2,
            delay: Duration::from_millis(100),
            retry_names: None,
            never_retry_names: vec![],
        }
    }
}

impl RetryPolicy {
    /// Compiles the name patterns, failing on any invalid expression.
    pub(crate) fn compile(&self) -> Result<RetryRules> {
        let compile_set = |patterns: &[String]| {
            RegexSet::new(patterns).map_err(|err| {
                Error::Other(anyhow::anyhow!("Invalid device name pattern in {:?}: {}", patterns, err))
            })
        };
        Ok(RetryRules {
            transient_status: self.transient_status,
            max_attempts: self.max_attempts,
            delay: self.delay,
            retry_names: match &self.retry_names {
                Some(patterns) => Some(compile_set(patterns.as_slice())?),
                None => None,
            },
            never_retry_names: compile_set(self.never_retry_names.as_slice())?,
        })
    }
}

/// A [`RetryPolicy`] with its name patterns compiled, built once per
/// session.
#[derive(Clone, Debug)]
pub(crate) struct RetryRules {
    pub(crate) transient_status: GattStatus,
    pub(crate) max_attempts: u32,
    pub(crate) delay: Duration,
    retry_names: Option<RegexSet>,
    never_retry_names: RegexSet,
}

impl RetryRules {
    pub(crate) fn is_eligible(&self, name: Option<&str>) -> bool {
        let name = name.unwrap_or("");
        if self.never_retry_names.is_match(name) {
            return false;
        }
        match &self.retry_names {
            Some(patterns) => patterns.is_match(name),
            None => true,
        }
    }

    /// Whether a disconnect with `status` should be retried given the
    /// number of retries already made for this connect request.
    pub(crate) fn should_retry(&self, status: GattStatus, attempts: u32, name: Option<&str>)
                               -> bool {
        status == self.transient_status && attempts < self.max_attempts && self.is_eligible(name)
    }
}

pub(crate) type ConnectSink = mpsc::UnboundedSender<Result<PeripheralInfo>>;

/// Everything about the physical connection that has to change atomically.
#[derive(Debug)]
pub(crate) struct LinkState {
    pub(crate) state: ConnectionState,
    pub(crate) link: Option<Arc<dyn GattLink>>,

    // Identifies the events belonging to `link`
    pub(crate) generation: u64,

    pub(crate) auto_connect: bool,
    pub(crate) retries: u32,

    // The caller's long-lived result stream from connect()
    pub(crate) connect_sink: Option<ConnectSink>,

    // A one-shot refresh_device_cache() waiting on rediscovery, which
    // takes precedence over `connect_sink`
    pub(crate) refresh_sink: Option<ResultSink<PeripheralInfo>>,

    pub(crate) retry_task: Option<JoinHandle<()>>,
    pub(crate) refresh_task: Option<JoinHandle<()>>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            link: None,
            generation: 0,
            auto_connect: false,
            retries: 0,
            connect_sink: None,
            refresh_sink: None,
            retry_task: None,
            refresh_task: None,
        }
    }
}

impl LinkState {
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    /// Closes and forgets the current link, if any.
    pub(crate) fn release_link(&mut self, disconnect: bool) {
        if let Some(link) = self.link.take() {
            if disconnect {
                link.disconnect();
            }
            link.close();
        }
    }

    pub(crate) fn abort_retry(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }

    pub(crate) fn abort_refresh(&mut self, err: Error) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        if let Some(sink) = self.refresh_sink.take() {
            sink.resolve(Err(err));
        }
    }

    /// Delivers to the connect stream. A terminal result also ends the
    /// stream, unless auto-connect is keeping it open for later attempts.
    pub(crate) fn report(&mut self, result: Result<PeripheralInfo>, terminal: bool) {
        if let Some(sink) = &self.connect_sink {
            let _ = sink.send(result);
        }
        if terminal && !self.auto_connect {
            self.connect_sink = None;
        }
    }

    /// Hands the discovery result to the refresh sink if one is waiting,
    /// otherwise to the connect stream.
    pub(crate) fn deliver_discovery(&mut self, info: PeripheralInfo) {
        self.refresh_task = None;
        match self.refresh_sink.take() {
            Some(sink) => sink.resolve(Ok(info)),
            None => self.report(Ok(info), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_cap_and_status() {
        let policy = RetryPolicy::default().compile().unwrap();
        assert!(policy.should_retry(GattStatus(133), 0, Some("Polar H10")));
        assert!(policy.should_retry(GattStatus(133), 1, Some("Polar H10")));
        assert!(!policy.should_retry(GattStatus(133), 2, Some("Polar H10")));
        assert!(!policy.should_retry(GattStatus(8), 0, Some("Polar H10")));
    }

    #[test]
    fn retry_name_patterns() {
        let policy = RetryPolicy {
            retry_names: Some(vec!["^Polar".to_string(), "Muse-[0-9A-F]{4}".to_string()]),
            never_retry_names: vec!["Polar OH1".to_string()],
            ..RetryPolicy::default()
        };
        let policy = policy.compile().unwrap();
        assert!(policy.is_eligible(Some("Polar H10")));
        assert!(policy.is_eligible(Some("Muse-4F2A")));
        assert!(!policy.is_eligible(Some("Polar OH1")));
        assert!(!policy.is_eligible(Some("Unknown")));
        assert!(!policy.is_eligible(None));

        let bad = RetryPolicy {
            never_retry_names: vec!["(".to_string()],
            ..RetryPolicy::default()
        };
        assert!(bad.compile().is_err());
    }

    #[tokio::test]
    async fn terminal_report_ends_stream_unless_auto() {
        let mut link_state = LinkState::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        link_state.connect_sink = Some(tx);
        link_state.report(Err(Error::NoConnection), true);
        assert!(matches!(rx.recv().await, Some(Err(Error::NoConnection))));
        assert!(rx.recv().await.is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        link_state.auto_connect = true;
        link_state.connect_sink = Some(tx);
        link_state.report(Err(Error::NoConnection), true);
        assert!(matches!(rx.recv().await, Some(Err(Error::NoConnection))));
        assert!(link_state.connect_sink.is_some());
    }
}
