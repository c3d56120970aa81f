use serde::{Deserialize, Serialize};

/// Signal from the platform's network-status plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl From<bool> for NetworkStatus {
    fn from(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }
}

/// Connectivity flag plus echo-probe bookkeeping.
///
/// Owned by the dispatcher; nothing else mutates it.
#[derive(Debug)]
pub(crate) struct Connectivity {
    online: bool,
    probe_in_flight: bool,
}

impl Connectivity {
    pub(crate) fn new() -> Self {
        Self {
            online: true,
            probe_in_flight: false,
        }
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online
    }

    pub(crate) fn probe_in_flight(&self) -> bool {
        self.probe_in_flight
    }

    /// Returns whether the flag actually changed.
    pub(crate) fn mark_offline(&mut self) -> bool {
        let changed = self.online;
        self.online = false;
        changed
    }

    /// Sets the flag and claims the probe slot. Returns `true` when the
    /// caller must launch a probe; `false` when one is already outstanding.
    pub(crate) fn mark_online(&mut self) -> bool {
        self.online = true;
        if self.probe_in_flight {
            return false;
        }
        self.probe_in_flight = true;
        true
    }

    pub(crate) fn probe_finished(&mut self) {
        self.probe_in_flight = false;
    }
}
