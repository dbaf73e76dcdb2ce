//! Wire types served by the in-guest agent.

use serde::{Deserialize, Serialize};

/// API group the guest agent serves its resources under.
pub const GUEST_API_GROUP: &str = "hearth.dev";

/// Phase the guest reports once it has finished booting.
pub const GUEST_PHASE_RUNNING: &str = "Running";

/// Path of the guest info resource for `name`.
pub fn guest_info_path(name: &str) -> String {
    format!("/apis/{GUEST_API_GROUP}/v1/guestinfos/{name}")
}

/// Guest self-description polled by the host agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfo {
    #[serde(default)]
    pub spec: GuestInfoSpec,
    #[serde(default)]
    pub status: GuestInfoStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfoSpec {
    /// Addresses assigned to guest interfaces, optionally in CIDR form.
    #[serde(default)]
    pub address: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInfoStatus {
    #[serde(default)]
    pub phase: String,
}

impl GuestInfo {
    pub fn is_running(&self) -> bool {
        self.status.phase == GUEST_PHASE_RUNNING
    }
}

/// Body of `GET /health` on both the guest agent and the local control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthy {
    pub status: String,
}

impl Healthy {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
