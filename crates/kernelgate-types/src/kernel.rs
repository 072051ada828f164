//! Kernel specification and identity types.
//!
//! A `KernelSpec` says *what* to launch: a kernelspec name known to the
//! gateway plus the launch environment. It is the pool key, so it is
//! `Eq + Hash` and the environment is ordered. A `KernelIdentity` is *which*
//! kernel the gateway started for us.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::KernelId;

/// What kind of kernel to request from the gateway.
///
/// Immutable once a session has been created from it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Kernelspec name (e.g., "python3", "sandbox-python").
    pub name: String,
    /// Environment variables passed to the kernel process at launch.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl KernelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: BTreeMap::new(),
        }
    }

    /// Add a single launch environment variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge launch environment variables. Later values win.
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// A kernel the gateway has accepted and started.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelIdentity {
    pub id: KernelId,
    /// Kernelspec name the gateway reports for this kernel.
    pub name: String,
}

/// A running kernel as reported by the gateway's listing endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: KernelId,
    pub name: String,
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub connections: u32,
}

/// A kernelspec the gateway can launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecInfo {
    pub name: String,
    pub display_name: String,
    pub language: String,
}

// ============================================================================
// Tests
// ============================================================================
