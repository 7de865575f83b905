use serde::{Deserialize, Serialize};

/// Capabilities of the observed cluster, gathered by the one-shot probe
/// before collectors are selected. A default (all-zero) record means the
/// probe failed or was skipped; collector selection treats that as
/// "change nothing".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub version: Version,
    /// Model name reported by the cluster, informational only.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub zapis_exist: bool,
    #[serde(default)]
    pub is_disaggregated: bool,
    #[serde(default)]
    pub is_san_optimized: bool,
    #[serde(default)]
    pub clustered: bool,
}

impl Remote {
    pub fn is_zero(&self) -> bool {
        *self == Remote::default()
    }
}

/// Release triple, e.g. `9.11.1`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |what: &str| -> Result<u16, String> {
            parts
                .next()
                .ok_or_else(|| format!("version {s:?} missing {what}"))?
                .parse::<u16>()
                .map_err(|e| format!("version {s:?}: {e}"))
        };
        Ok(Version {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch").unwrap_or(0),
        })
    }
}
