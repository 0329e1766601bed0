use serde::{Deserialize, Serialize};

/// Which layers compute and verify payload checksums.
///
/// - `Transfer`: outgoing payloads carry a checksum the service verifies,
///   and reply payloads are verified on arrival.
/// - `Memory`: reply payloads are verified after landing in caller memory.
/// - `Storage`: outgoing payloads carry a checksum for the service to keep
///   alongside the stored data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumScope {
    None,
    #[default]
    Transfer,
    Memory,
    Storage,
    All,
}

impl ChecksumScope {
    /// Outgoing payloads get a checksum attached.
    pub fn signs_requests(self) -> bool {
        matches!(self, Self::Transfer | Self::Storage | Self::All)
    }

    /// Reply payloads are verified by the client.
    pub fn verifies_replies(self) -> bool {
        matches!(self, Self::Transfer | Self::Memory | Self::All)
    }

    /// The service is asked to persist the checksum with the data.
    pub fn covers_storage(self) -> bool {
        matches!(self, Self::Storage | Self::All)
    }
}

impl std::str::FromStr for ChecksumScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "transfer" => Ok(Self::Transfer),
            "memory" => Ok(Self::Memory),
            "storage" => Ok(Self::Storage),
            "all" => Ok(Self::All),
            other => Err(format!("unknown checksum scope '{other}'")),
        }
    }
}
