use std::{fmt, pin::Pin, str::FromStr};

use bytes::Bytes;
use futures::Stream;

use crate::{hash::ObjectHash, storage::StorageError};

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Client input that does not parse: bad pkt-lines, ids, commands or packs.
    #[error("protocol decode error: {0}")]
    Decode(String),

    #[error("invalid service: {0}")]
    InvalidService(String),

    /// Well-formed but unacceptable request, e.g. a want for an unknown object.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Building an outgoing pack failed.
    #[error("pack error: {0}")]
    Pack(String),
}

impl ProtocolError {
    pub fn decode(msg: impl fmt::Display) -> Self {
        ProtocolError::Decode(msg.to_string())
    }

    pub fn invalid_service(service: &str) -> Self {
        ProtocolError::InvalidService(service.to_string())
    }

    pub fn invalid_request(msg: impl fmt::Display) -> Self {
        ProtocolError::InvalidRequest(msg.to_string())
    }
}

/// Byte stream produced or consumed by the engine.
pub type ProtocolStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProtocolError>> + Send>>;

/// Wire binding a session runs over.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum TransportProtocol {
    /// Stateless request/response; advertisements carry the `# service=` preamble.
    #[default]
    Http,
    /// One connection-oriented exchange per channel.
    Ssh,
}

/// Git service types for smart protocol
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(Service::UploadPack),
            "git-receive-pack" => Ok(Service::ReceivePack),
            _ => Err(ProtocolError::InvalidService(s.to_string())),
        }
    }
}

/// Capabilities this server understands. Anything else a client sends is kept as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    SideBand,
    SideBand64k,
    OfsDelta,
    IncludeTag,
    NoProgress,
    ReportStatus,
    DeleteRefs,
    Quiet,
    NoThin,
    ThinPack,
    MultiAck,
    MultiAckDetailed,
    ObjectFormat(String),
    Agent(String),
    Unknown(String),
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parameterized capabilities
        if let Some(rest) = s.strip_prefix("agent=") {
            return Ok(Capability::Agent(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("object-format=") {
            return Ok(Capability::ObjectFormat(rest.to_string()));
        }

        match s {
            "side-band" => Ok(Capability::SideBand),
            "side-band-64k" => Ok(Capability::SideBand64k),
            "ofs-delta" => Ok(Capability::OfsDelta),
            "include-tag" => Ok(Capability::IncludeTag),
            "no-progress" => Ok(Capability::NoProgress),
            "report-status" => Ok(Capability::ReportStatus),
            "delete-refs" => Ok(Capability::DeleteRefs),
            "quiet" => Ok(Capability::Quiet),
            "no-thin" => Ok(Capability::NoThin),
            "thin-pack" => Ok(Capability::ThinPack),
            "multi_ack" => Ok(Capability::MultiAck),
            "multi_ack_detailed" => Ok(Capability::MultiAckDetailed),
            _ => Ok(Capability::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::SideBand => write!(f, "side-band"),
            Capability::SideBand64k => write!(f, "side-band-64k"),
            Capability::OfsDelta => write!(f, "ofs-delta"),
            Capability::IncludeTag => write!(f, "include-tag"),
            Capability::NoProgress => write!(f, "no-progress"),
            Capability::ReportStatus => write!(f, "report-status"),
            Capability::DeleteRefs => write!(f, "delete-refs"),
            Capability::Quiet => write!(f, "quiet"),
            Capability::NoThin => write!(f, "no-thin"),
            Capability::ThinPack => write!(f, "thin-pack"),
            Capability::MultiAck => write!(f, "multi_ack"),
            Capability::MultiAckDetailed => write!(f, "multi_ack_detailed"),
            Capability::ObjectFormat(format) => write!(f, "object-format={format}"),
            Capability::Agent(agent) => write!(f, "agent={agent}"),
            Capability::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Side-band channels for multiplexed data streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideBand {
    /// Sideband 1 contains packfile data
    PackfileData,
    /// Sideband 2 contains progress information
    ProgressInfo,
    /// Sideband 3 contains error information
    Error,
}

impl SideBand {
    pub fn value(&self) -> u8 {
        match self {
            Self::PackfileData => b'\x01',
            Self::ProgressInfo => b'\x02',
            Self::Error => b'\x03',
        }
    }
}

/// Largest payload per side-band packet, excluding the 4-byte length and the band byte.
pub const SIDE_BAND_64K_DATA: usize = 65515;
pub const SIDE_BAND_DATA: usize = 995;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommandType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Success,
    Failed(String),
}

/// Reference command for push operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCommand {
    pub old_hash: ObjectHash,
    pub new_hash: ObjectHash,
    pub ref_name: String,
    pub status: CommandStatus,
}

impl RefCommand {
    pub fn new(old_hash: ObjectHash, new_hash: ObjectHash, ref_name: String) -> Self {
        Self {
            old_hash,
            new_hash,
            ref_name,
            status: CommandStatus::Pending,
        }
    }

    pub fn command_type(&self) -> CommandType {
        if self.new_hash.is_zero() {
            CommandType::Delete
        } else if self.old_hash.is_zero() {
            CommandType::Create
        } else {
            CommandType::Update
        }
    }

    pub fn failed(&mut self, reason: impl Into<String>) {
        self.status = CommandStatus::Failed(reason.into());
    }

    pub fn success(&mut self) {
        self.status = CommandStatus::Success;
    }

    /// Report-status line, newline terminated.
    pub fn get_status(&self) -> String {
        match &self.status {
            CommandStatus::Failed(reason) => format!("ng {} {reason}\n", self.ref_name),
            CommandStatus::Success | CommandStatus::Pending => format!("ok {}\n", self.ref_name),
        }
    }
}

/// Protocol constants
pub const LF: char = '\n';
pub const SP: char = ' ';
pub const NUL: char = '\0';
pub const PKT_LINE_END_MARKER: &[u8; 4] = b"0000";

pub const AGENT: &str = concat!("git-smart-server/", env!("CARGO_PKG_VERSION"));

// Git protocol capability lists
pub const UPLOAD_CAP_LIST: &str = "side-band side-band-64k ofs-delta include-tag no-progress";
pub const RECEIVE_CAP_LIST: &str = "report-status delete-refs quiet no-thin ofs-delta";
