//! Transfer protocol seam, transfer modes, filter policies and the remote
//! region descriptor exchanged before one-sided operations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::connection::Connection;
use crate::error::{TransferError, VerbsError};
use crate::memory::MemoryRegion;
use crate::work_request::RemoteTarget;

/// Wire size of a [`RemoteRegionDescriptor`].
pub const DESCRIPTOR_WIRE_SIZE: usize = 16;

/// Largest wire size of a [`WriteRequest`]: descriptor, option tag, key.
pub const WRITE_REQUEST_MAX_WIRE_SIZE: usize = DESCRIPTOR_WIRE_SIZE + 5;

/// How records move between the roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Two-sided send matched by a posted receive.
    #[default]
    Send,
    /// Server writes into memory the client advertised.
    Write,
    /// Client reads memory the server advertised.
    Read,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Send => write!(f, "send"),
            TransferMode::Write => write!(f, "write"),
            TransferMode::Read => write!(f, "read"),
        }
    }
}

/// Where, if anywhere, records are filtered by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "site", rename_all = "snake_case")]
pub enum FilterPolicy {
    /// Every record is transferred and kept.
    #[default]
    Unfiltered,
    /// The server filters before transferring, so only matches move.
    AtServer {
        /// Key to keep.
        key: u32,
    },
    /// The client filters what it received.
    AtClient {
        /// Key to keep.
        key: u32,
    },
}

impl FilterPolicy {
    /// Key the server filters on.
    pub fn server_key(&self) -> Option<u32> {
        match self {
            FilterPolicy::AtServer { key } => Some(*key),
            _ => None,
        }
    }

    /// Key the client filters on.
    pub fn client_key(&self) -> Option<u32> {
        match self {
            FilterPolicy::AtClient { key } => Some(*key),
            _ => None,
        }
    }
}

impl fmt::Display for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterPolicy::Unfiltered => write!(f, "none"),
            FilterPolicy::AtServer { key } => write!(f, "server(key={})", key),
            FilterPolicy::AtClient { key } => write!(f, "client(key={})", key),
        }
    }
}

/// Address, remote key and valid length of a region a peer may access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegionDescriptor {
    /// Remote virtual address.
    pub addr: u64,
    /// Remote key.
    pub rkey: u32,
    /// Bytes the peer may access starting at `addr`.
    pub len: u32,
}

impl RemoteRegionDescriptor {
    /// Describes the first `len` bytes of `mr`. Fails when `len` does not
    /// fit the 32-bit wire field.
    pub fn for_region(mr: &MemoryRegion, len: usize) -> Result<Self, TransferError> {
        let len = u32::try_from(len).map_err(|_| VerbsError::LengthOverflow { len })?;
        Ok(Self {
            addr: mr.addr(),
            rkey: mr.rkey(),
            len,
        })
    }

    /// Target of a one-sided request at the start of the region.
    pub fn target(&self) -> RemoteTarget {
        RemoteTarget {
            addr: self.addr,
            rkey: self.rkey,
        }
    }

    /// Serializes to the 16-byte wire form.
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        Ok(bincode::serialize(self)?)
    }

    /// Parses the 16-byte wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        if bytes.len() != DESCRIPTOR_WIRE_SIZE {
            return Err(TransferError::DescriptorSize {
                expected: DESCRIPTOR_WIRE_SIZE,
                got: bytes.len(),
            });
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

/// What a client sends before a remote write: where to write, and
/// optionally which key the server should filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Destination region.
    pub region: RemoteRegionDescriptor,
    /// Key the client asks the server to keep.
    pub key: Option<u32>,
}

impl WriteRequest {
    /// Serializes to the wire form (17 bytes without a key, 21 with one).
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        Ok(bincode::serialize(self)?)
    }

    /// Parses the wire form, rejecting trailing or missing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        let size_error = || TransferError::DescriptorSize {
            expected: WRITE_REQUEST_MAX_WIRE_SIZE,
            got: bytes.len(),
        };
        if bytes.len() > WRITE_REQUEST_MAX_WIRE_SIZE {
            return Err(size_error());
        }
        let request: Self = bincode::deserialize(bytes).map_err(|_| size_error())?;
        if bincode::serialized_size(&request)? as usize != bytes.len() {
            return Err(size_error());
        }
        Ok(request)
    }
}

/// One data-transfer protocol run over an established connection.
///
/// `prepare` runs after the queue pair exists and before the connection is
/// requested or accepted, which is where receives that must precede the
/// peer's first message are posted. `run` drives the transfer to completion.
pub trait TransferProtocol {
    /// Result of a successful run.
    type Output;

    /// Posts whatever must be in place before the connection is up.
    fn prepare(&mut self, conn: &mut Connection) -> Result<(), TransferError> {
        let _ = conn;
        Ok(())
    }

    /// Performs the transfer.
    fn run(&mut self, conn: &mut Connection) -> Result<Self::Output, TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_descriptor_wire_size() {
        let desc = RemoteRegionDescriptor {
            addr: 0x1000_2000,
            rkey: 0x8000_0003,
            len: 48,
        };
        let bytes = desc.encode().unwrap();
        assert_eq!(bytes.len(), DESCRIPTOR_WIRE_SIZE);
        assert_eq!(&bytes[..8], &0x1000_2000u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x8000_0003u32.to_le_bytes());
        assert_eq!(&bytes[12..], &48u32.to_le_bytes());
    }

    #[test]
    fn test_descriptor_wrong_size() {
        assert!(matches!(
            RemoteRegionDescriptor::decode(&[0u8; 12]),
            Err(TransferError::DescriptorSize { expected: 16, got: 12 })
        ));
    }

    #[test]
    fn test_filter_policy_keys() {
        assert_eq!(FilterPolicy::Unfiltered.server_key(), None);
        assert_eq!(FilterPolicy::AtServer { key: 1 }.server_key(), Some(1));
        assert_eq!(FilterPolicy::AtServer { key: 1 }.client_key(), None);
        assert_eq!(FilterPolicy::AtClient { key: 2 }.client_key(), Some(2));
    }

    #[test]
    fn test_filter_policy_serde() {
        let json = serde_json::to_string(&FilterPolicy::AtServer { key: 1 }).unwrap();
        assert_eq!(json, r#"{"site":"at_server","key":1}"#);
        let back: FilterPolicy = serde_json::from_str(r#"{"site":"unfiltered"}"#).unwrap();
        assert_eq!(back, FilterPolicy::Unfiltered);
        let mode: TransferMode = serde_json::from_str(r#""read""#).unwrap();
        assert_eq!(mode, TransferMode::Read);
    }

    #[test]
    fn test_display() {
        assert_eq!(TransferMode::Write.to_string(), "write");
        assert_eq!(FilterPolicy::AtClient { key: 3 }.to_string(), "client(key=3)");
    }

    #[test]
    fn test_descriptor_rejects_oversized_length() {
        let fabric = crate::fabric::Fabric::default();
        let pd = crate::memory::ProtectionDomain::alloc(&fabric.device());
        let mr = pd.register(vec![0u8; 16], crate::memory::AccessFlags::REMOTE_READ).unwrap();
        let too_long = u32::MAX as usize + 17;
        assert!(matches!(
            RemoteRegionDescriptor::for_region(&mr, too_long),
            Err(TransferError::Verbs(VerbsError::LengthOverflow { len })) if len == too_long
        ));
        assert_eq!(RemoteRegionDescriptor::for_region(&mr, 16).unwrap().len, 16);
    }

    #[test]
    fn test_write_request_wire_sizes() {
        let region = RemoteRegionDescriptor {
            addr: 0x1000_0000,
            rkey: 0x8000_0001,
            len: 64,
        };
        let keyed = WriteRequest { region, key: Some(2) };
        let bytes = keyed.encode().unwrap();
        assert_eq!(bytes.len(), WRITE_REQUEST_MAX_WIRE_SIZE);
        assert_eq!(WriteRequest::decode(&bytes).unwrap(), keyed);

        let open = WriteRequest { region, key: None };
        let bytes = open.encode().unwrap();
        assert_eq!(bytes.len(), DESCRIPTOR_WIRE_SIZE + 1);
        assert_eq!(WriteRequest::decode(&bytes).unwrap(), open);
    }

    #[test]
    fn test_write_request_wrong_size() {
        assert!(matches!(
            WriteRequest::decode(&[0u8; 12]),
            Err(TransferError::DescriptorSize { got: 12, .. })
        ));
        let mut bytes = WriteRequest {
            region: RemoteRegionDescriptor { addr: 1, rkey: 2, len: 3 },
            key: None,
        }
        .encode()
        .unwrap();
        bytes.push(0);
        assert!(WriteRequest::decode(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn prop_descriptor_decodes_to_itself(addr in any::<u64>(), rkey in any::<u32>(), len in any::<u32>()) {
            let desc = RemoteRegionDescriptor { addr, rkey, len };
            let bytes = desc.encode().unwrap();
            prop_assert_eq!(RemoteRegionDescriptor::decode(&bytes).unwrap(), desc);
        }
    }
}
