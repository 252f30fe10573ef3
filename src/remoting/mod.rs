//! Inter-process plumbing between the controller and a child debugger server.
//!
//! A process-wide [`Channel`] accepts connections, every connection starts with a
//! `Hello` frame carrying a token that routes it to whoever is waiting for it.
//! After that both sides talk through an [`Endpoint`] - a bidirectional
//! request/response and notification link on top of Content-Length framed JSON.

mod channel;
mod endpoint;
pub mod proto;
mod transport;

use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use channel::{register_channel, Channel, Connection, Stream};
pub use endpoint::{Dispatch, Endpoint};
pub use transport::{FrameReader, FrameWriter};

/// Transport used by the remoting channel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChannelKind {
    Tcp,
    Unix,
}

/// Serialized reference to a remote object: where to connect and which token to present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjRef {
    pub channel: ChannelKind,
    pub address: String,
    pub token: Uuid,
}

impl ObjRef {
    /// Encode reference into a single line of text suitable for a bootstrap handshake.
    pub fn encode(&self) -> Result<String, Error> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    pub fn decode(line: &str) -> Result<Self, Error> {
        let raw = STANDARD
            .decode(line.trim())
            .map_err(|e| Error::ObjRef(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| Error::ObjRef(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_obj_ref_line() {
        let obj_ref = ObjRef {
            channel: ChannelKind::Unix,
            address: "/tmp/rdbg-1.sock".to_string(),
            token: Uuid::new_v4(),
        };
        let line = obj_ref.encode().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(ObjRef::decode(&format!("{line}\n")).unwrap(), obj_ref);
    }

    #[test]
    fn test_obj_ref_garbage() {
        assert!(matches!(
            ObjRef::decode("definitely not base64 !!"),
            Err(Error::ObjRef(_))
        ));
        let not_json = STANDARD.encode("not json");
        assert!(matches!(ObjRef::decode(&not_json), Err(Error::ObjRef(_))));
    }

    #[test]
    fn test_channel_kind_names() {
        assert_eq!(ChannelKind::Tcp.to_string(), "tcp");
        assert_eq!(ChannelKind::from_str("unix").unwrap(), ChannelKind::Unix);
    }
}
