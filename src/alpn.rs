//! Protocol ids shared by client, server, and discovery modules.

use std::fmt;

use crate::id::ServiceId;

/// Transport protocol id of one service: `/{application}/{service}`.
///
/// Used verbatim as the ALPN a service handler is registered under and the
/// ALPN a client dials with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolId(String);

impl ProtocolId {
    /// Compose the protocol id for a service of an application.
    ///
    /// Converts (`kvm`, `node`) -> `/kvm/node`.
    /// Converts (`kvm`, `display-sink/monitor-1`) -> `/kvm/display-sink/monitor-1`.
    pub fn new(application_id: &str, service_id: &ServiceId) -> Self {
        Self(format!("/{application_id}/{service_id}"))
    }

    /// ALPN bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Protocol id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_id_generation() {
        assert_eq!(
            ProtocolId::new("kvm", &ServiceId::new("node")).as_bytes(),
            b"/kvm/node"
        );
        assert_eq!(
            ProtocolId::new("kvm", &ServiceId::with_argument("display-sink", "monitor-1")).as_str(),
            "/kvm/display-sink/monitor-1"
        );
    }

    #[test]
    fn test_protocol_id_differs_per_application() {
        let service = ServiceId::new("peripheral-repository");
        assert_ne!(
            ProtocolId::new("lab", &service),
            ProtocolId::new("office", &service)
        );
    }
}
