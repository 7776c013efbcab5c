//! Provisioning orders as they arrive on the queue
//!
//! An [`Order`] is decoded from the message payload and validated before any
//! cluster work begins. Once validated it is never mutated.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, NODE_PORT_MAX, NODE_PORT_MIN};

/// Maximum length of a DNS label (RFC 1123)
pub const DNS_LABEL_MAX_LEN: usize = 63;

/// Identifier of an order, numeric or UUID depending on the producer
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderId {
    /// Sequential numeric identifier
    Numeric(u64),
    /// UUID identifier
    Uuid(Uuid),
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderId::Numeric(id) => write!(f, "{}", id),
            OrderId::Uuid(id) => write!(f, "{}", id),
        }
    }
}

/// User identifiers are strings on the wire, but older producers send integers
#[derive(Deserialize)]
#[serde(untagged)]
enum RawUserId {
    Text(String),
    Number(u64),
}

fn deserialize_user_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match RawUserId::deserialize(deserializer)? {
        RawUserId::Text(s) => s,
        RawUserId::Number(n) => n.to_string(),
    })
}

/// A request to provision one tenant control plane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Tenant (customer) identifier
    #[serde(deserialize_with = "deserialize_user_id")]
    pub user_id: String,
    /// Name of the cluster to create; becomes the tenant resource name
    pub cluster_name: String,
    /// Whether a control plane is requested
    #[serde(default)]
    pub has_control_plane: bool,
    /// Whether monitoring is requested
    #[serde(default)]
    pub has_monitoring: bool,
    /// Whether alerting is requested
    #[serde(default)]
    pub has_alerting: bool,
    /// Image registry storage in GiB
    #[serde(rename = "images_storage", alias = "image_storage", default)]
    pub image_storage: u32,
    /// Monitoring storage in GiB
    #[serde(default)]
    pub monitoring_storage: u32,
}

impl Order {
    /// Decode an order from a raw message payload
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(payload).map_err(|e| Error::decode(e.to_string()))
    }

    /// Check every invariant an order must satisfy before provisioning
    pub fn validate(&self) -> Result<(), Error> {
        let order = self.id.to_string();

        if let Err(msg) = validate_dns_label(&self.cluster_name) {
            return Err(Error::validation_for_field(order, "cluster_name", msg));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::validation_for_field(
                order,
                "user_id",
                "must not be empty",
            ));
        }
        if let Err(msg) = validate_dns_label(&self.tenant()) {
            return Err(Error::validation_for_field(order, "user_id", msg));
        }
        if !self.has_control_plane {
            return Err(Error::validation_for_field(
                order,
                "has_control_plane",
                "order does not request a control plane",
            ));
        }
        if self.image_storage == 0 {
            return Err(Error::validation_for_field(
                order,
                "images_storage",
                "must be greater than zero",
            ));
        }
        if self.monitoring_storage == 0 {
            return Err(Error::validation_for_field(
                order,
                "monitoring_storage",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Normalized tenant identifier (lowercased user id)
    pub fn tenant(&self) -> String {
        self.user_id.trim().to_ascii_lowercase()
    }

    /// Namespace holding this tenant's control planes
    pub fn namespace(&self) -> String {
        self.tenant()
    }
}

/// Validate a name against RFC 1123 DNS label rules
///
/// Lowercase alphanumerics and '-', 1 to 63 characters, starting and ending
/// with an alphanumeric.
pub fn validate_dns_label(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".to_string());
    }
    if name.len() > DNS_LABEL_MAX_LEN {
        return Err(format!(
            "must be at most {} characters, got {}",
            DNS_LABEL_MAX_LEN,
            name.len()
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(format!("contains invalid character '{}'", c));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("must start and end with an alphanumeric character".to_string());
    }
    Ok(())
}

/// A port in the NodePort range
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct NodePort(u16);

impl NodePort {
    /// Wrap `port` if it lies within the NodePort range
    pub fn new(port: u16) -> Option<Self> {
        (NODE_PORT_MIN..=NODE_PORT_MAX)
            .contains(&port)
            .then_some(Self(port))
    }

    /// The raw port number
    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for NodePort {
    type Error = String;

    fn try_from(port: u16) -> Result<Self, Self::Error> {
        Self::new(port).ok_or_else(|| {
            format!(
                "port {} outside node port range {}-{}",
                port, NODE_PORT_MIN, NODE_PORT_MAX
            )
        })
    }
}

impl From<NodePort> for u16 {
    fn from(port: NodePort) -> Self {
        port.0
    }
}

impl fmt::Display for NodePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order() -> Order {
        Order {
            id: OrderId::Numeric(1),
            user_id: "u-123".to_string(),
            cluster_name: "acme-prod".to_string(),
            has_control_plane: true,
            has_monitoring: false,
            has_alerting: false,
            image_storage: 10,
            monitoring_storage: 5,
        }
    }

    #[test]
    fn decodes_producer_payload() {
        let payload = br#"{
            "id": 1,
            "user_id": "u-123",
            "cluster_name": "acme-prod",
            "has_control_plane": true,
            "has_monitoring": true,
            "has_alerting": false,
            "images_storage": 10,
            "monitoring_storage": 5,
            "extra": "ignored"
        }"#;

        let order = Order::decode(payload).unwrap();
        assert_eq!(order.id, OrderId::Numeric(1));
        assert_eq!(order.user_id, "u-123");
        assert_eq!(order.image_storage, 10);
        assert!(order.has_monitoring);
        order.validate().unwrap();
    }

    #[test]
    fn decodes_uuid_ids_and_numeric_user_ids() {
        let payload = br#"{
            "id": "0b6b6d5e-3f57-4c59-9a3c-0d4f5f1e2a11",
            "user_id": 42,
            "cluster_name": "edge",
            "has_control_plane": true,
            "image_storage": 1,
            "monitoring_storage": 1
        }"#;

        let order = Order::decode(payload).unwrap();
        assert!(matches!(order.id, OrderId::Uuid(_)));
        assert_eq!(order.user_id, "42");
        assert_eq!(order.namespace(), "42");
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = Order::decode(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));

        let err = Order::decode(br#"{"id": 1}"#).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn uuid_user_ids_normalize_to_lowercase_namespaces() {
        let mut order = sample_order();
        order.user_id = "0B6B6D5E-3F57-4C59-9A3C-0D4F5F1E2A11".to_string();
        order.validate().unwrap();
        assert_eq!(order.namespace(), "0b6b6d5e-3f57-4c59-9a3c-0d4f5f1e2a11");
    }

    /// Story: only orders that can become a real control plane pass validation
    #[test]
    fn story_invalid_orders_are_rejected_with_field_context() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Order)>)> = vec![
            ("cluster_name", Box::new(|o: &mut Order| o.cluster_name = "Acme_Prod".into())),
            ("cluster_name", Box::new(|o: &mut Order| o.cluster_name = String::new())),
            ("cluster_name", Box::new(|o: &mut Order| o.cluster_name = "a".repeat(64))),
            ("cluster_name", Box::new(|o: &mut Order| o.cluster_name = "-acme".into())),
            ("user_id", Box::new(|o: &mut Order| o.user_id = "  ".into())),
            ("user_id", Box::new(|o: &mut Order| o.user_id = "user@example".into())),
            ("has_control_plane", Box::new(|o: &mut Order| o.has_control_plane = false)),
            ("images_storage", Box::new(|o: &mut Order| o.image_storage = 0)),
            ("monitoring_storage", Box::new(|o: &mut Order| o.monitoring_storage = 0)),
        ];

        for (expected_field, mutate) in cases {
            let mut order = sample_order();
            mutate(&mut order);
            match order.validate() {
                Err(Error::Validation { field, order, .. }) => {
                    assert_eq!(field.as_deref(), Some(expected_field));
                    assert_eq!(order, "1");
                }
                other => panic!("expected validation error on {}, got {:?}", expected_field, other),
            }
        }
    }

    #[test]
    fn dns_label_rules() {
        assert!(validate_dns_label("a").is_ok());
        assert!(validate_dns_label("acme-prod-01").is_ok());
        assert!(validate_dns_label(&"a".repeat(63)).is_ok());
        assert!(validate_dns_label("acme-").is_err());
        assert!(validate_dns_label("acme.prod").is_err());
        assert!(validate_dns_label("ACME").is_err());
    }

    #[test]
    fn node_port_range_is_enforced() {
        assert!(NodePort::new(29999).is_none());
        assert!(NodePort::new(32768).is_none());
        assert_eq!(NodePort::new(30000).map(NodePort::get), Some(30000));
        assert_eq!(NodePort::new(32767).map(NodePort::get), Some(32767));

        let parsed: Result<NodePort, _> = serde_json::from_str("8080");
        assert!(parsed.is_err());
    }
}
