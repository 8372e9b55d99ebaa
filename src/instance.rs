//! The VM a session or instance operation targets, as sent by the client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One network interface of a [`TargetInstance`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default, rename = "networkIP")]
    pub network_ip: String,
}

/// Identity and free-form parameters of a target VM. Read-only once received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInstance {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    /// VPC network the temporary firewall rule is created in.
    #[serde(default)]
    pub firewall_network: String,
    /// Values for pre-session and instance operation placeholders.
    #[serde(default, alias = "preRdpParams")]
    pub params: BTreeMap<String, String>,
}

impl TargetInstance {
    /// Address of the primary (first) interface, if the instance has one.
    pub fn primary_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()
            .map(|nic| nic.network_ip.as_str())
            .filter(|ip| !ip.is_empty())
    }

    /// A free-form parameter, matched case-insensitively.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .or_else(|| {
                self.params
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    /// Value for a placeholder in an instance-bound template.
    ///
    /// `NAME`, `ZONE`, `PROJECT` and `NETWORKIP` come from the instance
    /// itself; anything else from [`TargetInstance::params`].
    pub fn resolve(&self, placeholder: &str) -> Option<String> {
        match placeholder {
            "NAME" => Some(self.name.clone()),
            "ZONE" => Some(self.zone.clone()),
            "PROJECT" => Some(self.project.clone()),
            "NETWORKIP" => self.primary_ip().map(str::to_string),
            other => self.param(other).map(str::to_string),
        }
    }

    /// Missing identity fields, for rejecting a malformed identity message.
    pub fn missing_identity(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.project.trim().is_empty() {
            missing.push("project");
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_payload() {
        let instance: TargetInstance = serde_json::from_str(
            r#"{
                "id": "123",
                "name": "vm-1",
                "zone": "us-central1-a",
                "project": "proj",
                "firewallNetwork": "default",
                "networkInterfaces": [{"name": "nic0", "network": "default", "networkIP": "10.0.0.2"}],
                "preRdpParams": {"START_VM": "yes"}
            }"#,
        )
        .unwrap();
        assert_eq!(instance.primary_ip(), Some("10.0.0.2"));
        assert_eq!(instance.firewall_network, "default");
        assert_eq!(instance.param("start_vm"), Some("yes"));
        assert!(instance.missing_identity().is_empty());
    }

    #[test]
    fn networkip_uses_first_interface_only() {
        let instance = TargetInstance {
            network_interfaces: vec![
                NetworkInterface {
                    network_ip: "10.0.0.2".into(),
                    ..Default::default()
                },
                NetworkInterface {
                    network_ip: "10.0.1.2".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(instance.resolve("NETWORKIP").as_deref(), Some("10.0.0.2"));
        assert_eq!(TargetInstance::default().resolve("NETWORKIP"), None);
    }

    #[test]
    fn identity_requires_name_and_project() {
        let instance = TargetInstance {
            name: " ".into(),
            ..Default::default()
        };
        assert_eq!(instance.missing_identity(), vec!["name", "project"]);
    }
}
