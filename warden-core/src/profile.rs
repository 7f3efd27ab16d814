/*!
Configuration-profile descriptors.

Profiles are captured in snapshots and searchable, but removing one is an
operator action performed outside Warden: there is no lifecycle for them and
Warden never claims it can restore one.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Risk flags derived from a profile's fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileRisk {
    RootCertificate,
    Vpn,
    CertificatePayload,
}

/// One installed configuration profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDescriptor {
    pub identifier: String,
    pub display_name: Option<String>,
    /// Raw key/value fields as reported by the collector
    pub fields: BTreeMap<String, String>,
    pub risks: Vec<ProfileRisk>,
    pub mdm: bool,
    pub removable: bool,
}

impl ProfileDescriptor {
    /// Classify a profile from the fields a collector parsed.
    ///
    /// Returns `None` when no identifier field is present.
    pub fn from_fields(fields: BTreeMap<String, String>) -> Option<Self> {
        let identifier = lookup(&fields, "profileIdentifier")
            .or_else(|| lookup(&fields, "PayloadIdentifier"))?
            .to_string();
        let display_name = lookup(&fields, "attribute: name")
            .or_else(|| lookup(&fields, "PayloadDisplayName"))
            .map(str::to_string);

        let mut risks = Vec::new();
        if fields.values().any(|v| v.to_ascii_lowercase().contains("root")) {
            risks.push(ProfileRisk::RootCertificate);
        }
        if fields.values().any(|v| v.to_ascii_lowercase().contains("vpn")) {
            risks.push(ProfileRisk::Vpn);
        }
        if fields.values().any(|v| mentions_certificate_payload(v)) {
            risks.push(ProfileRisk::CertificatePayload);
        }

        let mdm = lookup(&fields, "PayloadType")
            .map(|v| v.to_ascii_lowercase().contains("mdm"))
            .unwrap_or(false)
            || identifier.to_ascii_lowercase().contains("mdm");

        let removable = !lookup(&fields, "PayloadRemovalDisallowed")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "1"))
            .unwrap_or(false);

        Some(Self {
            identifier,
            display_name,
            fields,
            risks,
            mdm,
            removable,
        })
    }

    pub fn is_risky(&self) -> bool {
        !self.risks.is_empty()
    }

    /// Operator guidance for removing this profile by hand
    pub fn removal_advice(&self) -> String {
        if !self.removable {
            return format!(
                "Profile {} disallows removal; it must be released by the organisation that manages this machine",
                self.identifier
            );
        }
        format!(
            "Remove manually with `sudo profiles remove -identifier {}`. Warden cannot restore profiles; keep the original .mobileconfig to re-install it with `profiles install -type configuration -path <file>`",
            self.identifier
        )
    }

    /// Text searched by the keyword index
    pub fn search_text(&self) -> String {
        let mut text = self.identifier.clone();
        if let Some(name) = &self.display_name {
            text.push(' ');
            text.push_str(name);
        }
        for value in self.fields.values() {
            text.push(' ');
            text.push_str(value);
        }
        text
    }
}

/// Case-insensitive field lookup; `attribute: name` and `name` are the same key
fn lookup<'a>(fields: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    fn bare(k: &str) -> &str {
        k.strip_prefix("attribute: ").unwrap_or(k)
    }
    fields
        .iter()
        .find(|(k, _)| bare(k).eq_ignore_ascii_case(bare(key)))
        .map(|(_, v)| v.as_str())
}

fn mentions_certificate_payload(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    match lower.find("payloadtype") {
        Some(idx) => lower[idx..].contains("certificate"),
        None => false,
    }
}
