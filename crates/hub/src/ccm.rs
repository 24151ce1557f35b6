//! UECS-CCM wire format: XML payload building and parsing, plus the
//! level-to-suffix mapping for outgoing control types.
//!
//! UECS (Ubiquitous Environment Control System) carries greenhouse data as
//! small XML documents over UDP multicast 224.0.0.1:16520:
//!
//! ```text
//! <UECS ver="1.00-E10">
//!   <DATA type="VenSdWinrcM" room="1" region="1" order="1"
//!         priority="10" lv="A" cast="uni">1</DATA>
//!   <IP>192.168.1.50</IP>
//! </UECS>
//! ```

use serde::{Deserialize, Serialize};

use crate::intent::Level;

pub const MULTICAST_ADDR: &str = "224.0.0.1";
pub const MULTICAST_PORT: u16 = 16520;

/// Wire value for "de-energise".
pub const VALUE_OFF: u8 = 0;
/// Wire value for "energise" (open-ward for limited actuators).
pub const VALUE_ON: u8 = 1;
/// Wire value for "energise close-ward" (limited duration actuators only).
pub const VALUE_CLOSE: u8 = 2;

// ---------------------------------------------------------------------------
// Control type suffixes
// ---------------------------------------------------------------------------

/// Per-level suffix appended to the actuator id in outgoing control types
/// (`rcA` automatic-source, `rcM` manual-source, or bare).
///
/// The correct mapping is unresolved pending field testing, so it is
/// configuration; these defaults reflect the current hypothesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuffixMap {
    pub l1: String,
    pub l2: String,
    pub l3: String,
    pub l4: String,
    pub l5: String,
}

impl Default for SuffixMap {
    fn default() -> Self {
        Self {
            l1: String::new(),
            l2: "rcA".to_string(),
            l3: "rcM".to_string(),
            l4: "rcA".to_string(),
            l5: "rcA".to_string(),
        }
    }
}

impl SuffixMap {
    pub fn for_level(&self, level: Level) -> &str {
        match level {
            Level::Emergency => &self.l1,
            Level::Safety => &self.l2,
            Level::Manual => &self.l3,
            Level::Auto => &self.l4,
            Level::Fallback => &self.l5,
        }
    }

    /// Outgoing CCM type for a control packet: actuator id plus level suffix.
    pub fn control_type(&self, actuator_id: &str, level: Level) -> String {
        format!("{actuator_id}{}", self.for_level(level))
    }
}

/// Strip the `.mC` / `.cMC` / `.MC` measurement suffixes ArSprout appends.
pub fn strip_ccm_suffix(ccm_type: &str) -> &str {
    for suffix in [".mC", ".cMC", ".MC"] {
        if let Some(stripped) = ccm_type.strip_suffix(suffix) {
            return stripped;
        }
    }
    ccm_type
}

/// True for control-source types (`...rcA` / `...rcM`); these are commands
/// from a controller, not operational status from the actuator node.
pub fn is_control_type(ccm_type: &str) -> bool {
    ccm_type.ends_with("rcA") || ccm_type.ends_with("rcM")
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Build a UECS control XML payload. `value` is the raw wire value.
#[allow(clippy::too_many_arguments)]
pub fn build_control_xml(
    ccm_type: &str,
    value: u8,
    room: u8,
    region: u8,
    order: u8,
    priority: u8,
    local_ip: &str,
) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n\
         <UECS ver=\"1.00-E10\">\n\
         \x20 <DATA type=\"{ccm_type}\" room=\"{room}\" region=\"{region}\" \
         order=\"{order}\" priority=\"{priority}\" \
         lv=\"A\" cast=\"uni\">{value}</DATA>\n\
         \x20 <IP>{local_ip}</IP>\n\
         </UECS>\n"
    )
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One parsed `<DATA>` element from an incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CcmFrame {
    /// Suffix-stripped type (e.g. `Irri`).
    pub ccm_type: String,
    /// Original type attribute (e.g. `Irri.mC`).
    pub raw_type: String,
    pub value: f64,
    pub room: u8,
    pub priority: u8,
    pub level: String,
}

/// Parse an incoming UECS payload into the DATA frames it carries.
///
/// Incoming traffic is whatever the greenhouse LAN broadcasts; anything
/// malformed or non-numeric is skipped rather than treated as an error.
pub fn parse_ccm_xml(payload: &str) -> Vec<CcmFrame> {
    let mut frames = Vec::new();
    let mut rest = payload;

    while let Some(start) = rest.find("<DATA") {
        let after = &rest[start..];
        let Some(tag_end) = after.find('>') else { break };
        let attrs = &after[..tag_end];
        let body_start = tag_end + 1;
        let Some(close) = after.find("</DATA>") else { break };
        if close < body_start {
            break;
        }
        let body = after[body_start..close].trim();

        let raw_type = attr(attrs, "type").unwrap_or_default();
        if !raw_type.is_empty() {
            if let Ok(value) = body.parse::<f64>() {
                frames.push(CcmFrame {
                    ccm_type: strip_ccm_suffix(&raw_type).to_string(),
                    raw_type: raw_type.clone(),
                    value,
                    room: attr(attrs, "room")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(1),
                    priority: attr(attrs, "priority")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(29),
                    level: attr(attrs, "lv").unwrap_or_else(|| "S".to_string()),
                });
            }
        }

        rest = &after[close + "</DATA>".len()..];
    }

    frames
}

/// Extract a quoted attribute value from a raw tag string.
fn attr(tag: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')?;
    Some(tag[start..start + end].to_string())
}

// ===========================================================================
// Tests
// ===========================================================================
