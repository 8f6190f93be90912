//! Network bridge membership discovery
//!
//! Reads `/sys/class/net/<bridge>/brif` to learn which physical interfaces
//! belong to which bridge. Membership is discovered once per monitoring
//! start and not re-polled.

use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

/// Bridge membership for the monitored host.
#[derive(Debug, Clone, Default)]
pub struct BridgeInfo {
    bridge_to_members: HashMap<String, Vec<String>>,
    member_to_bridge: HashMap<String, String>,
}

impl BridgeInfo {
    /// Discover bridge membership by scanning a `/sys/class/net` style
    /// directory. Unreadable bridge directories are skipped with a warning.
    pub async fn discover(sys_class_net: &Path) -> Self {
        let mut info = BridgeInfo::default();

        let mut entries = match fs::read_dir(sys_class_net).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %sys_class_net.display(), error = %e, "Unable to list network interfaces");
                return info;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let nic = entry.file_name().to_string_lossy().to_string();
            let brif_dir = entry.path().join("brif");

            let mut members = match fs::read_dir(&brif_dir).await {
                Ok(members) => members,
                // not a bridge
                Err(_) => continue,
            };

            let mut names = Vec::new();
            while let Ok(Some(member)) = members.next_entry().await {
                names.push(member.file_name().to_string_lossy().to_string());
            }
            // deterministic pick when a bridge has several members
            names.sort();

            debug!(bridge = %nic, members = ?names, "Discovered bridge");
            for member in &names {
                info.member_to_bridge.insert(member.clone(), nic.clone());
            }
            info.bridge_to_members.insert(nic, names);
        }

        info
    }

    /// Construct from explicit membership, for tests and wiring.
    pub fn from_members(bridge_to_members: HashMap<String, Vec<String>>) -> Self {
        let mut member_to_bridge = HashMap::new();
        let mut bridge_to_members = bridge_to_members;
        for (bridge, members) in bridge_to_members.iter_mut() {
            members.sort();
            for member in members.iter() {
                member_to_bridge.insert(member.clone(), bridge.clone());
            }
        }
        Self {
            bridge_to_members,
            member_to_bridge,
        }
    }

    /// The bridge that `nic` is a member of, if any.
    pub fn bridge_for(&self, nic: &str) -> Option<&str> {
        self.member_to_bridge.get(nic).map(String::as_str)
    }

    /// Physical members of `nic` if it is a bridge.
    pub fn members_of(&self, nic: &str) -> Option<&[String]> {
        self.bridge_to_members.get(nic).map(Vec::as_slice)
    }

    /// Resolve a NIC name to a physical interface name.
    ///
    /// A bridge resolves to its first member in sorted order; bridges with
    /// several members log the ambiguity (known approximation). Anything
    /// else resolves to itself.
    pub fn physical_nic<'a>(&'a self, nic: &'a str) -> &'a str {
        match self.bridge_to_members.get(nic) {
            Some(members) if !members.is_empty() => {
                if members.len() > 1 {
                    warn!(
                        bridge = %nic,
                        members = ?members,
                        "Bridge has more than one physical member, using the first"
                    );
                }
                members[0].as_str()
            }
            _ => nic,
        }
    }

    pub fn is_bridge(&self, nic: &str) -> bool {
        self.bridge_to_members.contains_key(nic)
    }
}
