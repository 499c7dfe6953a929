//! Coordination-store key layout and value specifications.
//!
//! All allocator state lives under a root prefix:
//!
//! - `<root>/members/<zone>|<suffix>` → [`MemberSpec`]
//! - `<root>/items/<id>` → [`JournalSpec`]
//! - `<root>/assign/<id>/<zone>/<suffix>/<slot>` → [`AssignmentSpec`]
//!
//! Item IDs are journal names and may contain `/`; assignment keys are
//! therefore parsed from the right, where the trailing three segments are
//! always `<zone>/<suffix>/<slot>`.

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_FRAGMENT_LENGTH;
use crate::coordination::RawKeyValue;
use crate::error::{Error, Result};
use crate::fragment::CompressionCodec;
use crate::types::{BrokerId, Journal};

pub const MEMBERS_PREFIX: &str = "/members/";
pub const ITEMS_PREFIX: &str = "/items/";
pub const ASSIGNMENTS_PREFIX: &str = "/assign/";

/// Value of a member key: the broker's scheduling capacity and dialable
/// endpoint. `item_limit` 0 means the member is draining and schedules no
/// new assignments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub item_limit: u32,
    #[serde(default)]
    pub endpoint: String,
}

/// Fragment construction parameters of a journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentSpec {
    /// Target length at which the open fragment is rolled.
    pub length: i64,
    #[serde(default)]
    pub compression_codec: CompressionCodec,
    /// Store URLs to persist fragments to; the first is primary.
    #[serde(default)]
    pub stores: Vec<String>,
}

impl Default for FragmentSpec {
    fn default() -> Self {
        FragmentSpec {
            length: DEFAULT_FRAGMENT_LENGTH,
            compression_codec: CompressionCodec::None,
            stores: Vec::new(),
        }
    }
}

/// Value of an item key: the journal's desired replication and fragment
/// parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSpec {
    pub replication: u32,
    #[serde(default)]
    pub fragment: FragmentSpec,
}

impl Default for JournalSpec {
    fn default() -> Self {
        JournalSpec {
            replication: 1,
            fragment: FragmentSpec::default(),
        }
    }
}

impl JournalSpec {
    pub fn validate(&self) -> Result<()> {
        if self.replication < 1 {
            return Err(Error::Validation(format!(
                "invalid replication ({}; expected >= 1)",
                self.replication
            )));
        }
        if self.fragment.length <= 0 {
            return Err(Error::Validation(format!(
                "invalid fragment length ({}; expected > 0)",
                self.fragment.length
            )));
        }
        Ok(())
    }
}

/// Value of an assignment key. An assignment starts `consistent: false`
/// and is flipped to true by the assigned member once its local replica
/// has initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSpec {
    #[serde(default)]
    pub consistent: bool,
}

/// Parsed components of an assignment key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AssignmentKey {
    pub item: String,
    pub member: BrokerId,
    pub slot: u32,
}

/// A decoded allocator keyspace entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocEntity {
    Member { id: BrokerId, spec: MemberSpec },
    Item { id: Journal, spec: JournalSpec },
    Assignment { key: AssignmentKey, spec: AssignmentSpec },
}

impl AllocEntity {
    pub fn as_member(&self) -> Option<(&BrokerId, &MemberSpec)> {
        match self {
            AllocEntity::Member { id, spec } => Some((id, spec)),
            _ => None,
        }
    }

    pub fn as_item(&self) -> Option<(&Journal, &JournalSpec)> {
        match self {
            AllocEntity::Item { id, spec } => Some((id, spec)),
            _ => None,
        }
    }

    pub fn as_assignment(&self) -> Option<(&AssignmentKey, &AssignmentSpec)> {
        match self {
            AllocEntity::Assignment { key, spec } => Some((key, spec)),
            _ => None,
        }
    }
}

pub fn member_key(root: &str, id: &BrokerId) -> String {
    format!("{root}{MEMBERS_PREFIX}{}|{}", id.zone, id.suffix)
}

pub fn item_key(root: &str, item: &str) -> String {
    format!("{root}{ITEMS_PREFIX}{item}")
}

pub fn assignment_key(root: &str, key: &AssignmentKey) -> String {
    format!(
        "{root}{ASSIGNMENTS_PREFIX}{}/{}/{}/{}",
        key.item, key.member.zone, key.member.suffix, key.slot
    )
}

/// Parse `<root>/members/<zone>|<suffix>`.
pub fn parse_member_key(root: &str, key: &str) -> Result<BrokerId> {
    let rest = key
        .strip_prefix(root)
        .and_then(|k| k.strip_prefix(MEMBERS_PREFIX))
        .ok_or_else(|| Error::Validation(format!("not a member key ({key})")))?;
    let (zone, suffix) = rest
        .split_once('|')
        .ok_or_else(|| Error::Validation(format!("malformed member key ({key})")))?;
    let id = BrokerId::new(zone, suffix);
    id.validate()?;
    Ok(id)
}

/// Parse `<root>/items/<id>`.
pub fn parse_item_key(root: &str, key: &str) -> Result<Journal> {
    let rest = key
        .strip_prefix(root)
        .and_then(|k| k.strip_prefix(ITEMS_PREFIX))
        .ok_or_else(|| Error::Validation(format!("not an item key ({key})")))?;
    let journal = Journal::from(rest);
    journal.validate()?;
    Ok(journal)
}

/// Parse `<root>/assign/<id>/<zone>/<suffix>/<slot>`. The item ID may
/// itself contain `/`, so the trailing three segments bind first.
pub fn parse_assignment_key(root: &str, key: &str) -> Result<AssignmentKey> {
    let rest = key
        .strip_prefix(root)
        .and_then(|k| k.strip_prefix(ASSIGNMENTS_PREFIX))
        .ok_or_else(|| Error::Validation(format!("not an assignment key ({key})")))?;

    let mut it = rest.rsplitn(4, '/');
    let slot = it.next();
    let suffix = it.next();
    let zone = it.next();
    let item = it.next();

    match (item, zone, suffix, slot) {
        (Some(item), Some(zone), Some(suffix), Some(slot)) if !item.is_empty() => {
            let slot: u32 = slot
                .parse()
                .map_err(|_| Error::Validation(format!("malformed assignment slot ({key})")))?;
            let member = BrokerId::new(zone, suffix);
            member.validate()?;
            Ok(AssignmentKey {
                item: item.to_string(),
                member,
                slot,
            })
        }
        _ => Err(Error::Validation(format!(
            "malformed assignment key ({key})"
        ))),
    }
}

/// Decoder installed into the allocator's KeySpace. Dispatches on the key
/// prefix and embeds the parsed key components alongside the spec, so
/// downstream consumers never re-parse keys.
pub fn alloc_decoder(root: &str) -> crate::keyspace::Decoder<AllocEntity> {
    let root = root.to_string();
    std::sync::Arc::new(move |raw: &RawKeyValue| {
        let decode_err = |detail: String| Error::Decode {
            key: raw.key.clone(),
            detail,
        };

        let rest = raw.key.strip_prefix(root.as_str()).unwrap_or("");
        if rest.starts_with(MEMBERS_PREFIX) {
            let id = parse_member_key(&root, &raw.key).map_err(|e| decode_err(e.to_string()))?;
            let spec: MemberSpec = serde_json::from_slice(&raw.value)
                .map_err(|e| decode_err(e.to_string()))?;
            Ok(AllocEntity::Member { id, spec })
        } else if rest.starts_with(ITEMS_PREFIX) {
            let id = parse_item_key(&root, &raw.key).map_err(|e| decode_err(e.to_string()))?;
            let spec: JournalSpec = serde_json::from_slice(&raw.value)
                .map_err(|e| decode_err(e.to_string()))?;
            spec.validate().map_err(|e| decode_err(e.to_string()))?;
            Ok(AllocEntity::Item { id, spec })
        } else if rest.starts_with(ASSIGNMENTS_PREFIX) {
            let key = parse_assignment_key(&root, &raw.key)
                .map_err(|e| decode_err(e.to_string()))?;
            let spec: AssignmentSpec = serde_json::from_slice(&raw.value)
                .map_err(|e| decode_err(e.to_string()))?;
            Ok(AllocEntity::Assignment { key, spec })
        } else {
            Err(decode_err("unrecognized key prefix".to_string()))
        }
    })
}
