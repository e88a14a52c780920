//! The message template catalog: a parsed description of every packet type
//!  on the wire - numeric id, priority class, trust/encoding/deprecation
//!  markers and the ordered blocks of typed variables making up the body.
//!
//! The catalog is built once at startup from a text template file and is
//!  immutable afterwards. A missing or unparsable template degrades the
//!  catalog to "unavailable" instead of taking the stream down; callers
//!  resolving ids by name handle the lookup miss.

mod lexer;
mod parser;

use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::message_id::Priority;

/// How often a block repeats in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetition {
    /// exactly once, no repetition prefix on the wire
    Single,
    /// a fixed number of times given in the template
    Multiple,
    /// a runtime-determined number of times, 1-byte count prefix
    Variable,
    /// unrecognized repetition keyword
    Error,
}

/// Wire type of one variable within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Bool,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Uuid,
    Vector3,
    Vector3d,
    Vector4,
    Quaternion,
    IpAddr,
    IpPort,
    /// fixed-size blob, payload size given in the template
    Fixed,
    /// variable-size blob with a 1-byte length prefix
    Variable1,
    /// variable-size blob with a 2-byte length prefix
    Variable2,
    /// unrecognized type keyword
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub kind: VariableKind,
    /// fixed wire size in bytes; the prefix width for Variable1/Variable2
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub name: String,
    pub repetition: Repetition,
    /// 1 for Single, the fixed count for Multiple, 0 for Variable
    pub multiplicity: u32,
    pub variables: Vec<VariableInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    pub name: String,
    /// numeric id, pre-combined with the priority class bit pattern
    pub id: u32,
    pub priority: Priority,
    pub trusted: bool,
    pub encoded: bool,
    pub deprecated: bool,
    pub blocks: Vec<BlockInfo>,
}

pub struct TemplateCatalog {
    packets: Vec<PacketInfo>,
    by_name: FxHashMap<String, usize>,
    by_id: FxHashMap<u32, usize>,
}

impl TemplateCatalog {
    pub fn parse_str(input: &str) -> anyhow::Result<TemplateCatalog> {
        let packets = parser::parse(input)?;

        let mut by_name = FxHashMap::default();
        let mut by_id = FxHashMap::default();
        for (index, packet) in packets.iter().enumerate() {
            by_name.insert(packet.name.clone(), index);
            by_id.insert(packet.id, index);
        }

        Ok(TemplateCatalog {
            packets,
            by_name,
            by_id,
        })
    }

    /// Read and parse a template file. Absence or a parse failure yields
    ///  `None` - the engine keeps running with an unavailable catalog.
    pub fn load(path: impl AsRef<Path>) -> Option<TemplateCatalog> {
        let path = path.as_ref();

        let input = match std::fs::read_to_string(path) {
            Ok(input) => input,
            Err(e) => {
                warn!("cannot read message template {:?} - catalog unavailable: {}", path, e);
                return None;
            }
        };

        match Self::parse_str(&input) {
            Ok(catalog) => {
                info!("parsed message template {:?}: {} packet types", path, catalog.len());
                Some(catalog)
            }
            Err(e) => {
                warn!("cannot parse message template {:?} - catalog unavailable: {:#}", path, e);
                None
            }
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&PacketInfo> {
        self.by_name.get(name).map(|&index| &self.packets[index])
    }

    pub fn by_id(&self, id: u32) -> Option<&PacketInfo> {
        self.by_id.get(&id).map(|&index| &self.packets[index])
    }

    pub fn packets(&self) -> &[PacketInfo] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
