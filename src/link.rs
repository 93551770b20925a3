use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::port::Port;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub usize);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("unknown port id {0}")]
    UnknownPort(PortId),
    #[error("port {0:?} is already part of a link")]
    DuplicatePort(String),
    #[error("port {0:?} cannot be linked to itself")]
    SamePort(String),
}

/// Two ports joined by one emulated link. The delay applies in both
/// directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLink {
    pub a: PortId,
    pub b: PortId,
    pub delay_us: u64,
    pub delay_cycles: u64,
}

pub struct PortEntry {
    pub id: PortId,
    pub port: Arc<dyn Port>,
    pub peer: PortId,
    pub delay_cycles: u64,
}

impl PortEntry {
    pub fn name(&self) -> &str {
        self.port.name()
    }
}

/// Every port taking part in the emulation, indexed by `PortId`.
///
/// Ids are dense and assigned in link order: link `n` owns ports `2n` and
/// `2n + 1`.
#[derive(Default)]
pub struct PortTable {
    entries: Vec<PortEntry>,
    links: Vec<PortLink>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(
        &mut self,
        a: Arc<dyn Port>,
        b: Arc<dyn Port>,
        delay_us: u64,
        delay_cycles: u64,
    ) -> Result<PortLink, LinkError> {
        if a.name() == b.name() {
            return Err(LinkError::SamePort(a.name().to_string()));
        }
        for port in [&a, &b] {
            if self.lookup(port.name()).is_some() {
                return Err(LinkError::DuplicatePort(port.name().to_string()));
            }
        }

        let id_a = PortId(self.entries.len());
        let id_b = PortId(id_a.0 + 1);
        self.entries.push(PortEntry {
            id: id_a,
            port: a,
            peer: id_b,
            delay_cycles,
        });
        self.entries.push(PortEntry {
            id: id_b,
            port: b,
            peer: id_a,
            delay_cycles,
        });
        let link = PortLink {
            a: id_a,
            b: id_b,
            delay_us,
            delay_cycles,
        };
        self.links.push(link);
        Ok(link)
    }

    pub fn get(&self, id: PortId) -> Result<&PortEntry, LinkError> {
        self.entries.get(id.0).ok_or(LinkError::UnknownPort(id))
    }

    pub fn peer_of(&self, id: PortId) -> Result<PortId, LinkError> {
        self.get(id).map(|e| e.peer)
    }

    pub fn lookup(&self, name: &str) -> Option<PortId> {
        self.entries.iter().find(|e| e.name() == name).map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortEntry> {
        self.entries.iter()
    }

    pub fn links(&self) -> &[PortLink] {
        &self.links
    }

    /// "a -> b" label for the direction that enters at `id`.
    pub fn path_label(&self, id: PortId) -> Result<String, LinkError> {
        let from = self.get(id)?;
        let to = self.get(from.peer)?;
        Ok(format!("{} -> {}", from.name(), to.name()))
    }
}
