use super::address::Address;
use super::header::Header;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unit of application data plus the headers layers attached on the way down.
///
/// `dest == None` means "multicast to the current view". Headers are keyed by
/// protocol name; the sending layer adds its header and the receiving peer
/// layer removes it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub dest: Option<Address>,
    pub src: Option<Address>,
    pub payload: Vec<u8>,
    headers: BTreeMap<String, Header>,
}

impl Message {
    pub fn new(dest: Option<Address>, src: Option<Address>, payload: Vec<u8>) -> Self {
        Self {
            dest,
            src,
            payload,
            headers: BTreeMap::new(),
        }
    }

    /// A multicast message with no source set yet (the transport fills it in).
    pub fn multicast(payload: Vec<u8>) -> Self {
        Self::new(None, None, payload)
    }

    pub fn unicast(dest: Address, payload: Vec<u8>) -> Self {
        Self::new(Some(dest), None, payload)
    }

    pub fn is_multicast(&self) -> bool {
        match self.dest {
            None => true,
            Some(dest) => dest.is_multicast(),
        }
    }

    pub fn put_header(&mut self, name: &str, header: Header) {
        self.headers.insert(name.to_string(), header);
    }

    pub fn get_header(&self, name: &str) -> Option<&Header> {
        self.headers.get(name)
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Header> {
        self.headers.remove(name)
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Serialized size in bytes, used to cap retransmission bundles.
    pub fn size(&self) -> usize {
        bincode::serialized_size(self)
            .map(|size| size as usize)
            .unwrap_or(self.payload.len())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
