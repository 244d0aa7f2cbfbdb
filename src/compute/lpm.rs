//! Host-built, device-uploaded longest-prefix-match tree (`spec.md` §4.4,
//! "Ancillary LPM build").
//!
//! A flat multi-bit trie: each node holds `2^nbits` children, indexed by
//! consuming `nbits` bits of the address per level. Built once, host-side,
//! then serialized for upload via [`AccelProvider::upload_lpm_tree`](crate::accel::AccelProvider::upload_lpm_tree).
//!
//! Prefix lengths that are not a multiple of `nbits` are rounded down to the
//! nearest node boundary; among routes landing on the same node the longest
//! original prefix wins. This trades a small amount of match precision
//! (a route can match up to `nbits - 1` bits wider than its configured
//! prefix) for a trie with no partial-node bit masking, which keeps the
//! on-device format a flat array of fixed-width records.

use crate::error::{ConfigError, Result};

const NONE: u32 = u32::MAX;
pub const NO_PORT: u8 = u8::MAX;

/// A flat-array multibit LPM trie over 32-bit addresses.
#[derive(Debug)]
pub struct LpmTree {
    nbits: u8,
    width: u32,
    children: Vec<u32>,
    ports: Vec<u8>,
    prefix_lens: Vec<u8>,
}

impl LpmTree {
    /// `nbits` must be 1, 2 or 4 (the strides Click's `biplookup.cc` builds for).
    pub fn new(nbits: u8) -> Result<Self> {
        if !matches!(nbits, 1 | 2 | 4) {
            return Err(ConfigError::InvalidLpmBits { nbits }.into());
        }
        let width = 1u32 << nbits;
        Ok(Self {
            nbits,
            width,
            children: vec![NONE; width as usize],
            ports: vec![NO_PORT; width as usize],
            prefix_lens: vec![0; width as usize],
        })
    }

    pub fn nbits(&self) -> u8 {
        self.nbits
    }

    fn alloc_node(&mut self) -> usize {
        let base = self.children.len();
        self.children.resize(base + self.width as usize, NONE);
        self.ports.resize(base + self.width as usize, NO_PORT);
        self.prefix_lens.resize(base + self.width as usize, 0);
        base
    }

    /// Insert a route: `addr/mask_len -> port`. `mask_len` in `0..=32`.
    pub fn insert(&mut self, addr: u32, mask_len: u8, port: u8) {
        let mask_len = mask_len.min(32);
        let levels = mask_len / self.nbits;
        let rounded_len = levels * self.nbits;

        let mut node = 0usize;
        for level in 0..levels {
            let shift = 32 - self.nbits as u32 * (level as u32 + 1);
            let bits = ((addr >> shift) & (self.width - 1)) as usize;
            let slot = node + bits;
            if self.children[slot] == NONE {
                let child = self.alloc_node();
                self.children[slot] = child as u32;
            }
            node = self.children[slot] as usize;
        }

        // Every entry of this final node matches the rounded prefix; record
        // the route there only if it is at least as specific as whatever is
        // already installed across this node's entries, and fan it out to
        // every entry consistent with the remaining unconsumed bits being
        // "don't care" beyond rounded_len.
        let remaining = self.nbits;
        let entries = 1u32 << remaining;
        for e in 0..entries {
            let slot = node + e as usize;
            if rounded_len >= self.prefix_lens[slot] {
                self.ports[slot] = port;
                self.prefix_lens[slot] = rounded_len;
            }
        }
    }

    /// Longest-prefix-match lookup, returning `NO_PORT` on miss.
    pub fn lookup(&self, addr: u32) -> u8 {
        let max_levels = 32 / self.nbits;
        let mut node = 0usize;
        let mut best = NO_PORT;
        for level in 0..max_levels {
            let shift = 32 - self.nbits as u32 * (level as u32 + 1);
            let bits = ((addr >> shift) & (self.width - 1)) as usize;
            let slot = node + bits;
            if self.ports[slot] != NO_PORT {
                best = self.ports[slot];
            }
            let next = self.children[slot];
            if next == NONE {
                break;
            }
            node = next as usize;
        }
        best
    }

    /// Flatten to bytes for device upload: header (`nbits`, `width`, node
    /// count) followed by the three parallel arrays.
    pub fn to_device_bytes(&self) -> Vec<u8> {
        let node_count = (self.children.len() / self.width as usize) as u32;
        let mut out = Vec::with_capacity(9 + self.children.len() * 4 + self.ports.len() * 2);
        out.push(self.nbits);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&node_count.to_le_bytes());
        for &c in &self.children {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out.extend_from_slice(&self.ports);
        out.extend_from_slice(&self.prefix_lens);
        out
    }

    /// Reconstruct a tree from [`to_device_bytes`](Self::to_device_bytes) output.
    /// `nbits` is passed separately because the launch contract already
    /// carries it; it must match the header byte.
    pub fn from_device_bytes(bytes: &[u8], nbits: u8) -> Self {
        assert_eq!(bytes[0], nbits, "lpm tree nbits mismatch between header and launch arg");
        let width = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
        let node_count = u32::from_le_bytes(bytes[5..9].try_into().unwrap()) as usize;
        let total = node_count * width as usize;
        let mut off = 9;
        let children: Vec<u32> = bytes[off..off + total * 4]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        off += total * 4;
        let ports = bytes[off..off + total].to_vec();
        off += total;
        let prefix_lens = bytes[off..off + total].to_vec();
        Self {
            nbits,
            width,
            children,
            ports,
            prefix_lens,
        }
    }
}
