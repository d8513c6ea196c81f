/// APFS B-tree nodes and a bounded traversal
///
/// Every APFS object starts with a 32-byte header carrying a Fletcher-64
/// checksum. B-tree nodes follow it with a table of contents pointing into a
/// key area (growing up) and a value area (growing down from the end of the
/// block, or from the trailing `btree_info_t` in a root node).
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::ops::Range;

use crate::device::BlockSource;
use crate::error::RecoveryError;
use crate::fs::common::{u16_at, u32_at, u64_at};
use crate::recovery::ScanContext;

// ============================================================================
// Constants
// ============================================================================

pub const OBJ_HEADER_LEN: usize = 32;
pub const OBJECT_TYPE_MASK: u32 = 0x0000_FFFF;
pub const OBJECT_TYPE_BTREE: u32 = 0x0002;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x0003;

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

const NODE_HEADER_LEN: usize = 56;
/// `btree_info_t` at the end of every root node
const BTREE_INFO_LEN: usize = 40;
/// Offset value marking a deleted (ghost) value
const GHOST_VALUE: u16 = 0xFFFF;

// ============================================================================
// Checksums
// ============================================================================

/// Fletcher-64 over everything after the checksum field
pub fn fletcher64(data: &[u8]) -> u64 {
    const MOD: u64 = 0xFFFF_FFFF;
    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;
    for word in data.get(8..).unwrap_or(&[]).chunks_exact(4) {
        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as u64;
        sum1 = (sum1 + value) % MOD;
        sum2 = (sum2 + sum1) % MOD;
    }
    let check1 = MOD - ((sum1 + sum2) % MOD);
    let check2 = MOD - ((sum1 + check1) % MOD);
    (check2 << 32) | check1
}

/// Stored `o_cksum` matches the object contents
pub fn verify_object(data: &[u8]) -> bool {
    data.len() > OBJ_HEADER_LEN && u64_at(data, 0) == Some(fletcher64(data))
}

// ============================================================================
// Nodes
// ============================================================================

/// Key/value sizes of a fixed-size tree (object maps)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedKv {
    pub key: usize,
    pub value: usize,
}

/// One decoded `btree_node_phys_t`
#[derive(Debug, Clone)]
pub struct ApfsNode {
    pub oid: u64,
    pub xid: u64,
    pub flags: u16,
    pub level: u16,
    pub checksum_valid: bool,
    entries: Vec<(Range<usize>, Range<usize>)>,
    data: Vec<u8>,
}

impl ApfsNode {
    pub fn parse(data: Vec<u8>, fixed: Option<FixedKv>) -> Result<Self> {
        if data.len() < NODE_HEADER_LEN + BTREE_INFO_LEN {
            bail!("Insufficient data for B-tree node");
        }
        let field16 = |offset| u16_at(&data, offset).unwrap_or(0);

        let object_type = u32_at(&data, 24).unwrap_or(0) & OBJECT_TYPE_MASK;
        if object_type != OBJECT_TYPE_BTREE && object_type != OBJECT_TYPE_BTREE_NODE {
            bail!("Object type 0x{:X} is not a B-tree node", object_type);
        }

        let flags = field16(32);
        let level = field16(34);
        let nkeys = u32_at(&data, 36).unwrap_or(0) as usize;
        let toc_start = NODE_HEADER_LEN + field16(40) as usize;
        let toc_len = field16(42) as usize;
        let key_start = toc_start + toc_len;
        let value_end = if flags & BTNODE_ROOT != 0 {
            data.len() - BTREE_INFO_LEN
        } else {
            data.len()
        };
        if key_start > value_end {
            bail!("Table of contents overruns the node");
        }

        let is_fixed = flags & BTNODE_FIXED_KV_SIZE != 0;
        let toc_entry = if is_fixed { 4 } else { 8 };
        if nkeys.saturating_mul(toc_entry) > toc_len {
            bail!("{} keys do not fit a {}-byte table of contents", nkeys, toc_len);
        }
        let fixed = match (is_fixed, fixed) {
            (true, Some(fixed)) => Some(fixed),
            (true, None) => bail!("Fixed-size node in a variable-size tree"),
            (false, _) => None,
        };

        let mut entries = Vec::with_capacity(nkeys);
        for i in 0..nkeys {
            let toc = toc_start + i * toc_entry;
            let (k_off, k_len, v_off, v_len) = match fixed {
                Some(kv) => {
                    let v_len = if level == 0 { kv.value } else { 8 };
                    (field16(toc) as usize, kv.key, field16(toc + 2), v_len)
                }
                None => (
                    field16(toc) as usize,
                    field16(toc + 2) as usize,
                    field16(toc + 4),
                    field16(toc + 6) as usize,
                ),
            };
            if v_off == GHOST_VALUE {
                continue;
            }

            let key = key_start + k_off..key_start + k_off + k_len;
            let v_off = v_off as usize;
            if v_off > value_end || v_len > v_off {
                bail!("Value {} outside node", i);
            }
            let value = value_end - v_off..value_end - v_off + v_len;
            if key.end > value_end || value.start < key_start {
                bail!("Key {} outside node", i);
            }
            entries.push((key, value));
        }

        Ok(Self {
            oid: u64_at(&data, 8).unwrap_or(0),
            xid: u64_at(&data, 16).unwrap_or(0),
            flags,
            level,
            checksum_valid: verify_object(&data),
            entries,
            data,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key(&self, index: usize) -> &[u8] {
        self.entries
            .get(index)
            .map_or(&[][..], |(key, _)| &self.data[key.clone()])
    }

    pub fn value(&self, index: usize) -> &[u8] {
        self.entries
            .get(index)
            .map_or(&[][..], |(_, value)| &self.data[value.clone()])
    }
}

// ============================================================================
// Traversal
// ============================================================================

/// What a walk ran into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub nodes_read: u64,
    pub cycles: u64,
    /// Nodes that could not be read, parsed or resolved
    pub unreadable: u64,
    /// Stopped early on the node budget
    pub truncated: bool,
}

/// Depth-first, in-order walker bounded by a node budget and depth
pub struct TreeWalker<'a> {
    source: &'a dyn BlockSource,
    block_size: u32,
    fixed: Option<FixedKv>,
    max_nodes: u64,
    max_depth: u32,
}

impl<'a> TreeWalker<'a> {
    pub fn new(source: &'a dyn BlockSource, block_size: u32, max_nodes: u64, max_depth: u32) -> Self {
        Self {
            source,
            block_size,
            fixed: None,
            max_nodes,
            max_depth,
        }
    }

    /// A walker over a fixed-size tree (object maps)
    pub fn with_fixed(&self, fixed: FixedKv) -> Self {
        Self {
            fixed: Some(fixed),
            ..*self
        }
    }

    /// Raw object block at a physical address
    pub fn read_object(&self, paddr: u64) -> Result<Vec<u8>> {
        let offset = paddr
            .checked_mul(self.block_size as u64)
            .ok_or_else(|| anyhow::anyhow!("block {} out of range", paddr))?;
        Ok(self.source.read_at(offset, self.block_size as usize)?)
    }

    pub fn read_node(&self, paddr: u64) -> Result<ApfsNode> {
        ApfsNode::parse(self.read_object(paddr)?, self.fixed)
    }

    /// Visit every leaf entry under `root`.
    ///
    /// `resolve` maps child pointers to physical blocks (the identity for
    /// physical trees, an object map lookup for virtual ones). A child
    /// that was already visited, or that does not sit below its parent's
    /// level, is skipped and counted as a cycle.
    pub fn walk<F>(
        &self,
        root: u64,
        resolve: &dyn Fn(u64) -> Option<u64>,
        ctx: &ScanContext<'_>,
        mut visit: F,
    ) -> WalkStats
    where
        F: FnMut(&ApfsNode, usize),
    {
        let mut stats = WalkStats::default();
        let mut visited = HashSet::new();

        let Some(root_paddr) = resolve(root) else {
            tracing::warn!("B-tree root oid {} does not resolve", root);
            stats.unreadable += 1;
            return stats;
        };
        // (block, depth, parent level)
        let mut stack: Vec<(u64, u32, Option<u16>)> = vec![(root_paddr, 0, None)];

        while let Some((paddr, depth, parent_level)) = stack.pop() {
            if ctx.is_cancelled() {
                break;
            }
            if stats.nodes_read >= self.max_nodes {
                tracing::warn!("B-tree walk stopped after {} nodes", stats.nodes_read);
                stats.truncated = true;
                break;
            }
            if depth > self.max_depth {
                tracing::warn!("B-tree deeper than {} levels at block {}", self.max_depth, paddr);
                stats.unreadable += 1;
                continue;
            }
            if !visited.insert(paddr) {
                tracing::warn!("{}", RecoveryError::TraversalCycle { block: paddr });
                stats.cycles += 1;
                continue;
            }

            let node = match self.read_node(paddr) {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!("Skipping B-tree node at block {}: {:#}", paddr, e);
                    stats.unreadable += 1;
                    continue;
                }
            };
            if parent_level.is_some_and(|level| node.level >= level) {
                tracing::warn!(
                    "{} (level {} under level {})",
                    RecoveryError::TraversalCycle { block: paddr },
                    node.level,
                    parent_level.unwrap_or_default()
                );
                stats.cycles += 1;
                continue;
            }
            stats.nodes_read += 1;

            if node.is_leaf() {
                for index in 0..node.len() {
                    visit(&node, index);
                }
                continue;
            }

            for index in (0..node.len()).rev() {
                let child = u64_at(node.value(index), 0).and_then(resolve);
                match child {
                    Some(child) => stack.push((child, depth + 1, Some(node.level))),
                    None => {
                        tracing::debug!("Unresolvable child {} of block {}", index, paddr);
                        stats.unreadable += 1;
                    }
                }
            }
        }

        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::recovery::ScanOptions;

    pub(crate) const BLOCK: usize = 4096;

    /// Builds B-tree node blocks
    pub(crate) struct NodeBuilder {
        oid: u64,
        flags: u16,
        level: u16,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    }

    impl NodeBuilder {
        pub(crate) fn new(oid: u64, flags: u16, level: u16) -> Self {
            Self {
                oid,
                flags,
                level,
                entries: Vec::new(),
            }
        }

        pub(crate) fn entry(mut self, key: Vec<u8>, value: Vec<u8>) -> Self {
            self.entries.push((key, value));
            self
        }

        pub(crate) fn build(self) -> Vec<u8> {
            let mut data = vec![0u8; BLOCK];
            let object_type = if self.flags & BTNODE_ROOT != 0 {
                OBJECT_TYPE_BTREE
            } else {
                OBJECT_TYPE_BTREE_NODE
            };
            data[8..16].copy_from_slice(&self.oid.to_le_bytes());
            data[16..24].copy_from_slice(&1u64.to_le_bytes());
            data[24..28].copy_from_slice(&(object_type | 0x4000_0000).to_le_bytes());
            data[32..34].copy_from_slice(&self.flags.to_le_bytes());
            data[34..36].copy_from_slice(&self.level.to_le_bytes());
            data[36..40].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());

            let fixed = self.flags & BTNODE_FIXED_KV_SIZE != 0;
            let toc_entry = if fixed { 4 } else { 8 };
            let toc_len = self.entries.len() * toc_entry;
            data[42..44].copy_from_slice(&(toc_len as u16).to_le_bytes());

            let key_start = NODE_HEADER_LEN + toc_len;
            let value_end = if self.flags & BTNODE_ROOT != 0 {
                BLOCK - BTREE_INFO_LEN
            } else {
                BLOCK
            };
            let (mut k_off, mut v_off) = (0usize, 0usize);
            for (i, (key, value)) in self.entries.iter().enumerate() {
                let toc = NODE_HEADER_LEN + i * toc_entry;
                data[key_start + k_off..key_start + k_off + key.len()].copy_from_slice(key);
                v_off += value.len();
                data[value_end - v_off..value_end - v_off + value.len()].copy_from_slice(value);

                data[toc..toc + 2].copy_from_slice(&(k_off as u16).to_le_bytes());
                if fixed {
                    data[toc + 2..toc + 4].copy_from_slice(&(v_off as u16).to_le_bytes());
                } else {
                    data[toc + 2..toc + 4].copy_from_slice(&(key.len() as u16).to_le_bytes());
                    data[toc + 4..toc + 6].copy_from_slice(&(v_off as u16).to_le_bytes());
                    data[toc + 6..toc + 8].copy_from_slice(&(value.len() as u16).to_le_bytes());
                }
                k_off += key.len();
            }

            seal(&mut data);
            data
        }
    }

    /// Write a valid Fletcher-64 checksum into an object block
    pub(crate) fn seal(data: &mut [u8]) {
        let checksum = fletcher64(data);
        data[0..8].copy_from_slice(&checksum.to_le_bytes());
    }

    fn put(image: &mut [u8], block: usize, data: &[u8]) {
        image[block * BLOCK..(block + 1) * BLOCK].copy_from_slice(data);
    }

    fn leaf_key(n: u64) -> Vec<u8> {
        n.to_le_bytes().to_vec()
    }

    #[test]
    fn test_fletcher64_round_trip() {
        let mut block = vec![0u8; BLOCK];
        block[100] = 0x5A;
        seal(&mut block);
        assert!(verify_object(&block));
        block[200] ^= 1;
        assert!(!verify_object(&block));
    }

    #[test]
    fn test_parse_variable_node() {
        let data = NodeBuilder::new(7, BTNODE_ROOT | BTNODE_LEAF, 0)
            .entry(leaf_key(1), b"one".to_vec())
            .entry(leaf_key(2), b"second".to_vec())
            .build();
        let node = ApfsNode::parse(data, None).unwrap();
        assert_eq!(node.len(), 2);
        assert!(node.is_leaf());
        assert!(node.checksum_valid);
        assert_eq!(node.key(1), &leaf_key(2)[..]);
        assert_eq!(node.value(0), b"one");
        assert_eq!(node.value(1), b"second");
        assert_eq!(node.value(5), b"");
    }

    #[test]
    fn test_parse_fixed_node() {
        let fixed = FixedKv { key: 16, value: 16 };
        let data = NodeBuilder::new(2, BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE, 0)
            .entry(vec![1u8; 16], vec![2u8; 16])
            .build();
        let node = ApfsNode::parse(data.clone(), Some(fixed)).unwrap();
        assert_eq!(node.value(0), &[2u8; 16][..]);
        assert!(ApfsNode::parse(data, None).is_err());
    }

    #[test]
    fn test_reject_bad_nodes() {
        let mut data = NodeBuilder::new(7, BTNODE_ROOT | BTNODE_LEAF, 0)
            .entry(leaf_key(1), b"one".to_vec())
            .build();
        data[36..40].copy_from_slice(&5000u32.to_le_bytes());
        assert!(ApfsNode::parse(data, None).is_err());

        let mut not_node = vec![0u8; BLOCK];
        not_node[24] = 0x0D;
        assert!(ApfsNode::parse(not_node, None).is_err());
    }

    #[test]
    fn test_walk_stops_on_cycle() {
        // Block 1: root index pointing at itself and at leaf block 2
        let mut image = vec![0u8; BLOCK * 4];
        let root = NodeBuilder::new(1, BTNODE_ROOT, 1)
            .entry(leaf_key(0), 1u64.to_le_bytes().to_vec())
            .entry(leaf_key(10), 2u64.to_le_bytes().to_vec())
            .build();
        let leaf = NodeBuilder::new(2, BTNODE_LEAF, 0)
            .entry(leaf_key(10), b"a".to_vec())
            .entry(leaf_key(11), b"b".to_vec())
            .build();
        put(&mut image, 1, &root);
        put(&mut image, 2, &leaf);

        let device = MemoryDevice::new(image);
        let walker = TreeWalker::new(&device, BLOCK as u32, 100, 8);
        let ctx = ScanContext::new(ScanOptions::default());
        let mut seen = Vec::new();
        let stats = walker.walk(1, &|oid| Some(oid), &ctx, |node, i| {
            seen.push(node.value(i).to_vec());
        });

        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.nodes_read, 2);
    }

    #[test]
    fn test_walk_node_budget() {
        let mut image = vec![0u8; BLOCK * 4];
        let root = NodeBuilder::new(1, BTNODE_ROOT, 1)
            .entry(leaf_key(0), 2u64.to_le_bytes().to_vec())
            .entry(leaf_key(5), 3u64.to_le_bytes().to_vec())
            .build();
        put(&mut image, 1, &root);
        for block in [2usize, 3] {
            let leaf = NodeBuilder::new(block as u64, BTNODE_LEAF, 0)
                .entry(leaf_key(block as u64), vec![block as u8])
                .build();
            put(&mut image, block, &leaf);
        }

        let device = MemoryDevice::new(image);
        let walker = TreeWalker::new(&device, BLOCK as u32, 2, 8);
        let ctx = ScanContext::new(ScanOptions::default());
        let mut count = 0;
        let stats = walker.walk(1, &|oid| Some(oid), &ctx, |_, _| count += 1);
        assert_eq!(count, 1);
        assert!(stats.truncated);
    }
}
