use lexicon_cid::Cid;
use std::collections::BTreeMap;

/// Encoded blocks keyed by their CID
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockMap {
    pub map: BTreeMap<Cid, Vec<u8>>,
}

impl BlockMap {
    pub fn new() -> BlockMap {
        BlockMap {
            map: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, cid: Cid, bytes: Vec<u8>) {
        self.map.insert(cid, bytes);
    }

    pub fn get(&self, cid: &Cid) -> Option<&Vec<u8>> {
        self.map.get(cid)
    }

    pub fn delete(&mut self, cid: &Cid) {
        self.map.remove(cid);
    }

    pub fn get_many(&self, cids: Vec<Cid>) -> BlocksAndMissing {
        let mut missing: Vec<Cid> = Vec::new();
        let mut blocks = BlockMap::new();
        for cid in cids {
            match self.map.get(&cid) {
                Some(bytes) => blocks.set(cid, bytes.clone()),
                None => missing.push(cid),
            }
        }
        BlocksAndMissing { blocks, missing }
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.map.contains_key(cid)
    }

    pub fn cids(&self) -> Vec<Cid> {
        self.map.keys().copied().collect()
    }

    pub fn add_map(&mut self, to_add: BlockMap) {
        self.map.extend(to_add.map);
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn byte_size(&self) -> usize {
        self.map.values().map(|bytes| bytes.len()).sum()
    }
}

#[derive(Debug)]
pub struct BlocksAndMissing {
    pub blocks: BlockMap,
    pub missing: Vec<Cid>,
}
