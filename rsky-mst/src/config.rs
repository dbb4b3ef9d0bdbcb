use crate::mst::codec::{DagCborCodec, KeyHasher, NodeCodec, Sha256Hasher};
use crate::mst::util::layer_for_digest;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Strategies a tree is built with. Two trees only share pointers when they
/// share a config; the default is the one the atproto repo format uses.
#[derive(Clone)]
pub struct MstConfig {
    pub codec: Arc<dyn NodeCodec>,
    pub hasher: Arc<dyn KeyHasher>,
}

impl MstConfig {
    pub fn new(codec: Arc<dyn NodeCodec>, hasher: Arc<dyn KeyHasher>) -> Self {
        MstConfig { codec, hasher }
    }

    pub fn layer_for_key(&self, key: &str) -> u32 {
        layer_for_digest(&self.hasher.digest(key.as_bytes()))
    }
}

impl Default for MstConfig {
    fn default() -> Self {
        MstConfig {
            codec: Arc::new(DagCborCodec),
            hasher: Arc::new(Sha256Hasher),
        }
    }
}

impl Debug for MstConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MstConfig")
            .field("codec", &self.codec.name())
            .field("hasher", &self.hasher.name())
            .finish()
    }
}
