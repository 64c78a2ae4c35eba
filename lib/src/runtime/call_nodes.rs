use super::Method;
use crate::backend::CallFlags;
use parking_lot::RwLock;
use std::sync::Arc;

/// What a call site in compiled code calls, keyed on its return address
///
/// The default compile thunk looks these up to find out which method to compile, and the
/// garbage collector to find out how to treat the callee's arguments.
#[derive(Debug, Clone)]
pub struct CallNode {
    pub address: u64,

    /// Directly called method (`None` for virtual and runtime calls)
    pub target: Option<Arc<Method>>,
    pub flags: CallFlags,
}

struct Buckets {
    buckets: Vec<Vec<CallNode>>,
    count: usize,
}

impl Buckets {
    fn with_capacity(buckets: usize) -> Buckets {
        Buckets {
            buckets: vec![vec![]; buckets],
            count: 0,
        }
    }

    fn bucket_of(&self, address: u64) -> usize {
        // Code addresses are aligned, so the low bits carry little information
        let hash = (address >> 2) ^ (address >> 12);
        hash as usize & (self.buckets.len() - 1)
    }

    fn insert(&mut self, node: CallNode) {
        let bucket = self.bucket_of(node.address);
        let chain = &mut self.buckets[bucket];
        match chain.iter_mut().find(|existing| existing.address == node.address) {
            Some(existing) => *existing = node,
            None => {
                chain.push(node);
                self.count += 1;
            }
        }
    }

    fn grow(&mut self) {
        let mut grown = Buckets::with_capacity(self.buckets.len() * 2);
        for node in self.buckets.drain(..).flatten() {
            grown.insert(node);
        }
        *self = grown;
    }
}

/// Hash table of [`CallNode`]s
pub struct CallNodeTable {
    inner: RwLock<Buckets>,
}

impl CallNodeTable {
    const INITIAL_BUCKETS: usize = 16;

    pub fn new() -> Self {
        CallNodeTable {
            inner: RwLock::new(Buckets::with_capacity(Self::INITIAL_BUCKETS)),
        }
    }

    /// Add a call node, replacing any node with the same address
    pub fn insert(&self, node: CallNode) {
        let mut inner = self.inner.write();
        if inner.count >= inner.buckets.len() * 2 {
            inner.grow();
        }
        inner.insert(node);
    }

    pub fn find(&self, address: u64) -> Option<CallNode> {
        let inner = self.inner.read();
        inner.buckets[inner.bucket_of(address)]
            .iter()
            .find(|node| node.address == address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CallNodeTable {
    fn default() -> Self {
        CallNodeTable::new()
    }
}
