use super::CompiledMethod;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Compiled methods, by code address
///
/// Used to map return addresses found on the stack back to the method they belong to.
pub struct MethodLookup {
    methods: RwLock<BTreeMap<u64, Arc<CompiledMethod>>>,
}

impl MethodLookup {
    pub fn new() -> Self {
        MethodLookup {
            methods: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, method: Arc<CompiledMethod>) {
        self.methods.write().insert(method.start(), method);
    }

    /// Method whose code contains `address`
    pub fn find(&self, address: u64) -> Option<Arc<CompiledMethod>> {
        let methods = self.methods.read();
        let (_, method) = methods.range(..=address).next_back()?;
        if method.contains(address) {
            Some(method.clone())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MethodLookup {
    fn default() -> Self {
        MethodLookup::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jit::FrameMapTable;

    fn method(start: u64, len: usize) -> Arc<CompiledMethod> {
        Arc::new(CompiledMethod::new(
            format!("m{:x}", start),
            start,
            vec![0; len].into_boxed_slice(),
            1,
            FrameMapTable::default(),
            vec![],
            vec![],
            vec![],
        ))
    }

    #[test]
    fn finds_enclosing_method() {
        let lookup = MethodLookup::new();
        lookup.insert(method(0x100, 0x10));
        lookup.insert(method(0x200, 0x40));
        assert_eq!(lookup.len(), 2);

        assert_eq!(lookup.find(0x100).map(|m| m.start()), Some(0x100));
        assert_eq!(lookup.find(0x10f).map(|m| m.start()), Some(0x100));
        assert!(lookup.find(0x110).is_none());
        assert!(lookup.find(0xff).is_none());
        assert_eq!(lookup.find(0x23f).map(|m| m.start()), Some(0x200));
    }
}
