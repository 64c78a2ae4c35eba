use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

/// Reference whose identity for equality, ordering, and hashing is the address it points to, not
/// the data behind it.
///
/// Used to deduplicate runtime objects (classes, methods, string literals) referenced from
/// generated code: two structurally equal objects are still distinct pool entries.
#[derive(Debug)]
pub struct RefId<'a, T: ?Sized>(pub &'a T);

impl<'a, T: ?Sized> Clone for RefId<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: ?Sized> Copy for RefId<'a, T> {}

impl<'a, T: ?Sized> Hash for RefId<'a, T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self.0, state)
    }
}

impl<'a, 'b, T: ?Sized> PartialEq<RefId<'b, T>> for RefId<'a, T> {
    fn eq(&self, other: &RefId<'b, T>) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl<'a, T: ?Sized> Eq for RefId<'a, T> {}

impl<'a, T: ?Sized> PartialOrd for RefId<'a, T> {
    fn partial_cmp(&self, other: &RefId<'a, T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a, T: ?Sized> Ord for RefId<'a, T> {
    fn cmp(&self, other: &RefId<'a, T>) -> Ordering {
        (self.0 as *const T)
            .cast::<u8>()
            .cmp(&(other.0 as *const T).cast::<u8>())
    }
}

impl<'a, T: ?Sized> Deref for RefId<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_not_equality() {
        let first = String::from("java/lang/Object");
        let second = first.clone();
        let mut seen = HashSet::new();
        assert!(seen.insert(RefId(&first)));
        assert!(seen.insert(RefId(&second)));
        assert!(!seen.insert(RefId(&first)));
        assert_eq!(*RefId(&first), *RefId(&second));
    }
}
