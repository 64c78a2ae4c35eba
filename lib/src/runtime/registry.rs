use super::{Class, Link};
use crate::jvm::{BinaryName, Constant, ConstantIndex, Error, MemberKind, Name};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Defined classes, by name
///
/// Compile time resolution only ever looks classes up here. Anything that isn't defined yet is
/// left for the generated code to resolve at run time.
pub struct ClassRegistry {
    classes: RwLock<HashMap<BinaryName, Arc<Class>>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry {
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Define a class, returning the registered one
    ///
    /// If a class of the same name was already defined, that one stays and is returned.
    pub fn define(&self, class: Arc<Class>) -> Arc<Class> {
        let mut classes = self.classes.write();
        classes
            .entry(class.name.clone())
            .or_insert_with(|| {
                log::debug!("defined {}", class.name);
                class
            })
            .clone()
    }

    pub fn get(&self, name: &BinaryName) -> Option<Arc<Class>> {
        self.classes.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a constant pool entry of `class` against the defined classes
    ///
    /// Successful resolutions are cached on `class`. `Ok(None)` means the entry refers to
    /// something not (yet) defined, or to an array class.
    pub fn resolve<'c>(
        &self,
        class: &'c Class,
        index: ConstantIndex,
    ) -> Result<Option<&'c Link>, Error> {
        if let Some(link) = class.link(index) {
            return Ok(Some(link));
        }

        let link = match class.constants.get(index)? {
            Constant::Class(_) => {
                let name = class.constants.get_class_name(index)?;
                if name.as_str().starts_with('[') {
                    return Ok(None);
                }
                match self.get(&name) {
                    Some(found) => Link::Class(found),
                    None => return Ok(None),
                }
            }
            Constant::FieldRef { .. } | Constant::MethodRef { .. } => {
                let member = class.constants.get_member(index)?;
                let Some(owner) = self.get(&member.class) else {
                    return Ok(None);
                };
                let found = match member.kind {
                    MemberKind::Field => Class::find_field(&owner, &member.name, &member.descriptor)
                        .map(|(class, field)| Link::Field { class, field }),
                    MemberKind::Method | MemberKind::InterfaceMethod => {
                        Class::find_method(&owner, &member.name, &member.descriptor)
                            .map(|(class, method)| Link::Method { class, method })
                    }
                };
                match found {
                    Some(link) => link,
                    None => {
                        log::debug!(
                            "{}: no member {}:{} in {}",
                            class.name,
                            member.name,
                            member.descriptor,
                            member.class
                        );
                        return Ok(None);
                    }
                }
            }
            _ => {
                return Err(Error::UnexpectedConstant {
                    index: index.0,
                    expected: "Class, Fieldref or Methodref",
                })
            }
        };

        Ok(class.set_link(index, link))
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        ClassRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jit::ObjectLayout;
    use crate::jvm::{BaseType, ClassAccessFlags, FieldAccessFlags, FieldType, UnqualifiedName};
    use crate::runtime::ClassBuilder;

    fn point() -> Arc<Class> {
        let name = BinaryName::from_str("demo/Point").unwrap();
        let mut builder = ClassBuilder::new(name, ClassAccessFlags::PUBLIC, None);
        builder.add_field(
            UnqualifiedName::from_str("x").unwrap(),
            FieldType::Base(BaseType::Int),
            FieldAccessFlags::PUBLIC,
        );
        builder.build(&ObjectLayout::default())
    }

    #[test]
    fn first_definition_wins() {
        let registry = ClassRegistry::new();
        let first = point();
        let second = point();
        assert!(Arc::ptr_eq(&registry.define(first.clone()), &first));
        assert!(Arc::ptr_eq(&registry.define(second), &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolution_is_cached() {
        let registry = ClassRegistry::new();
        let point = registry.define(point());

        let caller_name = BinaryName::from_str("demo/Caller").unwrap();
        let mut builder = ClassBuilder::new(caller_name, ClassAccessFlags::PUBLIC, None);
        let point_name = BinaryName::from_str("demo/Point").unwrap();
        let field = builder
            .constants()
            .get_field_ref(&point_name, &UnqualifiedName::from_str("x").unwrap(), "I")
            .unwrap();
        let missing = builder
            .constants()
            .get_class(&BinaryName::from_str("demo/Missing").unwrap())
            .unwrap();
        let caller = builder.build(&ObjectLayout::default());

        match registry.resolve(&caller, field).unwrap() {
            Some(Link::Field { class, field }) => {
                assert!(Arc::ptr_eq(class, &point));
                assert_eq!(field.name.as_str(), "x");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(caller.link(field).is_some());
        assert!(registry.resolve(&caller, missing.0).unwrap().is_none());
        assert!(caller.link(missing.0).is_none());
    }
}
