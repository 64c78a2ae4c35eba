use super::CompiledMethod;
use crate::backend::MemoryKind;
use crate::jit::ObjectLayout;
use crate::jvm::class_file::{
    AttributeLike, ClassFile, Code, ExceptionHandler, LineNumber, LineNumberTable,
};
use crate::jvm::{
    BinaryName, ClassAccessFlags, ConstantIndex, ConstantsPool, Error, FieldAccessFlags,
    FieldType, MethodAccessFlags, MethodDescriptor, Name, ParseDescriptor, RenderDescriptor,
    UnqualifiedName, ValueKind,
};
use bitflags::bitflags;
use std::fmt::{Debug, Error as FmtError, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

bitflags! {
    /// Facts about a class computed when it is defined
    pub struct ClassFlags: u8 {
        /// Declares a `final` instance field, so constructors need a store-store barrier
        const HAS_FINAL_MEMBER = 0b1;
    }
}

/// Loaded class, as seen by the compiler
///
/// Classes are immutable once built apart from two things: the cache of linked constant pool
/// entries and the initialization flag. Both only ever go from "unset" to "set".
pub struct Class {
    pub name: BinaryName,
    pub access_flags: ClassAccessFlags,
    pub super_class: Option<Arc<Class>>,
    pub constants: ConstantsPool,
    pub fields: Vec<Arc<Field>>,
    pub methods: Vec<Arc<Method>>,

    /// Virtual methods, by vtable index (inherited entries first)
    pub vtable: Vec<Arc<Method>>,

    /// Size of an instance, including the object header
    pub instance_size: usize,

    /// Size of the static field table, including its header
    pub static_size: usize,

    pub flags: ClassFlags,

    /// One entry per constant pool slot, set when that entry is first resolved
    links: Box<[OnceLock<Link>]>,
    initialized: AtomicBool,
}

/// Resolved constant pool entry
#[derive(Clone)]
pub enum Link {
    Class(Arc<Class>),
    Field { class: Arc<Class>, field: Arc<Field> },
    Method { class: Arc<Class>, method: Arc<Method> },
}

impl Debug for Link {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Link::Class(class) => write!(f, "Class({})", class.name),
            Link::Field { class, field } => write!(f, "Field({}.{})", class.name, field.name),
            Link::Method { method, .. } => write!(f, "Method({})", method.qualified_name()),
        }
    }
}

impl Class {
    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(ClassAccessFlags::INTERFACE)
    }

    pub fn has_final_member(&self) -> bool {
        self.flags.contains(ClassFlags::HAS_FINAL_MEMBER)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Record that `<clinit>` has completed
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Constant pool entry, if it has already been resolved
    pub fn link(&self, index: ConstantIndex) -> Option<&Link> {
        self.links.get(index.0 as usize).and_then(|link| link.get())
    }

    /// Cache a resolved constant pool entry (if another thread got there first, theirs is kept)
    pub(crate) fn set_link(&self, index: ConstantIndex, link: Link) -> Option<&Link> {
        self.links
            .get(index.0 as usize)
            .map(|slot| slot.get_or_init(|| link))
    }

    /// Method declared directly on this class
    pub fn declared_method(&self, name: &UnqualifiedName, descriptor: &str) -> Option<&Arc<Method>> {
        self.methods
            .iter()
            .find(|method| &method.name == name && method.descriptor.render() == descriptor)
    }

    /// Is `name` this class or one of its superclasses?
    pub fn is_subclass_of(&self, name: &BinaryName) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if &class.name == name {
                return true;
            }
            current = class.super_class.as_deref();
        }
        false
    }

    /// Look a field up in a class and its superclasses, returning the declaring class too
    pub fn find_field(
        class: &Arc<Class>,
        name: &UnqualifiedName,
        descriptor: &str,
    ) -> Option<(Arc<Class>, Arc<Field>)> {
        let mut current = Some(class);
        while let Some(class) = current {
            let found = class
                .fields
                .iter()
                .find(|field| &field.name == name && field.descriptor.render() == descriptor);
            if let Some(field) = found {
                return Some((class.clone(), field.clone()));
            }
            current = class.super_class.as_ref();
        }
        None
    }

    /// Look a method up in a class and its superclasses, returning the declaring class too
    pub fn find_method(
        class: &Arc<Class>,
        name: &UnqualifiedName,
        descriptor: &str,
    ) -> Option<(Arc<Class>, Arc<Method>)> {
        let mut current = Some(class);
        while let Some(class) = current {
            if let Some(method) = class.declared_method(name, descriptor) {
                return Some((class.clone(), method.clone()));
            }
            current = class.super_class.as_ref();
        }
        None
    }
}

impl Debug for Class {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("super_class", &self.super_class.as_ref().map(|sup| &sup.name))
            .field("methods", &self.methods.len())
            .field("fields", &self.fields.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct Field {
    pub class_name: BinaryName,
    pub name: UnqualifiedName,
    pub descriptor: FieldType,
    pub access_flags: FieldAccessFlags,

    /// Offset in the instance (or static table, for static fields), in bytes
    pub offset: usize,
}

impl Field {
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(FieldAccessFlags::STATIC)
    }

    pub fn is_volatile(&self) -> bool {
        self.access_flags.contains(FieldAccessFlags::VOLATILE)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags.contains(FieldAccessFlags::FINAL)
    }

    pub fn value_kind(&self) -> ValueKind {
        ValueKind::from(&self.descriptor)
    }

    pub fn memory_kind(&self) -> MemoryKind {
        match &self.descriptor {
            FieldType::Base(base_type) => MemoryKind::from_base_type(*base_type),
            FieldType::Object(_) | FieldType::Array(_) => MemoryKind::Reference,
        }
    }

    fn size(&self, layout: &ObjectLayout) -> usize {
        match &self.descriptor {
            FieldType::Base(base_type) => base_type.size(),
            FieldType::Object(_) | FieldType::Array(_) => layout.reference_size,
        }
    }
}

/// Body of a method with bytecode
///
/// Immutable once built: compiling against an `Arc<MethodCode>` is compiling against a private
/// snapshot of the method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytecode: Vec<u8>,
    pub handlers: Vec<ExceptionHandler>,
    pub line_numbers: Vec<LineNumber>,
}

impl MethodCode {
    pub fn from_code_attribute(code: Code, constants: &ConstantsPool) -> Result<MethodCode, Error> {
        let line_numbers = LineNumberTable::find(&code.attributes, constants)?
            .map(|table| table.0)
            .unwrap_or_default();
        Ok(MethodCode {
            max_stack: code.max_stack,
            max_locals: code.max_locals,
            bytecode: code.code_array,
            handlers: code.exception_table,
            line_numbers,
        })
    }
}

pub struct Method {
    pub class_name: BinaryName,
    pub name: UnqualifiedName,
    pub descriptor: MethodDescriptor,
    pub access_flags: MethodAccessFlags,

    /// Set for methods dispatched through the vtable
    pub vtable_index: Option<usize>,

    code: Option<Arc<MethodCode>>,

    /// Written exactly once, after the code is findable through the method lookup
    compiled: OnceLock<Arc<CompiledMethod>>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    pub fn is_synchronized(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::SYNCHRONIZED)
    }

    pub fn is_native(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::ABSTRACT)
    }

    pub fn is_private(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::PRIVATE)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::FINAL)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == UnqualifiedName::INIT
    }

    /// Slots taken by parameters (including `this`)
    pub fn parameter_footprint(&self) -> usize {
        self.descriptor.parameter_length(!self.is_static())
    }

    pub fn code(&self) -> Option<&Arc<MethodCode>> {
        self.code.as_ref()
    }

    pub fn compiled(&self) -> Option<&Arc<CompiledMethod>> {
        self.compiled.get()
    }

    /// Install compiled code, unless some other compilation already did
    pub(crate) fn publish(&self, compiled: Arc<CompiledMethod>) -> bool {
        self.compiled.set(compiled).is_ok()
    }

    /// Name for diagnostics, eg. `demo/Point.add(II)I`
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}{}",
            self.class_name,
            self.name,
            self.descriptor.render()
        )
    }

    fn is_virtual(&self) -> bool {
        !self.is_static()
            && !self.is_private()
            && self.name != UnqualifiedName::INIT
            && self.name != UnqualifiedName::CLINIT
    }
}

impl Debug for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Method")
            .field("name", &self.qualified_name())
            .field("access_flags", &self.access_flags)
            .field("vtable_index", &self.vtable_index)
            .field("compiled", &self.compiled().is_some())
            .finish()
    }
}

struct FieldDecl {
    name: UnqualifiedName,
    descriptor: FieldType,
    access_flags: FieldAccessFlags,
}

struct MethodDecl {
    name: UnqualifiedName,
    descriptor: MethodDescriptor,
    access_flags: MethodAccessFlags,
    code: Option<MethodCode>,
}

/// Assemble a [`Class`], computing field offsets and the vtable
pub struct ClassBuilder {
    name: BinaryName,
    access_flags: ClassAccessFlags,
    super_class: Option<Arc<Class>>,
    constants: ConstantsPool,
    fields: Vec<FieldDecl>,
    methods: Vec<MethodDecl>,
}

impl ClassBuilder {
    pub fn new(
        name: BinaryName,
        access_flags: ClassAccessFlags,
        super_class: Option<Arc<Class>>,
    ) -> ClassBuilder {
        ClassBuilder {
            name,
            access_flags,
            super_class,
            constants: ConstantsPool::new(),
            fields: vec![],
            methods: vec![],
        }
    }

    /// Start from a parsed class file
    ///
    /// The superclass must already be built (it is `None` only if it isn't known to the caller).
    pub fn from_class_file(
        class_file: ClassFile,
        super_class: Option<Arc<Class>>,
    ) -> Result<ClassBuilder, Error> {
        let constants = class_file.constants;
        let name = constants.get_class_name(class_file.this_class)?;

        let mut fields = vec![];
        for field in class_file.fields {
            let descriptor = constants.get_utf8_str(field.descriptor_index)?;
            fields.push(FieldDecl {
                name: unqualified_name(constants.get_utf8_str(field.name_index)?)?,
                descriptor: FieldType::parse(descriptor)
                    .map_err(|_| Error::MalformedDescriptor(descriptor.to_owned()))?,
                access_flags: field.access_flags,
            });
        }

        let mut methods = vec![];
        for method in class_file.methods {
            let descriptor = constants.get_utf8_str(method.descriptor_index)?;
            let code = match Code::find(&method.attributes, &constants)? {
                Some(code) => Some(MethodCode::from_code_attribute(code, &constants)?),
                None => None,
            };
            methods.push(MethodDecl {
                name: unqualified_name(constants.get_utf8_str(method.name_index)?)?,
                descriptor: MethodDescriptor::parse(descriptor)
                    .map_err(|_| Error::MalformedDescriptor(descriptor.to_owned()))?,
                access_flags: method.access_flags,
                code,
            });
        }

        Ok(ClassBuilder {
            name,
            access_flags: class_file.access_flags,
            super_class,
            constants,
            fields,
            methods,
        })
    }

    pub fn name(&self) -> &BinaryName {
        &self.name
    }

    /// Constant pool, for building bytecode that refers to it
    pub fn constants(&mut self) -> &mut ConstantsPool {
        &mut self.constants
    }

    pub fn add_field(
        &mut self,
        name: UnqualifiedName,
        descriptor: FieldType,
        access_flags: FieldAccessFlags,
    ) -> &mut ClassBuilder {
        self.fields.push(FieldDecl {
            name,
            descriptor,
            access_flags,
        });
        self
    }

    pub fn add_method(
        &mut self,
        name: UnqualifiedName,
        descriptor: MethodDescriptor,
        access_flags: MethodAccessFlags,
        code: Option<MethodCode>,
    ) -> &mut ClassBuilder {
        self.methods.push(MethodDecl {
            name,
            descriptor,
            access_flags,
            code,
        });
        self
    }

    pub fn build(self, layout: &ObjectLayout) -> Arc<Class> {
        let mut flags = ClassFlags::empty();

        // Fields: instance fields continue after the superclass's, statics get their own table
        let mut instance_size = self
            .super_class
            .as_ref()
            .map_or(layout.header_size, |sup| sup.instance_size);
        let mut static_size = layout.header_size;
        let mut fields = vec![];
        for decl in self.fields {
            let mut field = Field {
                class_name: self.name.clone(),
                name: decl.name,
                descriptor: decl.descriptor,
                access_flags: decl.access_flags,
                offset: 0,
            };
            let size = field.size(layout);
            let end = if field.is_static() {
                &mut static_size
            } else {
                if field.is_final() {
                    flags |= ClassFlags::HAS_FINAL_MEMBER;
                }
                &mut instance_size
            };
            field.offset = (*end + size - 1) / size * size;
            *end = field.offset + size;
            fields.push(Arc::new(field));
        }

        // Vtable: overriding methods take over their parent's slot, new ones are appended
        let is_interface = self.access_flags.contains(ClassAccessFlags::INTERFACE);
        let mut vtable: Vec<Option<Arc<Method>>> = self
            .super_class
            .as_ref()
            .map(|sup| sup.vtable.iter().cloned().map(Some).collect())
            .unwrap_or_default();
        let mut methods = vec![];
        for decl in self.methods {
            let mut method = Method {
                class_name: self.name.clone(),
                name: decl.name,
                descriptor: decl.descriptor,
                access_flags: decl.access_flags,
                vtable_index: None,
                code: decl.code.map(Arc::new),
                compiled: OnceLock::new(),
            };
            if method.is_virtual() && !is_interface {
                let rendered = method.descriptor.render();
                let inherited = vtable.iter().position(|entry| {
                    entry.as_ref().map_or(false, |entry| {
                        entry.name == method.name && entry.descriptor.render() == rendered
                    })
                });
                let index = match inherited {
                    Some(index) => index,
                    None => {
                        vtable.push(None);
                        vtable.len() - 1
                    }
                };
                method.vtable_index = Some(index);
                let method = Arc::new(method);
                vtable[index] = Some(method.clone());
                methods.push(method);
            } else {
                methods.push(Arc::new(method));
            }
        }

        let links = (0..self.constants.slot_count())
            .map(|_| OnceLock::new())
            .collect();

        Arc::new(Class {
            name: self.name,
            access_flags: self.access_flags,
            super_class: self.super_class,
            constants: self.constants,
            fields,
            methods,
            vtable: vtable.into_iter().flatten().collect(),
            instance_size,
            static_size,
            flags,
            links,
            initialized: AtomicBool::new(false),
        })
    }
}

fn unqualified_name(name: &str) -> Result<UnqualifiedName, Error> {
    UnqualifiedName::from_str(name).map_err(Error::MalformedName)
}
