use crate::jvm::binary_format::{read_bytes, Deserialize};
use crate::jvm::{BinaryName, Error, Name, UnqualifiedName};
use crate::util::{Offset, OffsetVec, Width};
use byteorder::ReadBytesExt;
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;

/// Class file constants pool
///
/// Pools are either read out of a class file (and then only queried) or built up incrementally
/// with the `get_*` methods, which deduplicate entries.
#[derive(Debug, Clone)]
pub struct ConstantsPool {
    constants: OffsetVec<Constant>,

    classes: HashMap<Utf8ConstantIndex, ClassConstantIndex>,
    strings: HashMap<Utf8ConstantIndex, StringConstantIndex>,
    integers: HashMap<i32, ConstantIndex>,
    longs: HashMap<i64, ConstantIndex>,
    name_and_types: HashMap<(Utf8ConstantIndex, Utf8ConstantIndex), NameAndTypeConstantIndex>,
    member_refs: HashMap<(MemberKind, ClassConstantIndex, NameAndTypeConstantIndex), ConstantIndex>,
    invoke_dynamics: HashMap<(u16, NameAndTypeConstantIndex), ConstantIndex>,
    utf8s: HashMap<String, Utf8ConstantIndex>,
}

impl ConstantsPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantsPool {
        ConstantsPool {
            constants: OffsetVec::new_starting_at(Offset(1)),
            classes: HashMap::new(),
            strings: HashMap::new(),
            integers: HashMap::new(),
            longs: HashMap::new(),
            name_and_types: HashMap::new(),
            member_refs: HashMap::new(),
            invoke_dynamics: HashMap::new(),
            utf8s: HashMap::new(),
        }
    }

    /// Number of constant pool slots, including the unusable zero slot
    pub fn slot_count(&self) -> usize {
        self.constants.offset_len().0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstantIndex, &Constant)> + '_ {
        self.constants
            .iter()
            .map(|(offset, _, constant)| (ConstantIndex(offset.0 as u16), constant))
    }

    /// Push a constant into the constant pool, provided there is space for it
    ///
    /// Note: the largest valid index is 65535, indexing starts at 1, and some constants take two
    /// spaces.
    fn push_constant(&mut self, constant: Constant) -> Result<ConstantIndex, Error> {
        let offset = self.constants.offset_len().0;
        if offset + constant.width() > u16::MAX as usize {
            return Err(Error::ConstantPoolOverflow);
        }
        self.constants.push(constant);
        Ok(ConstantIndex(offset as u16))
    }

    /// Get or insert a utf8 constant
    pub fn get_utf8<'a, S: Into<Cow<'a, str>>>(
        &mut self,
        utf8: S,
    ) -> Result<Utf8ConstantIndex, Error> {
        let cow = utf8.into();
        if let Some(idx) = self.utf8s.get::<str>(cow.borrow()) {
            return Ok(*idx);
        }
        let owned = cow.into_owned();
        let idx = Utf8ConstantIndex(self.push_constant(Constant::Utf8(owned.clone()))?);
        self.utf8s.insert(owned, idx);
        Ok(idx)
    }

    /// Get or insert a class constant
    pub fn get_class(&mut self, name: &BinaryName) -> Result<ClassConstantIndex, Error> {
        let utf8 = self.get_utf8(name.as_str())?;
        if let Some(idx) = self.classes.get(&utf8) {
            return Ok(*idx);
        }
        let idx = ClassConstantIndex(self.push_constant(Constant::Class(utf8))?);
        self.classes.insert(utf8, idx);
        Ok(idx)
    }

    /// Get or insert a string constant
    pub fn get_string(&mut self, string: &str) -> Result<StringConstantIndex, Error> {
        let utf8 = self.get_utf8(string)?;
        if let Some(idx) = self.strings.get(&utf8) {
            return Ok(*idx);
        }
        let idx = StringConstantIndex(self.push_constant(Constant::String(utf8))?);
        self.strings.insert(utf8, idx);
        Ok(idx)
    }

    /// Get or insert an integer constant
    pub fn get_integer(&mut self, integer: i32) -> Result<ConstantIndex, Error> {
        if let Some(idx) = self.integers.get(&integer) {
            return Ok(*idx);
        }
        let idx = self.push_constant(Constant::Integer(integer))?;
        self.integers.insert(integer, idx);
        Ok(idx)
    }

    /// Get or insert a long constant (which occupies two slots)
    pub fn get_long(&mut self, long: i64) -> Result<ConstantIndex, Error> {
        if let Some(idx) = self.longs.get(&long) {
            return Ok(*idx);
        }
        let idx = self.push_constant(Constant::Long(long))?;
        self.longs.insert(long, idx);
        Ok(idx)
    }

    /// Get or insert a name & type constant
    pub fn get_name_and_type(
        &mut self,
        name: &UnqualifiedName,
        descriptor: &str,
    ) -> Result<NameAndTypeConstantIndex, Error> {
        let name = self.get_utf8(name.as_str())?;
        let descriptor = self.get_utf8(descriptor)?;
        let key = (name, descriptor);
        if let Some(idx) = self.name_and_types.get(&key) {
            return Ok(*idx);
        }
        let constant = Constant::NameAndType { name, descriptor };
        let idx = NameAndTypeConstantIndex(self.push_constant(constant)?);
        self.name_and_types.insert(key, idx);
        Ok(idx)
    }

    /// Get or insert a field reference
    pub fn get_field_ref(
        &mut self,
        class: &BinaryName,
        name: &UnqualifiedName,
        descriptor: &str,
    ) -> Result<ConstantIndex, Error> {
        self.get_member_ref(MemberKind::Field, class, name, descriptor)
    }

    /// Get or insert a method reference (`Methodref` or `InterfaceMethodref`)
    pub fn get_method_ref(
        &mut self,
        class: &BinaryName,
        name: &UnqualifiedName,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<ConstantIndex, Error> {
        let kind = if is_interface {
            MemberKind::InterfaceMethod
        } else {
            MemberKind::Method
        };
        self.get_member_ref(kind, class, name, descriptor)
    }

    fn get_member_ref(
        &mut self,
        kind: MemberKind,
        class: &BinaryName,
        name: &UnqualifiedName,
        descriptor: &str,
    ) -> Result<ConstantIndex, Error> {
        let class = self.get_class(class)?;
        let name_and_type = self.get_name_and_type(name, descriptor)?;
        let key = (kind, class, name_and_type);
        if let Some(idx) = self.member_refs.get(&key) {
            return Ok(*idx);
        }
        let constant = match kind {
            MemberKind::Field => Constant::FieldRef {
                class,
                name_and_type,
            },
            MemberKind::Method | MemberKind::InterfaceMethod => Constant::MethodRef {
                class,
                name_and_type,
                is_interface: kind == MemberKind::InterfaceMethod,
            },
        };
        let idx = self.push_constant(constant)?;
        self.member_refs.insert(key, idx);
        Ok(idx)
    }

    /// Get or insert an `invokedynamic` call site
    ///
    /// `bootstrap_method` indexes the class's `BootstrapMethods` attribute.
    pub fn get_invoke_dynamic(
        &mut self,
        bootstrap_method: u16,
        name: &UnqualifiedName,
        descriptor: &str,
    ) -> Result<ConstantIndex, Error> {
        let name_and_type = self.get_name_and_type(name, descriptor)?;
        let key = (bootstrap_method, name_and_type);
        if let Some(idx) = self.invoke_dynamics.get(&key) {
            return Ok(*idx);
        }
        let constant = Constant::InvokeDynamic {
            bootstrap_method,
            name_and_type,
        };
        let idx = self.push_constant(constant)?;
        self.invoke_dynamics.insert(key, idx);
        Ok(idx)
    }

    /// Look up a constant by index
    pub fn get(&self, index: impl Into<ConstantIndex>) -> Result<&Constant, Error> {
        let ConstantIndex(index) = index.into();
        self.constants
            .get_offset(Offset(index as usize))
            .ok_or(Error::BadConstantIndex(index))
    }

    pub fn get_utf8_str(&self, index: impl Into<ConstantIndex>) -> Result<&str, Error> {
        let index = index.into();
        match self.get(index)? {
            Constant::Utf8(string) => Ok(string),
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "Utf8",
            }),
        }
    }

    /// Name of the class referred to by a `Class` constant
    pub fn get_class_name(&self, index: impl Into<ConstantIndex>) -> Result<BinaryName, Error> {
        let index = index.into();
        match self.get(index)? {
            Constant::Class(name) => {
                let name = self.get_utf8_str(*name)?;
                BinaryName::from_str(name).map_err(Error::MalformedName)
            }
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "Class",
            }),
        }
    }

    /// Name and descriptor of a `NameAndType` constant
    pub fn get_name_and_type_strs(
        &self,
        index: impl Into<ConstantIndex>,
    ) -> Result<(UnqualifiedName, &str), Error> {
        let index = index.into();
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                let name = UnqualifiedName::from_str(self.get_utf8_str(*name)?)
                    .map_err(Error::MalformedName)?;
                Ok((name, self.get_utf8_str(*descriptor)?))
            }
            _ => Err(Error::UnexpectedConstant {
                index: index.0,
                expected: "NameAndType",
            }),
        }
    }

    /// Resolve a field or method reference to its symbolic parts
    pub fn get_member(&self, index: impl Into<ConstantIndex>) -> Result<MemberRef, Error> {
        let index = index.into();
        let (kind, class, name_and_type) = match self.get(index)? {
            Constant::FieldRef {
                class,
                name_and_type,
            } => (MemberKind::Field, *class, *name_and_type),
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                let kind = if *is_interface {
                    MemberKind::InterfaceMethod
                } else {
                    MemberKind::Method
                };
                (kind, *class, *name_and_type)
            }
            _ => {
                return Err(Error::UnexpectedConstant {
                    index: index.0,
                    expected: "FieldRef or MethodRef",
                })
            }
        };
        let (name, descriptor) = self.get_name_and_type_strs(name_and_type)?;
        Ok(MemberRef {
            kind,
            class: self.get_class_name(class)?,
            name,
            descriptor: descriptor.to_owned(),
        })
    }

    /// Read a pool from a class file, starting at the `u16` count
    pub fn read<R: ReadBytesExt>(reader: &mut R) -> Result<ConstantsPool, Error> {
        let count = u16::deserialize(reader)?;
        let mut pool = ConstantsPool::new();
        while pool.slot_count() < count as usize {
            let index = pool.slot_count() as u16;
            let constant = Constant::read(index, reader)?;
            if let Constant::Utf8(string) = &constant {
                pool.utf8s
                    .entry(string.clone())
                    .or_insert(Utf8ConstantIndex(ConstantIndex(index)));
            }
            pool.constants.push(constant);
        }
        if pool.slot_count() != count as usize {
            return Err(Error::BadConstantIndex(count));
        }
        Ok(pool)
    }
}

impl Default for ConstantsPool {
    fn default() -> Self {
        ConstantsPool::new()
    }
}

/// Symbolic field or method reference, as named by the constant pool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub kind: MemberKind,
    pub class: BinaryName,
    pub name: UnqualifiedName,
    pub descriptor: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

/// Constants as in the constant pool
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Class or an interface
    Class(Utf8ConstantIndex),

    FieldRef {
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
    },

    /// Method (this combines `Methodref` and `InterfaceMethodref`)
    MethodRef {
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
        is_interface: bool,
    },

    /// Constant object of type `java.lang.String`
    String(Utf8ConstantIndex),

    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),

    NameAndType {
        name: Utf8ConstantIndex,
        descriptor: Utf8ConstantIndex,
    },

    /// Decoded from the class file's modified UTF-8
    Utf8(String),

    MethodHandle {
        handle_kind: HandleKind,
        member: ConstantIndex,
    },

    MethodType {
        descriptor: Utf8ConstantIndex,
    },

    /// Dynamically-computed constant
    Dynamic {
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    },

    Module(Utf8ConstantIndex),
    Package(Utf8ConstantIndex),
}

impl Constant {
    /// Read one tagged constant found at `index`
    fn read<R: ReadBytesExt>(index: u16, reader: &mut R) -> Result<Constant, Error> {
        let tag = u8::deserialize(reader)?;
        let constant = match tag {
            1 => {
                let len = u16::deserialize(reader)?;
                let bytes = read_bytes(reader, len as usize)?;
                Constant::Utf8(decode_modified_utf8(&bytes)?)
            }
            3 => Constant::Integer(i32::deserialize(reader)?),
            4 => Constant::Float(f32::deserialize(reader)?),
            5 => Constant::Long(i64::deserialize(reader)?),
            6 => Constant::Double(f64::deserialize(reader)?),
            7 => Constant::Class(Utf8ConstantIndex::deserialize(reader)?),
            8 => Constant::String(Utf8ConstantIndex::deserialize(reader)?),
            9 => Constant::FieldRef {
                class: ClassConstantIndex::deserialize(reader)?,
                name_and_type: NameAndTypeConstantIndex::deserialize(reader)?,
            },
            10 | 11 => Constant::MethodRef {
                class: ClassConstantIndex::deserialize(reader)?,
                name_and_type: NameAndTypeConstantIndex::deserialize(reader)?,
                is_interface: tag == 11,
            },
            12 => Constant::NameAndType {
                name: Utf8ConstantIndex::deserialize(reader)?,
                descriptor: Utf8ConstantIndex::deserialize(reader)?,
            },
            15 => {
                let kind = u8::deserialize(reader)?;
                let handle_kind =
                    HandleKind::from_tag(kind).ok_or(Error::BadConstantTag { index, tag: kind })?;
                Constant::MethodHandle {
                    handle_kind,
                    member: ConstantIndex::deserialize(reader)?,
                }
            }
            16 => Constant::MethodType {
                descriptor: Utf8ConstantIndex::deserialize(reader)?,
            },
            17 => Constant::Dynamic {
                bootstrap_method: u16::deserialize(reader)?,
                name_and_type: NameAndTypeConstantIndex::deserialize(reader)?,
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method: u16::deserialize(reader)?,
                name_and_type: NameAndTypeConstantIndex::deserialize(reader)?,
            },
            19 => Constant::Module(Utf8ConstantIndex::deserialize(reader)?),
            20 => Constant::Package(Utf8ConstantIndex::deserialize(reader)?),
            _ => return Err(Error::BadConstantTag { index, tag }),
        };
        Ok(constant)
    }
}

/// Decode the modified UTF-8 format used in class files.
///
/// This differs from UTF-8 in two ways: `\u{0000}` is encoded with two bytes, and supplementary
/// characters are encoded as a surrogate pair of three-byte sequences. Decoding to UTF-16 code
/// units first handles both uniformly.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, Error> {
    let malformed = || Error::MalformedUtf8(bytes.to_vec());
    let continuation = |byte: Option<&u8>| -> Result<u16, Error> {
        match byte {
            Some(b) if b & 0b1100_0000 == 0b1000_0000 => Ok((b & 0x3F) as u16),
            _ => Err(malformed()),
        }
    };

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&byte) = iter.next() {
        let unit = if byte & 0b1000_0000 == 0 && byte != 0 {
            byte as u16
        } else if byte & 0b1110_0000 == 0b1100_0000 {
            let low = continuation(iter.next())?;
            ((byte & 0x1F) as u16) << 6 | low
        } else if byte & 0b1111_0000 == 0b1110_0000 {
            let mid = continuation(iter.next())?;
            let low = continuation(iter.next())?;
            ((byte & 0x0F) as u16) << 12 | mid << 6 | low
        } else {
            return Err(malformed());
        };
        units.push(unit);
    }
    String::from_utf16(&units).map_err(|_| malformed())
}

/// Almost all constants have width 1, except for `Constant::Long` and `Constant::Double`, which
/// also claim the following (unusable) index
impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct ConstantIndex(pub u16);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct Utf8ConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct StringConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct NameAndTypeConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct ClassConstantIndex(pub ConstantIndex);

impl From<Utf8ConstantIndex> for ConstantIndex {
    fn from(index: Utf8ConstantIndex) -> ConstantIndex {
        index.0
    }
}
impl From<StringConstantIndex> for ConstantIndex {
    fn from(index: StringConstantIndex) -> ConstantIndex {
        index.0
    }
}
impl From<NameAndTypeConstantIndex> for ConstantIndex {
    fn from(index: NameAndTypeConstantIndex) -> ConstantIndex {
        index.0
    }
}
impl From<ClassConstantIndex> for ConstantIndex {
    fn from(index: ClassConstantIndex) -> ConstantIndex {
        index.0
    }
}

impl Deserialize for ConstantIndex {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        u16::deserialize(reader).map(ConstantIndex)
    }
}
impl Deserialize for Utf8ConstantIndex {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        ConstantIndex::deserialize(reader).map(Utf8ConstantIndex)
    }
}
impl Deserialize for NameAndTypeConstantIndex {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        ConstantIndex::deserialize(reader).map(NameAndTypeConstantIndex)
    }
}
impl Deserialize for ClassConstantIndex {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        ConstantIndex::deserialize(reader).map(ClassConstantIndex)
    }
}

/// Type of method handle
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-5.html#jvms-5.4.3.5-220
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    pub fn from_tag(tag: u8) -> Option<HandleKind> {
        let kind = match tag {
            1 => HandleKind::GetField,
            2 => HandleKind::GetStatic,
            3 => HandleKind::PutField,
            4 => HandleKind::PutStatic,
            5 => HandleKind::InvokeVirtual,
            6 => HandleKind::InvokeStatic,
            7 => HandleKind::InvokeSpecial,
            8 => HandleKind::NewInvokeSpecial,
            9 => HandleKind::InvokeInterface,
            _ => return None,
        };
        Some(kind)
    }
}
