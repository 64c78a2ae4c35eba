use crate::jvm::class_file::{Attribute, ConstantsPool, Field, Method};
use crate::jvm::{ClassAccessFlags, ClassConstantIndex, Deserialize, Error};
use byteorder::ReadBytesExt;
use std::fs;
use std::io::BufReader;
use std::path::Path;

/// Representation of the [`class` file format of the JVM][0]
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub version: Version,
    pub constants: ConstantsPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: ClassConstantIndex,

    /// Only `java/lang/Object` has no superclass
    pub super_class: Option<ClassConstantIndex>,
    pub interfaces: Vec<ClassConstantIndex>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Magic header bytes at the front of every class file
    pub const MAGIC: u32 = 0xCAFE_BABE;

    /// Read a class file from disk
    pub fn read_from_path<P: AsRef<Path>>(path: P) -> Result<ClassFile, Error> {
        let file = fs::File::open(path)?;
        ClassFile::read(&mut BufReader::new(file))
    }

    pub fn read<R: ReadBytesExt>(reader: &mut R) -> Result<ClassFile, Error> {
        let magic = u32::deserialize(reader)?;
        if magic != ClassFile::MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let version = Version::deserialize(reader)?;
        let constants = ConstantsPool::read(reader)?;
        let access_flags = ClassAccessFlags::deserialize(reader)?;
        let this_class = ClassConstantIndex::deserialize(reader)?;
        let super_class = ClassConstantIndex::deserialize(reader)?;
        let interfaces = Vec::<ClassConstantIndex>::deserialize(reader)?;
        let fields = Vec::<Field>::deserialize(reader)?;
        let methods = Vec::<Method>::deserialize(reader)?;
        let attributes = Vec::<Attribute>::deserialize(reader)?;
        Ok(ClassFile {
            version,
            constants,
            access_flags,
            this_class,
            super_class: if (super_class.0).0 == 0 {
                None
            } else {
                Some(super_class)
            },
            interfaces,
            fields,
            methods,
            attributes,
        })
    }
}

/// Class file version
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const JAVA8: Version = Version {
        major: 52,
        minor: 0,
    };
}

impl Deserialize for Version {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        let minor = u16::deserialize(reader)?;
        let major = u16::deserialize(reader)?;
        Ok(Version { major, minor })
    }
}
