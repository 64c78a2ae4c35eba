use std::borrow::Cow;
use std::fmt::{Debug, Display, Error as FmtError, Formatter};

/// Names of methods, fields
///
/// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.2.2>
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct UnqualifiedName(Cow<'static, str>);

/// Names of classes and interfaces
///
/// See <https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.2.1>
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct BinaryName(Cow<'static, str>);

pub trait Name: Sized {
    /// Check if a string would be a valid name
    fn check_valid(name: impl AsRef<str>) -> Result<(), String>;

    /// Extract the raw underlying string name
    fn as_str(&self) -> &str;

    /// Try to construct a name from a string
    fn from_string(name: String) -> Result<Self, String>;

    /// Try to construct a name from a string slice
    fn from_str(name: &str) -> Result<Self, String> {
        Self::from_string(name.to_owned())
    }
}

impl Name for UnqualifiedName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), String> {
        let name = name.as_ref();
        if name.is_empty() {
            Err(String::from("Unqualified name is empty"))
        } else if name.contains(&['.', ';', '[', '/'][..]) {
            Err(format!(
                "Unqualified name '{}' contains an illegal character",
                name
            ))
        } else if name.contains(&['<', '>'][..]) && name != "<init>" && name != "<clinit>" {
            Err(format!(
                "Only '<init>' and '<clinit>' may contain angle brackets, not '{}'",
                name
            ))
        } else {
            Ok(())
        }
    }

    fn as_str(&self) -> &str {
        self.0.as_ref()
    }

    fn from_string(name: String) -> Result<Self, String> {
        Self::check_valid(&name)?;
        Ok(UnqualifiedName(Cow::Owned(name)))
    }
}

impl Name for BinaryName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), String> {
        let name = name.as_ref();
        if name.is_empty() {
            Err(String::from("Binary name is empty"))
        } else if name.starts_with('[') {
            // Array classes show up as `CONSTANT_Class` entries in `anewarray`/`checkcast`
            Ok(())
        } else {
            name.split('/')
                .try_for_each(|segment| UnqualifiedName::check_valid(segment))
        }
    }

    fn as_str(&self) -> &str {
        self.0.as_ref()
    }

    fn from_string(name: String) -> Result<Self, String> {
        Self::check_valid(&name)?;
        Ok(BinaryName(Cow::Owned(name)))
    }
}

impl Debug for UnqualifiedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Display for UnqualifiedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Debug for BinaryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Display for BinaryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl UnqualifiedName {
    const fn name(value: &'static str) -> UnqualifiedName {
        UnqualifiedName(Cow::Borrowed(value))
    }

    // Special unqualified names - only these are allowed to have angle brackets in them
    pub const INIT: Self = Self::name("<init>");
    pub const CLINIT: Self = Self::name("<clinit>");

    // Caller-sensitive JDK methods
    pub const GETCALLERCLASS: Self = Self::name("getCallerClass");
    pub const LOAD: Self = Self::name("load");
    pub const LOADLIBRARY: Self = Self::name("loadLibrary");
}

impl BinaryName {
    const fn name(value: &'static str) -> BinaryName {
        BinaryName(Cow::Borrowed(value))
    }

    // JDK names
    pub const CLASS: Self = Self::name("java/lang/Class");
    pub const OBJECT: Self = Self::name("java/lang/Object");
    pub const RUNTIME: Self = Self::name("java/lang/Runtime");
    pub const STRING: Self = Self::name("java/lang/String");
    pub const SYSTEM: Self = Self::name("java/lang/System");
    pub const THROWABLE: Self = Self::name("java/lang/Throwable");
    pub const JDK_REFLECTION: Self = Self::name("jdk/internal/reflect/Reflection");
    pub const SUN_REFLECTION: Self = Self::name("sun/reflect/Reflection");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validity() {
        assert!(UnqualifiedName::from_str("foo").is_ok());
        assert!(UnqualifiedName::from_str("<init>").is_ok());
        assert!(UnqualifiedName::from_str("<foo>").is_err());
        assert!(UnqualifiedName::from_str("a/b").is_err());
        assert!(BinaryName::from_str("java/lang/Object").is_ok());
        assert!(BinaryName::from_str("[Ljava/lang/Object;").is_ok());
        assert!(BinaryName::from_str("java//Object").is_err());
        assert!(BinaryName::from_str("").is_err());
    }
}
