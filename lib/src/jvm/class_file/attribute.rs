use crate::jvm::{read_bytes, ClassConstantIndex, ConstantsPool, Deserialize, Error, Utf8ConstantIndex};
use byteorder::ReadBytesExt;
use std::io::Result;

/// Attributes (used in classes, fields, methods, and even on some attributes)
///
/// Only the payload is kept here. The few attributes the compiler cares about are parsed out of
/// `info` on demand through [`AttributeLike`].
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.7
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name_index: Utf8ConstantIndex,
    pub info: Vec<u8>,
}

impl Deserialize for Attribute {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let name_index = Utf8ConstantIndex::deserialize(reader)?;

        // Attribute info length is 4 bytes
        let len = u32::deserialize(reader)?;
        let info = read_bytes(reader, len as usize)?;

        Ok(Attribute { name_index, info })
    }
}

/// Attributes are all stored in the same way (see `Attribute`), but internally
/// they represent very different things. This trait is implemented by things
/// which can be parsed out of attributes.
pub trait AttributeLike: Sized {
    /// Name of the attribute
    const NAME: &'static str;

    /// Parse the attribute payload
    fn parse(info: &[u8]) -> std::result::Result<Self, Error>;

    /// Find and parse the first attribute with this name
    fn find(
        attributes: &[Attribute],
        constants: &ConstantsPool,
    ) -> std::result::Result<Option<Self>, Error> {
        for attribute in attributes {
            if constants.get_utf8_str(attribute.name_index)? == Self::NAME {
                return Self::parse(&attribute.info).map(Some);
            }
        }
        Ok(None)
    }
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.7.3
#[derive(Debug, Clone)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code_array: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
}

impl AttributeLike for Code {
    const NAME: &'static str = "Code";

    fn parse(info: &[u8]) -> std::result::Result<Self, Error> {
        let mut reader = info;
        let max_stack = u16::deserialize(&mut reader)?;
        let max_locals = u16::deserialize(&mut reader)?;
        let code_len = u32::deserialize(&mut reader)?;
        if code_len == 0 || code_len > 0xFFFF {
            return Err(Error::BadAttribute(Self::NAME));
        }
        let code_array = read_bytes(&mut reader, code_len as usize)?;
        let exception_table = Vec::<ExceptionHandler>::deserialize(&mut reader)?;
        let attributes = Vec::<Attribute>::deserialize(&mut reader)?;
        if !reader.is_empty() {
            return Err(Error::BadAttribute(Self::NAME));
        }
        Ok(Code {
            max_stack,
            max_locals,
            code_array,
            exception_table,
            attributes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Start of exception handler range (inclusive)
    pub start_pc: u16,

    /// End of exception handler range (exclusive)
    pub end_pc: u16,

    /// Start of the exception handler
    pub handler_pc: u16,

    /// Zero for a catch-all (`finally`) handler
    pub catch_type: Option<ClassConstantIndex>,
}

impl Deserialize for ExceptionHandler {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        let start_pc = u16::deserialize(reader)?;
        let end_pc = u16::deserialize(reader)?;
        let handler_pc = u16::deserialize(reader)?;
        let catch_type = ClassConstantIndex::deserialize(reader)?;
        Ok(ExceptionHandler {
            start_pc,
            end_pc,
            handler_pc,
            catch_type: if (catch_type.0).0 == 0 {
                None
            } else {
                Some(catch_type)
            },
        })
    }
}

/// [0]: https://docs.oracle.com/javase/specs/jvms/se16/html/jvms-4.html#jvms-4.7.12
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumberTable(pub Vec<LineNumber>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line_number: u16,
}

impl Deserialize for LineNumber {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        Ok(LineNumber {
            start_pc: u16::deserialize(reader)?,
            line_number: u16::deserialize(reader)?,
        })
    }
}

impl AttributeLike for LineNumberTable {
    const NAME: &'static str = "LineNumberTable";

    fn parse(info: &[u8]) -> std::result::Result<Self, Error> {
        let mut reader = info;
        let entries = Vec::<LineNumber>::deserialize(&mut reader)?;
        if !reader.is_empty() {
            return Err(Error::BadAttribute(Self::NAME));
        }
        Ok(LineNumberTable(entries))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_attribute() {
        let info: Vec<u8> = vec![
            0, 2, // max_stack
            0, 1, // max_locals
            0, 0, 0, 2, 0x03, 0xac, // iconst_0; ireturn
            0, 1, 0, 0, 0, 1, 0, 1, 0, 0, // catch-all handler
            0, 0, // no attributes
        ];
        let code = Code::parse(&info).unwrap();
        assert_eq!(code.max_stack, 2);
        assert_eq!(code.code_array, vec![0x03, 0xac]);
        assert_eq!(
            code.exception_table,
            vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 1,
                handler_pc: 1,
                catch_type: None,
            }]
        );

        let truncated = &info[..info.len() - 1];
        assert!(Code::parse(truncated).is_err());
    }

    #[test]
    fn line_numbers() {
        let info: Vec<u8> = vec![0, 2, 0, 0, 0, 10, 0, 4, 0, 11];
        let table = LineNumberTable::parse(&info).unwrap();
        assert_eq!(table.0[1], LineNumber { start_pc: 4, line_number: 11 });
    }
}
