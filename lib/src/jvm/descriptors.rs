use super::{BinaryName, Name};
use crate::util::Width;
use std::io::{Error, ErrorKind, Result};
use std::iter::Peekable;
use std::str::Chars;

/// Utility trait for converting descriptors to string representations
pub trait RenderDescriptor {
    /// Turn the descriptor into a string
    fn render(&self) -> String {
        let mut string = String::new();
        self.render_to(&mut string);
        string
    }

    /// Write the descriptor to a string
    fn render_to(&self, write_to: &mut String);
}

pub trait ParseDescriptor: Sized {
    /// Parse a descriptor from a string
    fn parse(source: &str) -> Result<Self> {
        let mut chars = source.chars().peekable();
        let ret = Self::parse_from(&mut chars)?;
        match chars.next() {
            None => Ok(ret),
            Some(c) => {
                let msg = format!("Unexpected leftover input '{}'", c);
                Err(Error::new(ErrorKind::InvalidInput, msg))
            }
        }
    }

    /// Read the descriptor from a character buffer
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self>;
}

/// Primitive value types
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

impl BaseType {
    /// Size of an array element or field of this type, in bytes
    pub const fn size(self) -> usize {
        match self {
            BaseType::Byte | BaseType::Boolean => 1,
            BaseType::Char | BaseType::Short => 2,
            BaseType::Float | BaseType::Int => 4,
            BaseType::Double | BaseType::Long => 8,
        }
    }

    /// Decode the `atype` operand of `newarray`
    pub const fn from_array_type_code(atype: u8) -> Option<BaseType> {
        match atype {
            4 => Some(BaseType::Boolean),
            5 => Some(BaseType::Char),
            6 => Some(BaseType::Float),
            7 => Some(BaseType::Double),
            8 => Some(BaseType::Byte),
            9 => Some(BaseType::Short),
            10 => Some(BaseType::Int),
            11 => Some(BaseType::Long),
            _ => None,
        }
    }

    /// Inverse of [`BaseType::from_array_type_code`]
    pub const fn array_type_code(self) -> u8 {
        match self {
            BaseType::Boolean => 4,
            BaseType::Char => 5,
            BaseType::Float => 6,
            BaseType::Double => 7,
            BaseType::Byte => 8,
            BaseType::Short => 9,
            BaseType::Int => 10,
            BaseType::Long => 11,
        }
    }
}

impl Width for BaseType {
    fn width(&self) -> usize {
        match self {
            BaseType::Double | BaseType::Long => 2,
            _ => 1,
        }
    }
}

impl RenderDescriptor for BaseType {
    fn render_to(&self, write_to: &mut String) {
        let c = match self {
            BaseType::Byte => 'B',
            BaseType::Char => 'C',
            BaseType::Double => 'D',
            BaseType::Float => 'F',
            BaseType::Int => 'I',
            BaseType::Long => 'J',
            BaseType::Short => 'S',
            BaseType::Boolean => 'Z',
        };
        write_to.push(c);
    }
}

impl ParseDescriptor for BaseType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        let typ = match source.next() {
            Some('B') => BaseType::Byte,
            Some('C') => BaseType::Char,
            Some('D') => BaseType::Double,
            Some('F') => BaseType::Float,
            Some('I') => BaseType::Int,
            Some('J') => BaseType::Long,
            Some('S') => BaseType::Short,
            Some('Z') => BaseType::Boolean,
            Some(c) => {
                let msg = format!("Invalid base type character '{}'", c);
                return Err(Error::new(ErrorKind::InvalidInput, msg));
            }
            None => {
                let msg = "Missing base type character";
                return Err(Error::new(ErrorKind::UnexpectedEof, msg));
            }
        };
        Ok(typ)
    }
}

/// Type of a field, parameter, or return value
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldType {
    Base(BaseType),
    Object(BinaryName),

    /// One array dimension around the element type (`[[I` is an array of `[I`)
    Array(Box<FieldType>),
}

impl Width for FieldType {
    fn width(&self) -> usize {
        match self {
            FieldType::Base(base_type) => base_type.width(),
            FieldType::Object(_) | FieldType::Array(_) => 1,
        }
    }
}

impl FieldType {
    pub const fn int() -> FieldType {
        FieldType::Base(BaseType::Int)
    }

    pub const fn long() -> FieldType {
        FieldType::Base(BaseType::Long)
    }

    pub const fn object(class_name: BinaryName) -> FieldType {
        FieldType::Object(class_name)
    }

    pub fn array(element_type: FieldType) -> FieldType {
        FieldType::Array(Box::new(element_type))
    }

    /// Does a value of this type hold a heap reference?
    pub fn is_reference(&self) -> bool {
        !matches!(self, FieldType::Base(_))
    }
}

impl RenderDescriptor for FieldType {
    fn render_to(&self, write_to: &mut String) {
        match self {
            FieldType::Base(base_type) => base_type.render_to(write_to),
            FieldType::Object(class_name) => {
                write_to.push('L');
                write_to.push_str(class_name.as_str());
                write_to.push(';');
            }
            FieldType::Array(element_type) => {
                write_to.push('[');
                element_type.render_to(write_to);
            }
        }
    }
}

impl ParseDescriptor for FieldType {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        match source.peek().copied() {
            None => Err(Error::new(ErrorKind::UnexpectedEof, "Missing field type")),
            Some('L') => {
                source.next();
                let mut class_name = String::new();
                loop {
                    match source.next() {
                        Some(';') => break,
                        Some(c) => class_name.push(c),
                        None => {
                            let msg = format!("Missing terminator for 'L{}'", class_name);
                            return Err(Error::new(ErrorKind::UnexpectedEof, msg));
                        }
                    }
                }
                BinaryName::from_string(class_name)
                    .map(FieldType::Object)
                    .map_err(|msg| Error::new(ErrorKind::InvalidInput, msg))
            }
            Some('[') => {
                source.next();
                FieldType::parse_from(source).map(FieldType::array)
            }
            Some(_) => BaseType::parse_from(source).map(FieldType::Base),
        }
    }
}

/// Signature of a method
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    pub return_type: Option<FieldType>, // `None` is for `void` (ie. no return)
}

impl MethodDescriptor {
    /// Total slots taken by parameters (not the same as the length of the vector), which must be
    /// 255 or less for it to be valid
    pub fn parameter_length(&self, has_this_param: bool) -> usize {
        let this_len = if has_this_param { 1 } else { 0 };
        this_len
            + self
                .parameters
                .iter()
                .map(|parameter| parameter.width())
                .sum::<usize>()
    }
}

impl RenderDescriptor for MethodDescriptor {
    fn render_to(&self, write_to: &mut String) {
        write_to.push('(');
        for parameter in &self.parameters {
            parameter.render_to(write_to);
        }
        write_to.push(')');
        match &self.return_type {
            None => write_to.push('V'),
            Some(typ) => typ.render_to(write_to),
        };
    }
}

impl ParseDescriptor for MethodDescriptor {
    fn parse_from(source: &mut Peekable<Chars>) -> Result<Self> {
        if source.next() != Some('(') {
            let msg = "Expected '(' for method";
            return Err(Error::new(ErrorKind::InvalidInput, msg));
        }

        let mut parameters = vec![];
        loop {
            match source.peek().copied() {
                Some(')') => {
                    source.next();
                    break;
                }
                Some(_) => parameters.push(FieldType::parse_from(source)?),
                None => {
                    let msg = "Expected ')' for method";
                    return Err(Error::new(ErrorKind::UnexpectedEof, msg));
                }
            }
        }

        let return_type = if source.next_if_eq(&'V').is_some() {
            None
        } else {
            Some(FieldType::parse_from(source)?)
        };

        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_types() {
        let parsed = FieldType::parse("[[Ljava/lang/String;").unwrap();
        assert_eq!(
            parsed,
            FieldType::array(FieldType::array(FieldType::object(BinaryName::STRING)))
        );
        assert_eq!(parsed.render(), "[[Ljava/lang/String;");
        assert!(parsed.is_reference());
        assert_eq!(FieldType::parse("J").unwrap().width(), 2);
        assert!(FieldType::parse("Ljava/lang/Object").is_err());
        assert!(FieldType::parse("Q").is_err());
    }

    #[test]
    fn method_descriptors() {
        let descriptor = MethodDescriptor::parse("(IDLjava/lang/Object;[J)V").unwrap();
        assert_eq!(descriptor.parameters.len(), 4);
        assert_eq!(descriptor.return_type, None);
        assert_eq!(descriptor.parameter_length(false), 5);
        assert_eq!(descriptor.parameter_length(true), 6);
        assert_eq!(descriptor.render(), "(IDLjava/lang/Object;[J)V");
        assert!(MethodDescriptor::parse("(I").is_err());
        assert!(MethodDescriptor::parse("()VV").is_err());
    }
}
