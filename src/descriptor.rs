use std::fmt;
use std::str::Chars;

use crate::error::Error;
use crate::insn::ValueKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    Object(String),
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn parse(descriptor: &str) -> Result<FieldType, Error> {
        let mut chars = descriptor.chars();
        let ty = parse_field_type(&mut chars, descriptor)?;
        if chars.next().is_some() {
            return Err(Error::InvalidDescriptor(descriptor.to_string()));
        }

        Ok(ty)
    }

    /// Number of local/stack slots a value of this type occupies
    pub fn slots(&self) -> usize {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.slots() == 2
    }

    /// How a value of this type is loaded and stored as a local.
    pub fn value_kind(&self) -> ValueKind {
        match self {
            FieldType::Long => ValueKind::Long,
            FieldType::Float => ValueKind::Float,
            FieldType::Double => ValueKind::Double,
            FieldType::Object(_) | FieldType::Array(_) => ValueKind::Ref,
            _ => ValueKind::Int,
        }
    }

    /// Primitive types plus `java/lang/String` can be produced by a single
    /// constant push.
    pub fn is_literal(&self) -> bool {
        !matches!(self, FieldType::Array(_))
            && !matches!(self, FieldType::Object(name) if name != "java/lang/String")
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Byte => write!(f, "B"),
            FieldType::Char => write!(f, "C"),
            FieldType::Double => write!(f, "D"),
            FieldType::Float => write!(f, "F"),
            FieldType::Int => write!(f, "I"),
            FieldType::Long => write!(f, "J"),
            FieldType::Short => write!(f, "S"),
            FieldType::Boolean => write!(f, "Z"),
            FieldType::Object(name) => write!(f, "L{};", name),
            FieldType::Array(inner) => write!(f, "[{}", inner),
        }
    }
}

fn parse_field_type(chars: &mut Chars<'_>, whole: &str) -> Result<FieldType, Error> {
    let bad = || Error::InvalidDescriptor(whole.to_string());
    Ok(match chars.next().ok_or_else(bad)? {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        'Z' => FieldType::Boolean,
        '[' => FieldType::Array(Box::new(parse_field_type(chars, whole)?)),
        'L' => {
            let mut name = String::new();
            loop {
                match chars.next().ok_or_else(bad)? {
                    ';' => break,
                    c => name.push(c),
                }
            }
            if name.is_empty() {
                return Err(bad());
            }
            FieldType::Object(name)
        }
        _ => return Err(bad()),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    /// `None` for `void`
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<MethodDescriptor, Error> {
        let bad = || Error::InvalidDescriptor(descriptor.to_string());
        let mut chars = descriptor.chars();
        if chars.next() != Some('(') {
            return Err(bad());
        }

        let mut params = vec![];
        loop {
            let rest = chars.as_str();
            if rest.starts_with(')') {
                chars.next();
                break;
            }
            if rest.is_empty() {
                return Err(bad());
            }
            params.push(parse_field_type(&mut chars, descriptor)?);
        }

        let ret = if chars.as_str() == "V" {
            None
        } else {
            let ty = parse_field_type(&mut chars, descriptor)?;
            if chars.next().is_some() {
                return Err(bad());
            }
            Some(ty)
        };

        Ok(MethodDescriptor { params, ret })
    }

    /// Total argument slots, not counting a receiver.
    pub fn arg_slots(&self) -> usize {
        self.params.iter().map(FieldType::slots).sum()
    }

    /// The descriptor with its first parameter removed. A dynamic call site
    /// that stands in for an instance call carries the receiver as its first
    /// argument.
    pub fn without_receiver(&self) -> Option<MethodDescriptor> {
        match self.params.first() {
            Some(FieldType::Object(_)) | Some(FieldType::Array(_)) => Some(MethodDescriptor {
                params: self.params[1..].to_vec(),
                ret: self.ret.clone(),
            }),
            _ => None,
        }
    }

    pub fn returns_string(&self) -> bool {
        matches!(&self.ret, Some(FieldType::Object(name)) if name == "java/lang/String")
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        write!(f, ")")?;
        match &self.ret {
            Some(ret) => write!(f, "{}", ret),
            None => write!(f, "V"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_parameters() {
        let desc = MethodDescriptor::parse("(Ljava/lang/String;J[IZ)Ljava/lang/String;").unwrap();
        assert_eq!(desc.params.len(), 4);
        assert_eq!(desc.arg_slots(), 5);
        assert!(desc.returns_string());
        assert_eq!(desc.to_string(), "(Ljava/lang/String;J[IZ)Ljava/lang/String;");
    }

    #[test]
    fn drops_receiver() {
        let desc = MethodDescriptor::parse("(Ljava/io/PrintStream;Ljava/lang/String;)V").unwrap();
        assert_eq!(desc.without_receiver().unwrap().to_string(), "(Ljava/lang/String;)V");
        let primitive_first = MethodDescriptor::parse("(I)V").unwrap();
        assert!(primitive_first.without_receiver().is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(MethodDescriptor::parse("(Ljava/lang/String)V").is_err());
        assert!(MethodDescriptor::parse("I").is_err());
        assert!(FieldType::parse("Q").is_err());
        assert!(FieldType::parse("II").is_err());
    }
}
