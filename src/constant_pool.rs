use std::collections::HashMap;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error;
use crate::mutf8::JavaString;

pub mod tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELDREF: u8 = 9;
    pub const METHODREF: u8 = 10;
    pub const INTERFACE_METHODREF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const DYNAMIC: u8 = 17;
    pub const INVOKE_DYNAMIC: u8 = 18;
    pub const MODULE: u8 = 19;
    pub const PACKAGE: u8 = 20;
}

/// One constant pool entry. Floating values are kept as raw bits so NaN
/// payloads survive and entries stay hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Index 0 and the slot following a long or double
    Unusable,
}

impl Constant {
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// A resolved field or method reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub interface: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    lookup: HashMap<Constant, u16>,
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool {
            entries: vec![Constant::Unusable],
            lookup: HashMap::new(),
        }
    }

    pub fn read<R: Read>(rdr: &mut R) -> Result<ConstantPool, Error> {
        let count = rdr.read_u16::<BigEndian>()?;
        let mut pool = ConstantPool::new();
        let mut index = 1u16;
        while index < count {
            let tag = rdr.read_u8()?;
            let constant = match tag {
                tag::UTF8 => {
                    let len = rdr.read_u16::<BigEndian>()? as usize;
                    let mut data = vec![0u8; len];
                    rdr.read_exact(&mut data)?;
                    Constant::Utf8(data)
                }
                tag::INTEGER => Constant::Integer(rdr.read_i32::<BigEndian>()?),
                tag::FLOAT => Constant::Float(rdr.read_u32::<BigEndian>()?),
                tag::LONG => Constant::Long(rdr.read_i64::<BigEndian>()?),
                tag::DOUBLE => Constant::Double(rdr.read_u64::<BigEndian>()?),
                tag::CLASS => Constant::Class(rdr.read_u16::<BigEndian>()?),
                tag::STRING => Constant::String(rdr.read_u16::<BigEndian>()?),
                tag::FIELDREF | tag::METHODREF | tag::INTERFACE_METHODREF => {
                    let class = rdr.read_u16::<BigEndian>()?;
                    let name_and_type = rdr.read_u16::<BigEndian>()?;
                    match tag {
                        tag::FIELDREF => Constant::Fieldref { class, name_and_type },
                        tag::METHODREF => Constant::Methodref { class, name_and_type },
                        _ => Constant::InterfaceMethodref { class, name_and_type },
                    }
                }
                tag::NAME_AND_TYPE => Constant::NameAndType {
                    name: rdr.read_u16::<BigEndian>()?,
                    descriptor: rdr.read_u16::<BigEndian>()?,
                },
                tag::METHOD_HANDLE => Constant::MethodHandle {
                    kind: rdr.read_u8()?,
                    reference: rdr.read_u16::<BigEndian>()?,
                },
                tag::METHOD_TYPE => Constant::MethodType(rdr.read_u16::<BigEndian>()?),
                tag::DYNAMIC | tag::INVOKE_DYNAMIC => {
                    let bootstrap = rdr.read_u16::<BigEndian>()?;
                    let name_and_type = rdr.read_u16::<BigEndian>()?;
                    if tag == tag::DYNAMIC {
                        Constant::Dynamic { bootstrap, name_and_type }
                    } else {
                        Constant::InvokeDynamic { bootstrap, name_and_type }
                    }
                }
                tag::MODULE => Constant::Module(rdr.read_u16::<BigEndian>()?),
                tag::PACKAGE => Constant::Package(rdr.read_u16::<BigEndian>()?),
                other => return Err(Error::UnknownConstantTag(other)),
            };

            let wide = constant.is_wide();
            pool.lookup.entry(constant.clone()).or_insert(index);
            pool.entries.push(constant);
            index += 1;
            if wide {
                pool.entries.push(Constant::Unusable);
                index += 1;
            }
        }

        Ok(pool)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_u16::<BigEndian>(self.entries.len() as u16)?;
        for constant in self.entries.iter().skip(1) {
            match constant {
                Constant::Utf8(data) => {
                    w.write_u8(tag::UTF8)?;
                    w.write_u16::<BigEndian>(data.len() as u16)?;
                    w.write_all(data)?;
                }
                Constant::Integer(v) => {
                    w.write_u8(tag::INTEGER)?;
                    w.write_i32::<BigEndian>(*v)?;
                }
                Constant::Float(bits) => {
                    w.write_u8(tag::FLOAT)?;
                    w.write_u32::<BigEndian>(*bits)?;
                }
                Constant::Long(v) => {
                    w.write_u8(tag::LONG)?;
                    w.write_i64::<BigEndian>(*v)?;
                }
                Constant::Double(bits) => {
                    w.write_u8(tag::DOUBLE)?;
                    w.write_u64::<BigEndian>(*bits)?;
                }
                Constant::Class(i) => {
                    w.write_u8(tag::CLASS)?;
                    w.write_u16::<BigEndian>(*i)?;
                }
                Constant::String(i) => {
                    w.write_u8(tag::STRING)?;
                    w.write_u16::<BigEndian>(*i)?;
                }
                Constant::Fieldref { class, name_and_type } => {
                    w.write_u8(tag::FIELDREF)?;
                    w.write_u16::<BigEndian>(*class)?;
                    w.write_u16::<BigEndian>(*name_and_type)?;
                }
                Constant::Methodref { class, name_and_type } => {
                    w.write_u8(tag::METHODREF)?;
                    w.write_u16::<BigEndian>(*class)?;
                    w.write_u16::<BigEndian>(*name_and_type)?;
                }
                Constant::InterfaceMethodref { class, name_and_type } => {
                    w.write_u8(tag::INTERFACE_METHODREF)?;
                    w.write_u16::<BigEndian>(*class)?;
                    w.write_u16::<BigEndian>(*name_and_type)?;
                }
                Constant::NameAndType { name, descriptor } => {
                    w.write_u8(tag::NAME_AND_TYPE)?;
                    w.write_u16::<BigEndian>(*name)?;
                    w.write_u16::<BigEndian>(*descriptor)?;
                }
                Constant::MethodHandle { kind, reference } => {
                    w.write_u8(tag::METHOD_HANDLE)?;
                    w.write_u8(*kind)?;
                    w.write_u16::<BigEndian>(*reference)?;
                }
                Constant::MethodType(i) => {
                    w.write_u8(tag::METHOD_TYPE)?;
                    w.write_u16::<BigEndian>(*i)?;
                }
                Constant::Dynamic { bootstrap, name_and_type } => {
                    w.write_u8(tag::DYNAMIC)?;
                    w.write_u16::<BigEndian>(*bootstrap)?;
                    w.write_u16::<BigEndian>(*name_and_type)?;
                }
                Constant::InvokeDynamic { bootstrap, name_and_type } => {
                    w.write_u8(tag::INVOKE_DYNAMIC)?;
                    w.write_u16::<BigEndian>(*bootstrap)?;
                    w.write_u16::<BigEndian>(*name_and_type)?;
                }
                Constant::Module(i) => {
                    w.write_u8(tag::MODULE)?;
                    w.write_u16::<BigEndian>(*i)?;
                }
                Constant::Package(i) => {
                    w.write_u8(tag::PACKAGE)?;
                    w.write_u16::<BigEndian>(*i)?;
                }
                Constant::Unusable => {}
            }
        }

        Ok(())
    }

    /// Number of slots, including the unusable slot 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Result<&Constant, Error> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(Error::InvalidConstantIndex(index)),
            Some(c) => Ok(c),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<JavaString, Error> {
        match self.get(index)? {
            Constant::Utf8(data) => JavaString::from_modified_utf8(data),
            _ => Err(Error::UnexpectedConstant { index, expected: "Utf8" }),
        }
    }

    /// Identifier-flavoured accessor. Names and descriptors are always valid
    /// unicode in practice; anything else is replaced lossily.
    pub fn utf8_str(&self, index: u16) -> Result<String, Error> {
        Ok(self.utf8(index)?.to_string_lossy())
    }

    pub fn class_name(&self, index: u16) -> Result<String, Error> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8_str(*name),
            _ => Err(Error::UnexpectedConstant { index, expected: "Class" }),
        }
    }

    pub fn string(&self, index: u16) -> Result<JavaString, Error> {
        match self.get(index)? {
            Constant::String(value) => self.utf8(*value),
            _ => Err(Error::UnexpectedConstant { index, expected: "String" }),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(String, String), Error> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8_str(*name)?, self.utf8_str(*descriptor)?))
            }
            _ => Err(Error::UnexpectedConstant { index, expected: "NameAndType" }),
        }
    }

    pub fn member_ref(&self, index: u16) -> Result<MemberRef, Error> {
        let (class, nat, interface) = match self.get(index)? {
            Constant::Fieldref { class, name_and_type }
            | Constant::Methodref { class, name_and_type } => (*class, *name_and_type, false),
            Constant::InterfaceMethodref { class, name_and_type } => (*class, *name_and_type, true),
            _ => return Err(Error::UnexpectedConstant { index, expected: "member reference" }),
        };
        let (name, descriptor) = self.name_and_type(nat)?;
        Ok(MemberRef {
            owner: self.class_name(class)?,
            name,
            descriptor,
            interface,
        })
    }

    /// Returns the index of `constant`, appending it if the pool doesn't
    /// already hold an equal entry. Existing indices never move.
    pub fn intern(&mut self, constant: Constant) -> Result<u16, Error> {
        if let Some(index) = self.lookup.get(&constant) {
            return Ok(*index);
        }

        let needed = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + needed > u16::MAX as usize {
            return Err(Error::ConstantPoolOverflow);
        }

        let index = self.entries.len() as u16;
        let wide = constant.is_wide();
        self.lookup.insert(constant.clone(), index);
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }

        Ok(index)
    }

    pub fn utf8_index(&mut self, value: &str) -> Result<u16, Error> {
        self.intern(Constant::Utf8(JavaString::from(value).to_modified_utf8()))
    }

    pub fn class_index(&mut self, name: &str) -> Result<u16, Error> {
        let name = self.utf8_index(name)?;
        self.intern(Constant::Class(name))
    }

    pub fn string_index(&mut self, value: &JavaString) -> Result<u16, Error> {
        let utf8 = self.intern(Constant::Utf8(value.to_modified_utf8()))?;
        self.intern(Constant::String(utf8))
    }

    pub fn integer_index(&mut self, value: i32) -> Result<u16, Error> {
        self.intern(Constant::Integer(value))
    }

    pub fn float_index(&mut self, value: f32) -> Result<u16, Error> {
        self.intern(Constant::Float(value.to_bits()))
    }

    pub fn long_index(&mut self, value: i64) -> Result<u16, Error> {
        self.intern(Constant::Long(value))
    }

    pub fn double_index(&mut self, value: f64) -> Result<u16, Error> {
        self.intern(Constant::Double(value.to_bits()))
    }

    pub fn method_type_index(&mut self, descriptor: &str) -> Result<u16, Error> {
        let descriptor = self.utf8_index(descriptor)?;
        self.intern(Constant::MethodType(descriptor))
    }

    pub fn name_and_type_index(&mut self, name: &str, descriptor: &str) -> Result<u16, Error> {
        let name = self.utf8_index(name)?;
        let descriptor = self.utf8_index(descriptor)?;
        self.intern(Constant::NameAndType { name, descriptor })
    }

    pub fn field_ref_index(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, Error> {
        let class = self.class_index(owner)?;
        let name_and_type = self.name_and_type_index(name, descriptor)?;
        self.intern(Constant::Fieldref { class, name_and_type })
    }

    pub fn method_ref_index(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<u16, Error> {
        let class = self.class_index(owner)?;
        let name_and_type = self.name_and_type_index(name, descriptor)?;
        if interface {
            self.intern(Constant::InterfaceMethodref { class, name_and_type })
        } else {
            self.intern(Constant::Methodref { class, name_and_type })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn wide_entries_take_two_slots() {
        let mut pool = ConstantPool::new();
        let long = pool.long_index(1 << 40).unwrap();
        let name = pool.utf8_index("x").unwrap();
        assert_eq!(long, 1);
        assert_eq!(name, 3);
        assert!(matches!(pool.get(2), Err(Error::InvalidConstantIndex(2))));
    }

    #[test]
    fn interning_reuses_existing_entries() {
        let mut pool = ConstantPool::new();
        let a = pool.method_ref_index("a/B", "c", "()V", false).unwrap();
        let len = pool.len();
        let b = pool.method_ref_index("a/B", "c", "()V", false).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.len(), len);

        let r = pool.member_ref(a).unwrap();
        assert_eq!(r.owner, "a/B");
        assert_eq!(r.name, "c");
        assert_eq!(r.descriptor, "()V");
        assert!(!r.interface);
    }

    #[test]
    fn read_write_preserves_indices() {
        let mut pool = ConstantPool::new();
        pool.double_index(2.5).unwrap();
        let s = pool.string_index(&JavaString::from("hello")).unwrap();
        pool.class_index("java/lang/Object").unwrap();

        let mut out = vec![];
        pool.write(&mut out).unwrap();
        let read = ConstantPool::read(&mut Cursor::new(out)).unwrap();
        assert_eq!(read.len(), pool.len());
        assert_eq!(read.string(s).unwrap().to_string(), "hello");
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let data = [0u8, 2, 99];
        assert!(matches!(
            ConstantPool::read(&mut Cursor::new(&data[..])),
            Err(Error::UnknownConstantTag(99))
        ));
    }
}
