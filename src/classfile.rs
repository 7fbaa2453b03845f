//! Raw class-file structures. Everything here is index-based and mirrors the
//! binary layout; [`crate::unit`] lowers it into the model the passes use.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::constant_pool::ConstantPool;
use crate::error::Error;

pub const MAGIC: u32 = 0xCAFE_BABE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name_index: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub access: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: ConstantPool,
    pub access: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<MemberInfo>,
    pub methods: Vec<MemberInfo>,
    pub attributes: Vec<AttributeInfo>,
}

/// Returns whether `data` starts with the class-file magic.
pub fn has_magic(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == MAGIC.to_be_bytes()
}

fn read_attributes<R: Read>(rdr: &mut R) -> Result<Vec<AttributeInfo>, Error> {
    let count = rdr.read_u16::<BigEndian>()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = rdr.read_u16::<BigEndian>()?;
        let len = rdr.read_u32::<BigEndian>()? as usize;
        let mut data = vec![0u8; len];
        rdr.read_exact(&mut data)?;
        attributes.push(AttributeInfo { name_index, data });
    }

    Ok(attributes)
}

fn write_attributes<W: Write>(w: &mut W, attributes: &[AttributeInfo]) -> Result<(), Error> {
    w.write_u16::<BigEndian>(attributes.len() as u16)?;
    for attr in attributes {
        w.write_u16::<BigEndian>(attr.name_index)?;
        w.write_u32::<BigEndian>(attr.data.len() as u32)?;
        w.write_all(&attr.data)?;
    }

    Ok(())
}

fn read_members<R: Read>(rdr: &mut R) -> Result<Vec<MemberInfo>, Error> {
    let count = rdr.read_u16::<BigEndian>()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        members.push(MemberInfo {
            access: rdr.read_u16::<BigEndian>()?,
            name_index: rdr.read_u16::<BigEndian>()?,
            descriptor_index: rdr.read_u16::<BigEndian>()?,
            attributes: read_attributes(rdr)?,
        });
    }

    Ok(members)
}

fn write_members<W: Write>(w: &mut W, members: &[MemberInfo]) -> Result<(), Error> {
    w.write_u16::<BigEndian>(members.len() as u16)?;
    for member in members {
        w.write_u16::<BigEndian>(member.access)?;
        w.write_u16::<BigEndian>(member.name_index)?;
        w.write_u16::<BigEndian>(member.descriptor_index)?;
        write_attributes(w, &member.attributes)?;
    }

    Ok(())
}

impl ClassFile {
    pub fn parse(data: &[u8]) -> Result<ClassFile, Error> {
        let mut rdr = Cursor::new(data);
        let magic = rdr.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }

        let minor_version = rdr.read_u16::<BigEndian>()?;
        let major_version = rdr.read_u16::<BigEndian>()?;
        let pool = ConstantPool::read(&mut rdr)?;
        let access = rdr.read_u16::<BigEndian>()?;
        let this_class = rdr.read_u16::<BigEndian>()?;
        let super_class = rdr.read_u16::<BigEndian>()?;
        let interface_count = rdr.read_u16::<BigEndian>()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(rdr.read_u16::<BigEndian>()?);
        }

        Ok(ClassFile {
            minor_version,
            major_version,
            pool,
            access,
            this_class,
            super_class,
            interfaces,
            fields: read_members(&mut rdr)?,
            methods: read_members(&mut rdr)?,
            attributes: read_attributes(&mut rdr)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(MAGIC)?;
        out.write_u16::<BigEndian>(self.minor_version)?;
        out.write_u16::<BigEndian>(self.major_version)?;
        self.pool.write(&mut out)?;
        out.write_u16::<BigEndian>(self.access)?;
        out.write_u16::<BigEndian>(self.this_class)?;
        out.write_u16::<BigEndian>(self.super_class)?;
        out.write_u16::<BigEndian>(self.interfaces.len() as u16)?;
        for interface in &self.interfaces {
            out.write_u16::<BigEndian>(*interface)?;
        }
        write_members(&mut out, &self.fields)?;
        write_members(&mut out, &self.methods)?;
        write_attributes(&mut out, &self.attributes)?;

        Ok(out)
    }

    /// Finds the first attribute in `attributes` with the given name.
    pub fn find_attribute<'a>(
        &self,
        attributes: &'a [AttributeInfo],
        name: &str,
    ) -> Option<&'a AttributeInfo> {
        attributes
            .iter()
            .find(|attr| self.pool.utf8_str(attr.name_index).map_or(false, |n| n == name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<RawExceptionEntry>,
    pub attributes: Vec<AttributeInfo>,
}

impl CodeAttribute {
    pub fn parse(data: &[u8]) -> Result<CodeAttribute, Error> {
        let mut rdr = Cursor::new(data);
        let max_stack = rdr.read_u16::<BigEndian>()?;
        let max_locals = rdr.read_u16::<BigEndian>()?;
        let code_len = rdr.read_u32::<BigEndian>()? as usize;
        if code_len > data.len() {
            return Err(Error::Truncated("Code attribute"));
        }
        let mut code = vec![0u8; code_len];
        rdr.read_exact(&mut code)?;

        let entries = rdr.read_u16::<BigEndian>()?;
        let mut exception_table = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            exception_table.push(RawExceptionEntry {
                start_pc: rdr.read_u16::<BigEndian>()?,
                end_pc: rdr.read_u16::<BigEndian>()?,
                handler_pc: rdr.read_u16::<BigEndian>()?,
                catch_type: rdr.read_u16::<BigEndian>()?,
            });
        }

        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes: read_attributes(&mut rdr)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(self.code.len() + 32);
        out.write_u16::<BigEndian>(self.max_stack)?;
        out.write_u16::<BigEndian>(self.max_locals)?;
        out.write_u32::<BigEndian>(self.code.len() as u32)?;
        out.write_all(&self.code)?;
        out.write_u16::<BigEndian>(self.exception_table.len() as u16)?;
        for entry in &self.exception_table {
            out.write_u16::<BigEndian>(entry.start_pc)?;
            out.write_u16::<BigEndian>(entry.end_pc)?;
            out.write_u16::<BigEndian>(entry.handler_pc)?;
            out.write_u16::<BigEndian>(entry.catch_type)?;
        }
        write_attributes(&mut out, &self.attributes)?;

        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line: u16,
}

pub fn parse_line_numbers(data: &[u8]) -> Result<Vec<LineNumberEntry>, Error> {
    let mut rdr = Cursor::new(data);
    let count = rdr.read_u16::<BigEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(LineNumberEntry {
            start_pc: rdr.read_u16::<BigEndian>()?,
            line: rdr.read_u16::<BigEndian>()?,
        });
    }

    Ok(entries)
}

pub fn write_line_numbers(entries: &[LineNumberEntry]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(2 + entries.len() * 4);
    out.write_u16::<BigEndian>(entries.len() as u16)?;
    for entry in entries {
        out.write_u16::<BigEndian>(entry.start_pc)?;
        out.write_u16::<BigEndian>(entry.line)?;
    }

    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

pub fn parse_local_variables(data: &[u8]) -> Result<Vec<RawLocalVariable>, Error> {
    let mut rdr = Cursor::new(data);
    let count = rdr.read_u16::<BigEndian>()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(RawLocalVariable {
            start_pc: rdr.read_u16::<BigEndian>()?,
            length: rdr.read_u16::<BigEndian>()?,
            name_index: rdr.read_u16::<BigEndian>()?,
            descriptor_index: rdr.read_u16::<BigEndian>()?,
            index: rdr.read_u16::<BigEndian>()?,
        });
    }

    Ok(entries)
}

pub fn write_local_variables(entries: &[RawLocalVariable]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(2 + entries.len() * 10);
    out.write_u16::<BigEndian>(entries.len() as u16)?;
    for entry in entries {
        out.write_u16::<BigEndian>(entry.start_pc)?;
        out.write_u16::<BigEndian>(entry.length)?;
        out.write_u16::<BigEndian>(entry.name_index)?;
        out.write_u16::<BigEndian>(entry.descriptor_index)?;
        out.write_u16::<BigEndian>(entry.index)?;
    }

    Ok(out)
}

/// One entry of the `BootstrapMethods` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBootstrapMethod {
    pub method_ref: u16,
    pub arguments: Vec<u16>,
}

pub fn parse_bootstrap_methods(data: &[u8]) -> Result<Vec<RawBootstrapMethod>, Error> {
    let mut rdr = Cursor::new(data);
    let count = rdr.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let method_ref = rdr.read_u16::<BigEndian>()?;
        let argc = rdr.read_u16::<BigEndian>()?;
        let mut arguments = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            arguments.push(rdr.read_u16::<BigEndian>()?);
        }
        methods.push(RawBootstrapMethod { method_ref, arguments });
    }

    Ok(methods)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_magic_is_rejected() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 52];
        assert!(matches!(ClassFile::parse(&data), Err(Error::BadMagic(0xDEADBEEF))));
        assert!(!has_magic(&data));
    }

    #[test]
    fn code_attribute_round_trips() {
        let code = CodeAttribute {
            max_stack: 2,
            max_locals: 1,
            code: vec![0x03, 0xAC],
            exception_table: vec![RawExceptionEntry {
                start_pc: 0,
                end_pc: 1,
                handler_pc: 1,
                catch_type: 0,
            }],
            attributes: vec![],
        };
        let bytes = code.to_bytes().unwrap();
        assert_eq!(CodeAttribute::parse(&bytes).unwrap(), code);
    }

    #[test]
    fn truncated_code_is_an_error() {
        // claims 100 bytes of code but carries 2
        let data = [0, 1, 0, 1, 0, 0, 0, 100, 0x03, 0xAC];
        assert!(CodeAttribute::parse(&data).is_err());
    }
}
