use bitflags::bitflags;
use log::{debug, warn};
use pretty_hex::pretty_hex;

use crate::bytecode;
use crate::classfile::{parse_bootstrap_methods, AttributeInfo, ClassFile, CodeAttribute, MemberInfo, RawBootstrapMethod};
use crate::code::MethodBody;
use crate::constant_pool::ConstantPool;
use crate::error::Error;

bitflags! {
    #[derive(Default)]
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        /// `ACC_SYNCHRONIZED` on methods, `ACC_SUPER` on classes
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub access: AccessFlags,
    pub name: String,
    pub descriptor: String,
    raw: MemberInfo,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub access: AccessFlags,
    pub name: String,
    pub descriptor: String,
    /// `None` for abstract/native methods, and for bodies that couldn't be
    /// decoded. Those are written back untouched.
    pub body: Option<MethodBody>,
    raw: MemberInfo,
    /// Created in memory; must be encoded even if no pass touched it
    fresh: bool,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn is_modified(&self) -> bool {
        self.fresh || self.body.as_ref().map_or(false, MethodBody::is_modified)
    }
}

/// One class, decoded far enough for the passes to work on it.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub name: String,
    pub super_name: Option<String>,
    pub access: AccessFlags,
    pub interfaces: Vec<String>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    class_file: ClassFile,
    bootstrap: Vec<RawBootstrapMethod>,
    members_changed: bool,
}

impl CompiledUnit {
    pub fn parse(data: &[u8]) -> Result<CompiledUnit, Error> {
        let class_file = ClassFile::parse(data)?;
        let pool = &class_file.pool;
        let name = pool.class_name(class_file.this_class)?;
        let super_name = match class_file.super_class {
            0 => None,
            index => Some(pool.class_name(index)?),
        };
        let interfaces = class_file
            .interfaces
            .iter()
            .map(|i| pool.class_name(*i))
            .collect::<Result<Vec<_>, _>>()?;

        let bootstrap = match class_file.find_attribute(&class_file.attributes, "BootstrapMethods") {
            Some(attr) => parse_bootstrap_methods(&attr.data)?,
            None => vec![],
        };

        let mut fields = Vec::with_capacity(class_file.fields.len());
        for raw in &class_file.fields {
            fields.push(Field {
                access: AccessFlags::from_bits_truncate(raw.access),
                name: pool.utf8_str(raw.name_index)?,
                descriptor: pool.utf8_str(raw.descriptor_index)?,
                raw: raw.clone(),
            });
        }

        let mut methods = Vec::with_capacity(class_file.methods.len());
        for raw in &class_file.methods {
            let method_name = pool.utf8_str(raw.name_index)?;
            let descriptor = pool.utf8_str(raw.descriptor_index)?;
            let body = match class_file.find_attribute(&raw.attributes, "Code") {
                Some(attr) => {
                    let code = CodeAttribute::parse(&attr.data)?;
                    match bytecode::disassemble(&code, pool, &bootstrap) {
                        Ok(body) => Some(body),
                        Err(e) => {
                            warn!("{} | leaving {}{} untouched: {}", name, method_name, descriptor, e);
                            debug!("{}", pretty_hex(&code.code));
                            None
                        }
                    }
                }
                None => None,
            };
            methods.push(Method {
                access: AccessFlags::from_bits_truncate(raw.access),
                name: method_name,
                descriptor,
                body,
                raw: raw.clone(),
                fresh: false,
            });
        }

        Ok(CompiledUnit {
            name,
            super_name,
            access: AccessFlags::from_bits_truncate(class_file.access),
            interfaces,
            fields,
            methods,
            class_file,
            bootstrap,
            members_changed: false,
        })
    }

    /// An empty class, for building units in memory.
    pub fn new(name: &str, super_name: &str) -> Result<CompiledUnit, Error> {
        let mut pool = ConstantPool::new();
        let this_class = pool.class_index(name)?;
        let super_class = pool.class_index(super_name)?;
        Ok(CompiledUnit {
            name: name.to_string(),
            super_name: Some(super_name.to_string()),
            access: AccessFlags::PUBLIC | AccessFlags::SYNCHRONIZED,
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            class_file: ClassFile {
                minor_version: 0,
                major_version: 52,
                pool,
                access: (AccessFlags::PUBLIC | AccessFlags::SYNCHRONIZED).bits(),
                this_class,
                super_class,
                interfaces: vec![],
                fields: vec![],
                methods: vec![],
                attributes: vec![],
            },
            bootstrap: vec![],
            members_changed: true,
        })
    }

    pub fn add_field(&mut self, access: AccessFlags, name: &str, descriptor: &str) -> Result<(), Error> {
        let raw = MemberInfo {
            access: access.bits(),
            name_index: self.class_file.pool.utf8_index(name)?,
            descriptor_index: self.class_file.pool.utf8_index(descriptor)?,
            attributes: vec![],
        };
        self.fields.push(Field {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            raw,
        });
        self.members_changed = true;
        Ok(())
    }

    /// Adds a method, replacing any existing one with the same name and
    /// descriptor.
    pub fn add_method(
        &mut self,
        access: AccessFlags,
        name: &str,
        descriptor: &str,
        body: Option<MethodBody>,
    ) -> Result<(), Error> {
        let raw = MemberInfo {
            access: access.bits(),
            name_index: self.class_file.pool.utf8_index(name)?,
            descriptor_index: self.class_file.pool.utf8_index(descriptor)?,
            attributes: vec![],
        };
        self.methods.retain(|m| !(m.name == name && m.descriptor == descriptor));
        self.methods.push(Method {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            body,
            raw,
            fresh: true,
        });
        self.members_changed = true;
        Ok(())
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    /// Removes every method matching `pred`. Returns how many went.
    pub fn remove_methods<F: FnMut(&Method) -> bool>(&mut self, mut pred: F) -> usize {
        let before = self.methods.len();
        self.methods.retain(|m| !pred(m));
        let removed = before - self.methods.len();
        if removed > 0 {
            self.members_changed = true;
        }
        removed
    }

    pub fn remove_fields<F: FnMut(&Field) -> bool>(&mut self, mut pred: F) -> usize {
        let before = self.fields.len();
        self.fields.retain(|f| !pred(f));
        let removed = before - self.fields.len();
        if removed > 0 {
            self.members_changed = true;
        }
        removed
    }

    pub fn is_modified(&self) -> bool {
        self.members_changed || self.methods.iter().any(Method::is_modified)
    }

    /// Serializes the unit. Methods no pass touched keep their original
    /// `Code` attribute byte for byte; the constant pool is only appended to.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut class_file = self.class_file.clone();
        let code_name = class_file.pool.utf8_index("Code")?;

        class_file.fields = self.fields.iter().map(|f| f.raw.clone()).collect();

        let mut methods = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            let mut raw = method.raw.clone();
            if let Some(body) = method.body.as_ref().filter(|_| method.is_modified()) {
                let mut code = bytecode::assemble(body, &mut class_file.pool)?;
                if let Some(existing) = raw
                    .attributes
                    .iter()
                    .find(|a| a.name_index == code_name)
                    .and_then(|a| CodeAttribute::parse(&a.data).ok())
                {
                    code.max_stack = code.max_stack.max(existing.max_stack);
                    code.max_locals = code.max_locals.max(existing.max_locals);
                }
                let data = code.to_bytes()?;
                raw.attributes.retain(|a| a.name_index != code_name);
                raw.attributes.push(AttributeInfo {
                    name_index: code_name,
                    data,
                });
            }
            methods.push(raw);
        }
        class_file.methods = methods;

        class_file.to_bytes()
    }
}
