//! String decryption: a fixed registry of recipes tried against the literal
//! operands of calls into a unit's own decryption routines.

use std::collections::{HashMap, HashSet};
use std::fmt;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use log::{debug, trace};
use md2::Md2;
use md5::Md5;
use once_cell::sync::Lazy;
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::bytecode::string_const;
use crate::code::{InsnId, MethodBody};
use crate::descriptor::{FieldType, MethodDescriptor};
use crate::fold::operand_before;
use crate::insn::{ConstValue, FieldOp, Insn, InvokeKind, MathOp, StackOp, TypeOp, ValueKind};
use crate::mutf8::JavaString;
use crate::opcodes;
use crate::pass::{PassContext, UnitPass};
use crate::unit::{CompiledUnit, Method};

const T_CHAR: u8 = 5;
const T_BYTE: u8 = 8;

/// A literal argument recovered from in front of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i32),
    Long(i64),
    Str(JavaString),
    Bytes(Vec<u8>),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Int(v) => write!(f, "{}", v),
            Operand::Long(v) => write!(f, "{}L", v),
            Operand::Str(s) => write!(f, "{:?}", s.units()),
            Operand::Bytes(b) => write!(f, "b{:?}", b),
        }
    }
}

/// A static array initialised in `<clinit>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Table {
    Strings(Vec<Option<JavaString>>),
    Chars(Vec<u16>),
    Bytes(Vec<u8>),
}

/// Everything a recipe may look at.
#[derive(Debug)]
pub struct RecipeInput<'a> {
    pub operands: &'a [Operand],
    /// Internal name of the unit declaring the routine
    pub class_name: &'a str,
    pub routine_name: &'a str,
    /// Tables the routine reads
    pub tables: Vec<&'a Table>,
}

pub struct DecryptionRecipe {
    pub name: &'static str,
    pub decrypt: fn(&RecipeInput<'_>) -> Option<String>,
}

/// Recipes in the order they're tried.
pub static RECIPES: Lazy<Vec<DecryptionRecipe>> = Lazy::new(|| {
    vec![
        DecryptionRecipe {
            name: "xor-key",
            decrypt: xor_key,
        },
        DecryptionRecipe {
            name: "xor-key-string",
            decrypt: xor_key_string,
        },
        DecryptionRecipe {
            name: "aes-ecb",
            decrypt: aes_ecb,
        },
        DecryptionRecipe {
            name: "base64-xor",
            decrypt: base64_xor,
        },
        DecryptionRecipe {
            name: "xor-common-keys",
            decrypt: xor_common_keys,
        },
        DecryptionRecipe {
            name: "char-shift",
            decrypt: char_shift,
        },
        DecryptionRecipe {
            name: "static-table",
            decrypt: static_table,
        },
        DecryptionRecipe {
            name: "char-buffer",
            decrypt: char_buffer,
        },
    ]
});

/// Whether a candidate plaintext looks like text: non-empty and at least
/// 70% printable ASCII, counted in UTF-16 units.
pub fn is_plausible(candidate: &str) -> bool {
    let mut len = 0usize;
    let mut printable = 0usize;
    for unit in candidate.encode_utf16() {
        len += 1;
        if (32..=126).contains(&unit) {
            printable += 1;
        }
    }
    len > 0 && printable * 10 >= len * 7
}

/// Tries every recipe in order; the first plausible plaintext wins.
pub fn decrypt(input: &RecipeInput<'_>) -> Option<(&'static str, String)> {
    RECIPES.iter().find_map(|recipe| {
        (recipe.decrypt)(input)
            .filter(|plain| is_plausible(plain))
            .map(|plain| (recipe.name, plain))
    })
}

fn from_units(units: &[u16]) -> Option<String> {
    String::from_utf16(units).ok()
}

fn xor_units(s: &JavaString, key: i32) -> Option<String> {
    let units: Vec<u16> = s.units().iter().map(|u| (*u as i32 ^ key) as u16).collect();
    from_units(&units)
}

fn xor_key(input: &RecipeInput<'_>) -> Option<String> {
    match input.operands {
        [Operand::Str(s), Operand::Int(k)] => xor_units(s, *k),
        _ => None,
    }
}

/// Java's `UTF_16` charset: honours a byte order mark, big-endian otherwise.
fn decode_utf16(bytes: &[u8]) -> Option<String> {
    let (body, little_endian) = match bytes {
        [0xfe, 0xff, rest @ ..] => (rest, false),
        [0xff, 0xfe, rest @ ..] => (rest, true),
        _ => (bytes, false),
    };
    let mut units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    if body.len() % 2 == 1 {
        units.push(0xfffd);
    }
    Some(String::from_utf16_lossy(&units))
}

fn xor_key_string(input: &RecipeInput<'_>) -> Option<String> {
    match input.operands {
        [Operand::Bytes(data), Operand::Int(k)] => {
            let key = k.to_string().into_bytes();
            let plain: Vec<u8> = data
                .iter()
                .zip(key.iter().cycle())
                .map(|(b, k)| b ^ k)
                .collect();
            decode_utf16(&plain)
        }
        _ => None,
    }
}

fn digest(algorithm: &str, input: &[u8]) -> Vec<u8> {
    match algorithm {
        "MD5" => Md5::digest(input).to_vec(),
        "SHA-1" => Sha1::digest(input).to_vec(),
        "MD2" => Md2::digest(input).to_vec(),
        _ => Sha256::digest(input).to_vec(),
    }
}

/// AES in ECB mode with PKCS#5 padding removed.
fn aes_ecb_decrypt(key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() || data.len() % 16 != 0 {
        return None;
    }
    let mut out = data.to_vec();

    macro_rules! decrypt_with {
        ($cipher:ty) => {{
            let cipher = <$cipher>::new_from_slice(key).ok()?;
            for block in out.chunks_exact_mut(16) {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }};
    }

    match key.len() {
        16 => decrypt_with!(Aes128),
        24 => decrypt_with!(Aes192),
        32 => decrypt_with!(Aes256),
        _ => return None,
    }

    let pad = *out.last()? as usize;
    if pad == 0 || pad > 16 || out[out.len() - pad..].iter().any(|b| *b as usize != pad) {
        return None;
    }
    out.truncate(out.len() - pad);
    Some(out)
}

fn aes_ecb(input: &RecipeInput<'_>) -> Option<String> {
    let encoded = match input.operands.first() {
        Some(Operand::Str(s)) => s.to_string_lossy(),
        _ => return None,
    };
    let data = base64::decode(encoded.trim()).ok()?;
    let seed = format!("{}.{}", input.class_name.replace('/', "."), input.routine_name);

    for algorithm in ["MD5", "SHA-1", "MD2", "SHA-256"].iter() {
        let hash = digest(algorithm, seed.as_bytes());
        for key_len in [16usize, 24, 32].iter() {
            let mut key = hash.clone();
            key.resize(*key_len, 0);
            let plain = match aes_ecb_decrypt(&key, &data) {
                Some(plain) => plain,
                None => continue,
            };
            if let Ok(text) = String::from_utf8(plain) {
                if is_plausible(&text) {
                    trace!("aes key from {} truncated to {}", algorithm, key_len);
                    return Some(text);
                }
            }
        }
    }
    None
}

fn base64_xor(input: &RecipeInput<'_>) -> Option<String> {
    match input.operands {
        [Operand::Str(s), Operand::Int(k)] => {
            let data = base64::decode(s.to_string_lossy().trim()).ok()?;
            let key = *k as u8;
            String::from_utf8(data.into_iter().map(|b| b ^ key).collect()).ok()
        }
        _ => None,
    }
}

const COMMON_KEYS: [i32; 7] = [0xDEAD, 0xBEEF, 0xCAFE, 0xBABE, 0x1337, 42, 13];

fn xor_common_keys(input: &RecipeInput<'_>) -> Option<String> {
    match input.operands {
        [Operand::Str(s)] => COMMON_KEYS
            .iter()
            .filter_map(|key| xor_units(s, *key))
            .find(|plain| is_plausible(plain)),
        _ => None,
    }
}

fn char_shift(input: &RecipeInput<'_>) -> Option<String> {
    match input.operands {
        [Operand::Str(s), Operand::Int(k)] => {
            let units: Vec<u16> = s.units().iter().map(|u| u.wrapping_sub(*k as u16)).collect();
            from_units(&units)
        }
        _ => None,
    }
}

fn static_table(input: &RecipeInput<'_>) -> Option<String> {
    let index = |i: i32| usize::try_from(i).ok();
    input.tables.iter().find_map(|table| match (table, input.operands) {
        (Table::Strings(entries), [Operand::Int(i)]) => entries.get(index(*i)?)?.as_ref()?.to_string_lossy().into(),
        (Table::Strings(entries), [Operand::Int(i), Operand::Int(k)]) => {
            xor_units(entries.get(index(*i)?)?.as_ref()?, *k)
        }
        (Table::Chars(chars), [Operand::Int(off), Operand::Int(len)]) => {
            let start = index(*off)?;
            let end = start.checked_add(index(*len)?)?;
            from_units(chars.get(start..end)?)
        }
        _ => None,
    })
}

fn char_buffer(input: &RecipeInput<'_>) -> Option<String> {
    match input.operands {
        [Operand::Bytes(data)] => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            from_units(&units)
        }
        _ => None,
    }
}

/// Decryption results for one unit, failures included, keyed by (routine
/// owner, routine name and descriptor, operand fingerprint).
#[derive(Debug, Default)]
pub struct DecryptionCache {
    entries: HashMap<(String, String, String), Option<(&'static str, String)>>,
    hits: usize,
}

impl DecryptionCache {
    pub fn get_or_insert_with<F>(&mut self, key: (String, String, String), f: F) -> Option<(&'static str, String)>
    where
        F: FnOnce() -> Option<(&'static str, String)>,
    {
        if let Some(cached) = self.entries.get(&key) {
            self.hits += 1;
            return cached.clone();
        }
        let result = f();
        self.entries.insert(key, result.clone());
        result
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One recovered string, as written to the strings CSV.
#[derive(Serialize, Debug, Clone)]
pub struct DecryptedString {
    pub unit: String,
    pub method: String,
    pub routine: String,
    pub recipe: &'static str,
    /// stfu8-escaped so control characters survive the CSV
    pub value: String,
}

impl DecryptedString {
    pub fn new(unit: &str, method: &str, routine: &str, recipe: &'static str, value: &str) -> DecryptedString {
        DecryptedString {
            unit: unit.to_string(),
            method: method.to_string(),
            routine: routine.to_string(),
            recipe,
            value: stfu8::encode_u8(value.as_bytes()),
        }
    }
}

/// Reads `push len; newarray/anewarray` followed by `dup; push i; push v;
/// <store>` groups. Returns the elements and the last node consumed.
fn array_fill(body: &MethodBody, alloc: InsnId, store_op: u8) -> Option<(Vec<Option<ConstValue>>, InsnId)> {
    let len_id = body.insns.prev_real(alloc)?;
    let len = match body.insns.get(len_id)? {
        Insn::Const(ConstValue::Int(len)) if *len >= 0 && *len <= 0xffff => *len as usize,
        _ => return None,
    };
    let mut values = vec![None; len];
    let mut last = alloc;

    loop {
        let dup = match body.insns.next_real(last) {
            Some(dup) if body.insns.get(dup) == Some(&Insn::Stack(StackOp::Dup)) => dup,
            _ => break,
        };
        let index_id = body.insns.next_real(dup)?;
        let value_id = body.insns.next_real(index_id)?;
        let store_id = body.insns.next_real(value_id)?;
        let index = match body.insns.get(index_id)? {
            Insn::Const(ConstValue::Int(i)) => usize::try_from(*i).ok()?,
            _ => return None,
        };
        let value = body.insns.get(value_id)?.as_const()?.clone();
        if body.insns.get(store_id)? != &Insn::Simple(store_op) {
            return None;
        }
        *values.get_mut(index)? = Some(value);
        last = store_id;
    }
    Some((values, last))
}

fn as_bytes(values: Vec<Option<ConstValue>>) -> Vec<u8> {
    values
        .into_iter()
        .map(|v| match v {
            Some(ConstValue::Int(b)) => b as u8,
            _ => 0,
        })
        .collect()
}

/// The array a `()[B` provider returns, if its body is a literal fill.
fn provider_bytes(method: &Method) -> Option<Vec<u8>> {
    if method.descriptor != "()[B" || !method.is_static() {
        return None;
    }
    let body = method.body.as_ref()?;
    let alloc = body
        .insns
        .iter()
        .find(|(_, insn)| **insn == Insn::NewArray(T_BYTE))
        .map(|(id, _)| id)?;
    let (values, last) = array_fill(body, alloc, opcodes::BASTORE)?;
    match body.insns.next_real(last).and_then(|id| body.insns.get(id)) {
        Some(Insn::Return(Some(ValueKind::Ref))) => Some(as_bytes(values)),
        _ => None,
    }
}

/// Static arrays `<clinit>` fills with literals, by field name.
fn clinit_tables(unit: &CompiledUnit) -> HashMap<String, Table> {
    let mut tables = HashMap::new();
    let body = match unit.find_method("<clinit>", "()V").and_then(|m| m.body.as_ref()) {
        Some(body) => body,
        None => return tables,
    };

    for (id, insn) in body.insns.iter() {
        let parsed = match insn {
            Insn::NewArray(T_BYTE) => array_fill(body, id, opcodes::BASTORE).map(|(v, last)| (Table::Bytes(as_bytes(v)), last)),
            Insn::NewArray(T_CHAR) => array_fill(body, id, opcodes::CASTORE).map(|(v, last)| {
                let chars = v
                    .into_iter()
                    .map(|c| match c {
                        Some(ConstValue::Int(c)) => c as u16,
                        _ => 0,
                    })
                    .collect();
                (Table::Chars(chars), last)
            }),
            Insn::Type {
                op: TypeOp::ANewArray,
                class,
            } if class == "java/lang/String" => array_fill(body, id, opcodes::AASTORE).map(|(v, last)| {
                let strings = v
                    .into_iter()
                    .map(|s| match s {
                        Some(ConstValue::Str(s)) => Some(s),
                        _ => None,
                    })
                    .collect();
                (Table::Strings(strings), last)
            }),
            // "...".toCharArray()
            Insn::Invoke {
                owner, name, descriptor, ..
            } if owner == "java/lang/String" && name == "toCharArray" && descriptor == "()[C" => {
                match body.insns.prev_real(id).and_then(|p| body.insns.get(p)) {
                    Some(Insn::Const(ConstValue::Str(s))) => Some((Table::Chars(s.units().to_vec()), id)),
                    _ => None,
                }
            }
            _ => None,
        };

        if let Some((table, last)) = parsed {
            if let Some(Insn::Field {
                op: FieldOp::PutStatic,
                owner,
                name,
                ..
            }) = body.insns.next_real(last).and_then(|n| body.insns.get(n))
            {
                if *owner == unit.name {
                    tables.insert(name.clone(), table);
                }
            }
        }
    }
    tables
}

fn param_accepts(param: &FieldType, operand: &Operand) -> bool {
    match (param, operand) {
        (FieldType::Int, Operand::Int(_))
        | (FieldType::Short, Operand::Int(_))
        | (FieldType::Char, Operand::Int(_))
        | (FieldType::Byte, Operand::Int(_))
        | (FieldType::Long, Operand::Long(_)) => true,
        (FieldType::Object(name), Operand::Str(_)) => name == "java/lang/String",
        (FieldType::Array(inner), Operand::Bytes(_)) => **inner == FieldType::Byte,
        _ => false,
    }
}

/// A routine the unit calls to turn literals into strings.
struct Routine {
    params: Vec<FieldType>,
    /// Tables the routine reads
    tables: Vec<String>,
}

/// Whether some jump goes backwards.
fn has_loop(body: &MethodBody) -> bool {
    let index = body.flow_index();
    index.jump_sources.iter().any(|(label, sources)| {
        let target = match index.label_positions.get(label) {
            Some(pos) => *pos,
            None => return false,
        };
        sources
            .iter()
            .any(|id| index.positions.get(id).map_or(false, |pos| *pos > target))
    })
}

/// Static, returns `String`, takes one to three literal-shaped parameters
/// and does something cipher-like in its body: calls a crypto or encoding
/// API, reads a key table, or does xor/sub arithmetic while walking the
/// input char by char.
fn as_routine(unit: &CompiledUnit, method: &Method, tables: &HashMap<String, Table>) -> Option<Routine> {
    if !method.is_static() || method.name.starts_with('<') {
        return None;
    }
    let descriptor = MethodDescriptor::parse(&method.descriptor).ok()?;
    if !descriptor.returns_string() || descriptor.params.is_empty() || descriptor.params.len() > 3 {
        return None;
    }
    let literal_shaped = descriptor.params.iter().all(|p| match p {
        FieldType::Array(inner) => **inner == FieldType::Byte,
        other => other.is_literal() && *other != FieldType::Float && *other != FieldType::Double,
    });
    if !literal_shaped {
        return None;
    }

    let body = method.body.as_ref()?;
    let mut crypto_api = false;
    let mut arithmetic = false;
    let mut per_char = false;
    let mut used_tables = vec![];
    for (_, insn) in body.insns.iter() {
        match insn {
            Insn::Math { op: MathOp::Xor, .. } | Insn::Math { op: MathOp::Sub, .. } => arithmetic = true,
            Insn::Simple(opcodes::CALOAD)
            | Insn::Simple(opcodes::CASTORE)
            | Insn::Simple(opcodes::BALOAD)
            | Insn::Simple(opcodes::BASTORE) => per_char = true,
            Insn::Invoke { owner, name, .. }
                if owner == "java/lang/String" && (name == "toCharArray" || name == "charAt" || name == "getBytes") =>
            {
                per_char = true
            }
            Insn::Invoke { owner, .. }
                if owner == "javax/crypto/Cipher"
                    || owner == "java/util/Base64"
                    || owner == "java/nio/ByteBuffer"
                    || owner == "java/security/MessageDigest" =>
            {
                crypto_api = true
            }
            Insn::Field {
                op: FieldOp::GetStatic,
                owner,
                name,
                ..
            } if *owner == unit.name && tables.contains_key(name) => {
                used_tables.push(name.clone());
            }
            _ => {}
        }
    }

    let cipher_like = crypto_api || !used_tables.is_empty() || (arithmetic && (per_char || has_loop(body)));
    if cipher_like {
        Some(Routine {
            params: descriptor.params,
            tables: used_tables,
        })
    } else {
        None
    }
}

/// Replaces calls to a unit's string decryption routines with the literal
/// they would return.
pub struct StringDecryptor;

impl StringDecryptor {
    fn operand(
        insn: &Insn,
        unit_name: &str,
        providers: &HashMap<String, Vec<u8>>,
        tables: &HashMap<String, Table>,
    ) -> Option<Operand> {
        Some(match insn {
            Insn::Const(ConstValue::Int(v)) => Operand::Int(*v),
            Insn::Const(ConstValue::Long(v)) => Operand::Long(*v),
            Insn::Const(ConstValue::Str(s)) => Operand::Str(s.clone()),
            Insn::Invoke {
                kind: InvokeKind::Static,
                owner,
                name,
                descriptor,
                ..
            } if owner == unit_name && descriptor == "()[B" => Operand::Bytes(providers.get(name)?.clone()),
            Insn::Field {
                op: FieldOp::GetStatic,
                owner,
                name,
                descriptor,
            } if owner == unit_name && descriptor == "[B" => match tables.get(name)? {
                Table::Bytes(bytes) => Operand::Bytes(bytes.clone()),
                _ => return None,
            },
            _ => return None,
        })
    }
}

fn is_generated_provider_name(name: &str) -> bool {
    name.len() >= 10 && name.bytes().all(|b| b.is_ascii_lowercase())
}

impl UnitPass for StringDecryptor {
    fn name(&self) -> &'static str {
        "string-decryption"
    }

    fn run(&self, unit: &mut CompiledUnit, ctx: &mut PassContext) -> usize {
        let tables = clinit_tables(unit);
        let providers: HashMap<String, Vec<u8>> = unit
            .methods
            .iter()
            .filter_map(|m| provider_bytes(m).map(|bytes| (m.name.clone(), bytes)))
            .collect();
        let routines: HashMap<(String, String), Routine> = unit
            .methods
            .iter()
            .filter_map(|m| as_routine(unit, m, &tables).map(|r| ((m.name.clone(), m.descriptor.clone()), r)))
            .collect();
        if routines.is_empty() {
            return 0;
        }

        let unit_name = unit.name.clone();
        let mut changes = 0;
        let mut used_routines = HashSet::new();

        for method in unit.methods.iter_mut() {
            if routines.contains_key(&(method.name.clone(), method.descriptor.clone())) {
                continue;
            }
            let body = match method.body.as_mut() {
                Some(body) => body,
                None => continue,
            };
            let referenced = body.referenced_labels();

            for id in body.insns.ids() {
                let (name, descriptor) = match body.insns.get(id) {
                    Some(Insn::Invoke {
                        kind: InvokeKind::Static,
                        owner,
                        name,
                        descriptor,
                        ..
                    }) if *owner == unit_name => (name.clone(), descriptor.clone()),
                    _ => continue,
                };
                let key = (name, descriptor);
                let routine = match routines.get(&key) {
                    Some(routine) => routine,
                    None => continue,
                };

                // one instruction per parameter, whatever its width
                let mut operand_ids = Vec::with_capacity(routine.params.len());
                let mut at = id;
                for _ in 0..routine.params.len() {
                    match operand_before(body, at, &referenced) {
                        Some(prev) => {
                            operand_ids.push(prev);
                            at = prev;
                        }
                        None => break,
                    }
                }
                if operand_ids.len() != routine.params.len() {
                    continue;
                }
                operand_ids.reverse();

                let operands: Option<Vec<Operand>> = operand_ids
                    .iter()
                    .zip(routine.params.iter())
                    .map(|(op_id, param)| {
                        body.insns
                            .get(*op_id)
                            .and_then(|insn| StringDecryptor::operand(insn, &unit_name, &providers, &tables))
                            .filter(|operand| param_accepts(param, operand))
                    })
                    .collect();
                let operands = match operands {
                    Some(operands) => operands,
                    None => continue,
                };

                let fingerprint = operands.iter().map(Operand::to_string).collect::<Vec<_>>().join("|");
                let cache_key = (unit_name.clone(), format!("{}{}", key.0, key.1), fingerprint);
                let result = ctx.cache.get_or_insert_with(cache_key, || {
                    decrypt(&RecipeInput {
                        operands: &operands,
                        class_name: &unit_name,
                        routine_name: &key.0,
                        tables: routine.tables.iter().filter_map(|t| tables.get(t)).collect(),
                    })
                });

                let (recipe, plain) = match result {
                    Some(found) => found,
                    None => {
                        debug!(
                            "{} | unresolved call to {}{} in {}{}",
                            unit_name, key.0, key.1, method.name, method.descriptor
                        );
                        continue;
                    }
                };

                trace!("{} | {} via {}: {:?}", unit_name, key.0, recipe, plain);
                for op_id in operand_ids {
                    body.insns.remove(op_id);
                }
                body.insns.replace(id, string_const(&plain));
                ctx.decrypted
                    .push(DecryptedString::new(&unit_name, &method.name, &key.0, recipe, &plain));
                used_routines.insert(key);
                changes += 1;
            }
        }

        if changes == 0 {
            return 0;
        }

        // Routines and generated providers go once nothing calls them
        let called: HashSet<(String, String)> = unit
            .methods
            .iter()
            .filter(|m| !used_routines.contains(&(m.name.clone(), m.descriptor.clone())))
            .filter_map(|m| m.body.as_ref())
            .flat_map(|body| body.insns.iter())
            .filter_map(|(_, insn)| match insn {
                Insn::Invoke {
                    owner, name, descriptor, ..
                } if *owner == unit_name => Some((name.clone(), descriptor.clone())),
                _ => None,
            })
            .collect();
        let removed = unit.remove_methods(|m| {
            let key = (m.name.clone(), m.descriptor.clone());
            if called.contains(&key) {
                return false;
            }
            used_routines.contains(&key) || (providers.contains_key(&m.name) && is_generated_provider_name(&m.name))
        });
        if removed > 0 {
            debug!("{} | removed {} decryption helpers", unit_name, removed);
        }

        changes + removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::tests::insns_of;
    use crate::unit::AccessFlags;
    use aes::cipher::BlockEncrypt;

    fn input<'a>(operands: &'a [Operand]) -> RecipeInput<'a> {
        RecipeInput {
            operands,
            class_name: "t/Host",
            routine_name: "decrypt",
            tables: vec![],
        }
    }

    fn xored(s: &str, key: i32) -> JavaString {
        JavaString::from_units(s.encode_utf16().map(|u| (u as i32 ^ key) as u16).collect())
    }

    #[test]
    fn plausibility_threshold() {
        assert!(!is_plausible(""));
        assert!(is_plausible("hello"));
        // 7 of 10 printable
        assert!(is_plausible("abcdefg\u{1}\u{2}\u{3}"));
        assert!(!is_plausible("abcdef\u{1}\u{2}\u{3}\u{4}"));
    }

    #[test]
    fn xor_with_key() {
        let operands = [Operand::Str(xored("Hello, world", 0x5a5a)), Operand::Int(0x5a5a)];
        assert_eq!(
            decrypt(&input(&operands)),
            Some(("xor-key", "Hello, world".to_string()))
        );
    }

    #[test]
    fn xor_with_key_string_over_bytes() {
        let key = b"1234";
        let plain: Vec<u8> = "secret".encode_utf16().flat_map(|u| u.to_be_bytes().to_vec()).collect();
        let data: Vec<u8> = plain.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k).collect();
        let operands = [Operand::Bytes(data), Operand::Int(1234)];
        assert_eq!(
            decrypt(&input(&operands)),
            Some(("xor-key-string", "secret".to_string()))
        );
    }

    #[test]
    fn aes_with_derived_key() {
        let key = Md5::digest(b"t.Host.decrypt");
        let cipher = Aes128::new_from_slice(&key).unwrap();
        let mut data = b"jdbc:mysql://db".to_vec();
        let pad = 16 - data.len() % 16;
        data.extend(std::iter::repeat(pad as u8).take(pad));
        for block in data.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }

        let operands = [Operand::Str(base64::encode(&data).into())];
        assert_eq!(
            decrypt(&input(&operands)),
            Some(("aes-ecb", "jdbc:mysql://db".to_string()))
        );
    }

    #[test]
    fn base64_then_xor() {
        let key = 0x1a5;
        let data: Vec<u8> = b"token=abc".iter().map(|b| b ^ 0xa5).collect();
        let operands = [Operand::Str(base64::encode(&data).into()), Operand::Int(key)];
        assert_eq!(
            decrypt(&input(&operands)),
            Some(("base64-xor", "token=abc".to_string()))
        );
    }

    #[test]
    fn common_keys_and_tables() {
        let operands = [Operand::Str(xored("password", 0xCAFE))];
        assert_eq!(
            decrypt(&input(&operands)),
            Some(("xor-common-keys", "password".to_string()))
        );

        let table = Table::Chars("xxhello worldyy".encode_utf16().collect());
        let operands = [Operand::Int(2), Operand::Int(11)];
        let with_table = RecipeInput {
            tables: vec![&table],
            ..input(&operands)
        };
        assert_eq!(decrypt(&with_table), Some(("static-table", "hello world".to_string())));
    }

    #[test]
    fn char_buffer_reinterprets_bytes() {
        let data: Vec<u8> = "plugin.yml".encode_utf16().flat_map(|u| u.to_be_bytes().to_vec()).collect();
        let operands = [Operand::Bytes(data)];
        assert_eq!(
            decrypt(&input(&operands)),
            Some(("char-buffer", "plugin.yml".to_string()))
        );
    }

    #[test]
    fn nothing_plausible_is_none() {
        let operands = [Operand::Str(JavaString::from_units(vec![0x100, 0x101, 0x102])), Operand::Long(1)];
        assert_eq!(decrypt(&input(&operands)), None);
    }

    #[test]
    fn cache_returns_the_same_answer() {
        let mut cache = DecryptionCache::default();
        let key = ("a".to_string(), "b()V".to_string(), "1".to_string());
        let first = cache.get_or_insert_with(key.clone(), || Some(("xor-key", "x".to_string())));
        let second = cache.get_or_insert_with(key, || panic!("recomputed"));
        assert_eq!(first, second);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    fn routine_body() -> MethodBody {
        // return s.toCharArray()[0] ^ k, approximately
        let mut body = MethodBody::new(3, 2);
        body.insns.push(Insn::Load { kind: ValueKind::Ref, slot: 0 });
        body.insns.push(Insn::Invoke {
            kind: InvokeKind::Virtual,
            owner: "java/lang/String".to_string(),
            name: "toCharArray".to_string(),
            descriptor: "()[C".to_string(),
            interface: false,
        });
        body.insns.push(Insn::Const(ConstValue::Int(0)));
        body.insns.push(Insn::Simple(opcodes::CALOAD));
        body.insns.push(Insn::Load { kind: ValueKind::Int, slot: 1 });
        body.insns.push(Insn::Math {
            kind: crate::insn::NumKind::Int,
            op: MathOp::Xor,
        });
        body.insns.push(Insn::Stack(StackOp::Pop));
        body.insns.push(Insn::Load { kind: ValueKind::Ref, slot: 0 });
        body.insns.push(Insn::Return(Some(ValueKind::Ref)));
        body
    }

    #[test]
    fn lone_arithmetic_is_not_a_routine() {
        // return s.substring(a - b)
        let mut body = MethodBody::new(3, 3);
        body.insns.push(Insn::Load { kind: ValueKind::Ref, slot: 0 });
        body.insns.push(Insn::Load { kind: ValueKind::Int, slot: 1 });
        body.insns.push(Insn::Load { kind: ValueKind::Int, slot: 2 });
        body.insns.push(Insn::Math {
            kind: crate::insn::NumKind::Int,
            op: MathOp::Sub,
        });
        body.insns.push(Insn::Invoke {
            kind: InvokeKind::Virtual,
            owner: "java/lang/String".to_string(),
            name: "substring".to_string(),
            descriptor: "(I)Ljava/lang/String;".to_string(),
            interface: false,
        });
        body.insns.push(Insn::Return(Some(ValueKind::Ref)));

        let mut looping = body.clone();
        let top = looping.insns.new_label();
        let first = looping.insns.first().unwrap();
        looping.insns.insert_before(first, Insn::Label(top));
        let ret = looping.insns.ids().into_iter().last().unwrap();
        looping.insns.insert_before(ret, Insn::Jump(top));

        let mut unit = CompiledUnit::new("t/Host", "java/lang/Object").unwrap();
        let descriptor = "(Ljava/lang/String;II)Ljava/lang/String;";
        unit.add_method(AccessFlags::STATIC, "cut", descriptor, Some(body)).unwrap();
        unit.add_method(AccessFlags::STATIC, "spin", descriptor, Some(looping)).unwrap();

        let tables = HashMap::new();
        assert!(as_routine(&unit, unit.find_method("cut", descriptor).unwrap(), &tables).is_none());
        assert!(as_routine(&unit, unit.find_method("spin", descriptor).unwrap(), &tables).is_some());
    }

    fn call(descriptor: &str) -> Insn {
        Insn::Invoke {
            kind: InvokeKind::Static,
            owner: "t/Host".to_string(),
            name: "decrypt".to_string(),
            descriptor: descriptor.to_string(),
            interface: false,
        }
    }

    #[test]
    fn call_sites_are_replaced_and_the_routine_removed() {
        let mut unit = CompiledUnit::new("t/Host", "java/lang/Object").unwrap();
        unit.add_method(
            AccessFlags::PRIVATE | AccessFlags::STATIC,
            "decrypt",
            "(Ljava/lang/String;I)Ljava/lang/String;",
            Some(routine_body()),
        )
        .unwrap();

        let mut main = MethodBody::new(2, 1);
        for _ in 0..2 {
            main.insns.push(Insn::Const(ConstValue::Str(xored("Hello", 7))));
            main.insns.push(Insn::LineNumber(4));
            main.insns.push(Insn::Const(ConstValue::Int(7)));
            main.insns.push(call("(Ljava/lang/String;I)Ljava/lang/String;"));
            main.insns.push(Insn::Stack(StackOp::Pop));
        }
        main.insns.push(Insn::Return(None));
        unit.add_method(AccessFlags::STATIC, "main", "()V", Some(main)).unwrap();

        let mut ctx = PassContext::default();
        assert_eq!(StringDecryptor.run(&mut unit, &mut ctx), 3);
        assert_eq!(ctx.decrypted.len(), 2);
        assert_eq!(ctx.decrypted[0].value, "Hello");
        assert_eq!(ctx.decrypted[0].recipe, "xor-key");
        assert_eq!(ctx.cache.hits(), 1);
        assert!(unit.find_method("decrypt", "(Ljava/lang/String;I)Ljava/lang/String;").is_none());

        let insns = insns_of(unit.find_method("main", "()V").unwrap().body.as_ref().unwrap());
        assert_eq!(insns[0], Insn::LineNumber(4));
        assert_eq!(insns[1], string_const("Hello"));
        assert_eq!(insns.iter().filter(|i| matches!(i, Insn::Invoke { .. })).count(), 0);
    }

    #[test]
    fn wide_operands_take_one_instruction() {
        let mut unit = CompiledUnit::new("t/Host", "java/lang/Object").unwrap();
        unit.add_method(
            AccessFlags::STATIC,
            "decrypt",
            "(JLjava/lang/String;I)Ljava/lang/String;",
            Some(routine_body()),
        )
        .unwrap();

        let mut main = MethodBody::new(4, 0);
        main.insns.push(Insn::Const(ConstValue::Long(99)));
        main.insns.push(Insn::Const(ConstValue::Str(xored("Hi there", 3))));
        main.insns.push(Insn::Const(ConstValue::Int(3)));
        main.insns.push(call("(JLjava/lang/String;I)Ljava/lang/String;"));
        main.insns.push(Insn::Return(Some(ValueKind::Ref)));
        unit.add_method(AccessFlags::STATIC, "main", "()Ljava/lang/String;", Some(main)).unwrap();

        // three operand instructions, four stack slots: none of the recipes
        // takes a long first, so the site is recovered but left unresolved
        let mut ctx = PassContext::default();
        assert_eq!(StringDecryptor.run(&mut unit, &mut ctx), 0);
        assert_eq!(ctx.cache.len(), 1);
        assert_eq!(
            insns_of(unit.find_method("main", "()Ljava/lang/String;").unwrap().body.as_ref().unwrap()).len(),
            5
        );
    }

    #[test]
    fn provider_arrays_are_read() {
        let mut provider = MethodBody::new(4, 0);
        provider.insns.push(Insn::Const(ConstValue::Int(2)));
        provider.insns.push(Insn::NewArray(T_BYTE));
        for (i, b) in [0x00, 0x41].iter().enumerate() {
            provider.insns.push(Insn::Stack(StackOp::Dup));
            provider.insns.push(Insn::Const(ConstValue::Int(i as i32)));
            provider.insns.push(Insn::Const(ConstValue::Int(*b)));
            provider.insns.push(Insn::Simple(opcodes::BASTORE));
        }
        provider.insns.push(Insn::Return(Some(ValueKind::Ref)));

        let mut unit = CompiledUnit::new("t/Host", "java/lang/Object").unwrap();
        unit.add_method(AccessFlags::PRIVATE | AccessFlags::STATIC, "qwertyuiopas", "()[B", Some(provider))
            .unwrap();
        let method = unit.find_method("qwertyuiopas", "()[B").unwrap();
        assert_eq!(provider_bytes(method), Some(vec![0x00, 0x41]));
        assert!(is_generated_provider_name("qwertyuiopas"));
        assert!(!is_generated_provider_name("getBytes"));
    }
}
