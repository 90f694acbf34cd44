//! Marshaling: serialize any tarn value to bytes and back.
//!
//! The wire format starts with either an inline integer byte or an
//! opcode in `0xC8..=0xDD`. Sharing and cycles are preserved through a
//! seen-table on the encoder and a parallel lookup array on the decoder;
//! function definitions and environments carry their own id spaces.
//! Decoded function definitions must pass the bytecode verifier before
//! the result is released.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace};

use super::bytecode::{
    FuncDef, SourceMapping, FUNCDEF_FLAG_HAS_DEFS, FUNCDEF_FLAG_HAS_ENVS,
    FUNCDEF_FLAG_HAS_NAME, FUNCDEF_FLAG_HAS_SOURCE, FUNCDEF_FLAG_HAS_SOURCEMAP,
};
use super::fiber::{Fiber, FiberStatus, StackFrame, FRAME_SIZE};
use super::heap::{FuncEnv, GcRef, Heap, HeapObject, ObjectKind, MAX_PROTO_DEPTH};
use super::value::Value;
use super::verifier::{self, VerifyError};
use super::RECURSION_GUARD;

// Wire opcodes. Bytes below INTEGER are inline values; INTEGER doubles as
// the lead byte of the five-byte integer form. 0xCE is reserved.
const TAG_INTEGER: u8 = 0xC8;
const TAG_REAL: u8 = 0xC9;
const TAG_NIL: u8 = 0xCA;
const TAG_FALSE: u8 = 0xCB;
const TAG_TRUE: u8 = 0xCC;
const TAG_FIBER: u8 = 0xCD;
const TAG_STRING: u8 = 0xCF;
const TAG_SYMBOL: u8 = 0xD0;
const TAG_KEYWORD: u8 = 0xD1;
const TAG_ARRAY: u8 = 0xD2;
const TAG_TUPLE: u8 = 0xD3;
const TAG_TABLE: u8 = 0xD4;
const TAG_TABLE_PROTO: u8 = 0xD5;
const TAG_STRUCT: u8 = 0xD6;
const TAG_BUFFER: u8 = 0xD7;
const TAG_FUNCTION: u8 = 0xD8;
const TAG_REGISTRY: u8 = 0xD9;
const TAG_OPAQUE: u8 = 0xDA;
const TAG_REFERENCE: u8 = 0xDB;
const TAG_FUNCENV_REF: u8 = 0xDC;
const TAG_FUNCDEF_REF: u8 = 0xDD;

// Wire-only flag bits, cleared again on decode.
const FIBER_FLAG_HAS_CHILD: i32 = 1 << 29;
const FRAME_FLAG_HAS_ENV: i32 = 1 << 30;

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("unexpected end of input at byte {0}")]
    Truncated(usize),
    #[error("unknown byte 0x{byte:02x} at index {at}")]
    BadOpcode { byte: u8, at: usize },
    #[error("invalid reference {id}")]
    BadReference { id: i32 },
    #[error("invalid environment reference {id}")]
    BadEnvReference { id: i32 },
    #[error("invalid definition reference {id}")]
    BadDefReference { id: i32 },
    #[error("decoded definition has invalid bytecode: {0}")]
    BadBytecode(#[from] VerifyError),
    #[error("bad fiber frame: {0}")]
    BadFrame(&'static str),
    #[error("cannot marshal a running fiber")]
    AliveFiber,
    #[error("cannot marshal a fiber with a host stack frame")]
    NativeFrame,
    #[error("unregistered opaque type {0}")]
    UnregisteredOpaque(String),
    #[error("no encoding for value of type {0}")]
    NoEncoding(&'static str),
    #[error("stack overflow")]
    StackOverflow,
    #[error("expected {expected}, got {found}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },
}

/// Doubles that are integral and in `i32` range take the integer wire
/// encoding instead of the eight-byte real encoding.
fn int_in_range(x: f64) -> Option<i32> {
    if x >= i32::MIN as f64 && x <= i32::MAX as f64 && x == (x as i32) as f64 {
        Some(x as i32)
    } else {
        None
    }
}

/// Append an integer in the 1/2/5-byte variable-length encoding.
fn push_varint(buf: &mut Vec<u8>, x: i32) {
    if (0..128).contains(&x) {
        buf.push(x as u8);
    } else if (-8192..8192).contains(&x) {
        buf.push((((x >> 8) & 0x3F) as u8) | 0x80);
        buf.push(x as u8);
    } else {
        buf.push(TAG_INTEGER);
        buf.extend_from_slice(&x.to_be_bytes());
    }
}

fn check_depth(flags: i32) -> Result<(), MarshalError> {
    if (flags & 0xFFFF) > RECURSION_GUARD {
        return Err(MarshalError::StackOverflow);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------

/// Identity key for the encoder's seen-table. Heap objects key by
/// handle; non-integral doubles key by bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SeenKey {
    Num(u64),
    Obj(GcRef),
}

fn seen_key(x: Value) -> Option<SeenKey> {
    match x {
        Value::Float(f) => Some(SeenKey::Num(f.to_bits())),
        Value::Ref(r) => Some(SeenKey::Obj(r)),
        _ => None,
    }
}

struct MarshalState<'a> {
    heap: &'a mut Heap,
    buf: &'a mut Vec<u8>,
    seen: HashMap<SeenKey, i32>,
    seen_envs: Vec<GcRef>,
    seen_defs: Vec<GcRef>,
    rreg: Option<GcRef>,
    next_id: i32,
}

impl MarshalState<'_> {
    fn mark_seen(&mut self, x: Value) {
        if let Some(key) = seen_key(x) {
            self.seen.insert(key, self.next_id);
            self.next_id += 1;
        }
    }
}

fn marshal_one(st: &mut MarshalState<'_>, x: Value, flags: i32) -> Result<(), MarshalError> {
    check_depth(flags)?;

    // Simple immediates gain nothing from memoization.
    match x {
        Value::Nil => {
            st.buf.push(TAG_NIL);
            return Ok(());
        }
        Value::Bool(false) => {
            st.buf.push(TAG_FALSE);
            return Ok(());
        }
        Value::Bool(true) => {
            st.buf.push(TAG_TRUE);
            return Ok(());
        }
        Value::Int(n) => {
            push_varint(st.buf, n);
            return Ok(());
        }
        Value::Float(f) => {
            if let Some(n) = int_in_range(f) {
                push_varint(st.buf, n);
                return Ok(());
            }
        }
        Value::Ref(_) => {}
    }

    // Back-reference to an already emitted value.
    if let Some(key) = seen_key(x) {
        if let Some(&id) = st.seen.get(&key) {
            st.buf.push(TAG_REFERENCE);
            push_varint(st.buf, id);
            return Ok(());
        }
    }

    // Registry values are replaced by their symbolic name.
    if let Some(rreg) = st.rreg {
        let name = st.heap.table_get(rreg, x);
        if let Some(r) = name.as_ref() {
            if st.heap.kind(r) == ObjectKind::Symbol {
                let bytes = st.heap.str_bytes(r).unwrap_or(&[]).to_vec();
                st.mark_seen(x);
                trace!(name = %String::from_utf8_lossy(&bytes), "registry hit");
                st.buf.push(TAG_REGISTRY);
                push_varint(st.buf, bytes.len() as i32);
                st.buf.extend_from_slice(&bytes);
                return Ok(());
            }
        }
    }

    match x {
        Value::Float(f) => {
            st.buf.push(TAG_REAL);
            st.buf.extend_from_slice(&f.to_le_bytes());
            st.mark_seen(x);
            Ok(())
        }
        Value::Ref(r) => marshal_one_ref(st, x, r, flags),
        // Nil, booleans and in-range numbers returned above.
        _ => Err(MarshalError::NoEncoding(x.kind_name())),
    }
}

fn marshal_one_ref(
    st: &mut MarshalState<'_>,
    x: Value,
    r: GcRef,
    flags: i32,
) -> Result<(), MarshalError> {
    let kind = st.heap.kind(r);
    match kind {
        ObjectKind::Str | ObjectKind::Symbol | ObjectKind::Keyword => {
            let tag = match kind {
                ObjectKind::Str => TAG_STRING,
                ObjectKind::Symbol => TAG_SYMBOL,
                _ => TAG_KEYWORD,
            };
            let bytes = st.heap.str_bytes(r).unwrap_or(&[]).to_vec();
            st.mark_seen(x);
            st.buf.push(tag);
            push_varint(st.buf, bytes.len() as i32);
            st.buf.extend_from_slice(&bytes);
            Ok(())
        }
        ObjectKind::Buffer => {
            let bytes = match st.heap.get(r) {
                HeapObject::Buffer(b) => b.clone(),
                _ => Vec::new(),
            };
            st.mark_seen(x);
            st.buf.push(TAG_BUFFER);
            push_varint(st.buf, bytes.len() as i32);
            st.buf.extend_from_slice(&bytes);
            Ok(())
        }
        ObjectKind::Array => {
            let items = st.heap.array_ref(r).cloned().unwrap_or_default();
            st.mark_seen(x);
            st.buf.push(TAG_ARRAY);
            push_varint(st.buf, items.len() as i32);
            for item in items {
                marshal_one(st, item, flags + 1)?;
            }
            Ok(())
        }
        ObjectKind::Tuple => {
            let (flag, items) = match st.heap.get(r) {
                HeapObject::Tuple(t) => (t.flag, t.items.to_vec()),
                _ => (0, Vec::new()),
            };
            st.buf.push(TAG_TUPLE);
            push_varint(st.buf, items.len() as i32);
            push_varint(st.buf, flag >> 16);
            for item in items {
                marshal_one(st, item, flags + 1)?;
            }
            // Immutable: marked seen only after its contents.
            st.mark_seen(x);
            Ok(())
        }
        ObjectKind::Table => {
            let (proto, entries) = match st.heap.get(r) {
                HeapObject::Table(t) => (t.proto, t.entries().to_vec()),
                _ => (None, Vec::new()),
            };
            if let Some(p) = proto {
                if st.heap.kind(p) != ObjectKind::Table {
                    return Err(MarshalError::WrongType {
                        expected: "table prototype",
                        found: st.heap.kind(p).name(),
                    });
                }
            }
            st.mark_seen(x);
            st.buf.push(if proto.is_some() {
                TAG_TABLE_PROTO
            } else {
                TAG_TABLE
            });
            push_varint(st.buf, entries.len() as i32);
            if let Some(p) = proto {
                marshal_one(st, Value::Ref(p), flags + 1)?;
            }
            for (k, v) in entries {
                marshal_one(st, k, flags + 1)?;
                marshal_one(st, v, flags + 1)?;
            }
            Ok(())
        }
        ObjectKind::Struct => {
            let entries = match st.heap.get(r) {
                HeapObject::Struct(s) => s.entries().to_vec(),
                _ => Vec::new(),
            };
            st.buf.push(TAG_STRUCT);
            push_varint(st.buf, entries.len() as i32);
            for (k, v) in entries {
                marshal_one(st, k, flags + 1)?;
                marshal_one(st, v, flags + 1)?;
            }
            st.mark_seen(x);
            Ok(())
        }
        ObjectKind::Opaque => {
            let (ty, data) = match st.heap.get(r) {
                HeapObject::Opaque(o) => (o.ty, o.data.clone()),
                _ => return Err(MarshalError::NoEncoding(kind.name())),
            };
            let Some(marshal_fn) = ty.marshal else {
                return Err(MarshalError::UnregisteredOpaque(ty.name.to_string()));
            };
            st.mark_seen(x);
            st.buf.push(TAG_OPAQUE);
            let name = st.heap.keyword(ty.name);
            marshal_one(st, Value::Ref(name), flags + 1)?;
            push_varint(st.buf, data.len() as i32);
            let mut ctx = MarshalContext {
                st: &mut *st,
                flags,
            };
            marshal_fn(&data, &mut ctx)
        }
        ObjectKind::Closure => {
            let (def_ref, envs) = match st.heap.get(r) {
                HeapObject::Closure(c) => (c.def, c.envs.clone()),
                _ => return Err(MarshalError::NoEncoding(kind.name())),
            };
            let env_count = match st.heap.def_ref(def_ref) {
                Some(d) => d.environments.len(),
                None => {
                    return Err(MarshalError::WrongType {
                        expected: "function definition",
                        found: st.heap.kind(def_ref).name(),
                    })
                }
            };
            if envs.len() != env_count {
                return Err(MarshalError::WrongType {
                    expected: "closure with one environment per captured frame",
                    found: "mismatched environment count",
                });
            }
            st.buf.push(TAG_FUNCTION);
            marshal_one_def(st, def_ref, flags + 1)?;
            // Seen after the definition but before the environments, so
            // a self-recursive closure can reference itself.
            st.mark_seen(x);
            for env in envs {
                marshal_one_env(st, env, flags + 1)?;
            }
            Ok(())
        }
        ObjectKind::Fiber => {
            st.mark_seen(x);
            st.buf.push(TAG_FIBER);
            marshal_one_fiber(st, r, flags + 1)
        }
        ObjectKind::Native | ObjectKind::FuncDef | ObjectKind::FuncEnv => {
            Err(MarshalError::NoEncoding(kind.name()))
        }
    }
}

fn marshal_one_def(
    st: &mut MarshalState<'_>,
    def_ref: GcRef,
    flags: i32,
) -> Result<(), MarshalError> {
    check_depth(flags)?;
    if let Some(id) = st.seen_defs.iter().position(|&d| d == def_ref) {
        st.buf.push(TAG_FUNCDEF_REF);
        push_varint(st.buf, id as i32);
        return Ok(());
    }
    st.seen_defs.push(def_ref);

    let def = match st.heap.def_ref(def_ref) {
        Some(d) => d.clone(),
        None => {
            return Err(MarshalError::WrongType {
                expected: "function definition",
                found: st.heap.kind(def_ref).name(),
            })
        }
    };
    push_varint(st.buf, def.section_flags());
    push_varint(st.buf, def.slot_count);
    push_varint(st.buf, def.arity);
    push_varint(st.buf, def.constants.len() as i32);
    push_varint(st.buf, def.bytecode.len() as i32);
    if !def.environments.is_empty() {
        push_varint(st.buf, def.environments.len() as i32);
    }
    if !def.defs.is_empty() {
        push_varint(st.buf, def.defs.len() as i32);
    }
    if let Some(name) = def.name {
        marshal_one(st, Value::Ref(name), flags + 1)?;
    }
    if let Some(source) = def.source {
        marshal_one(st, Value::Ref(source), flags + 1)?;
    }
    for c in &def.constants {
        marshal_one(st, *c, flags + 1)?;
    }
    for word in &def.bytecode {
        st.buf.extend_from_slice(&word.to_le_bytes());
    }
    for e in &def.environments {
        push_varint(st.buf, *e);
    }
    for d in &def.defs {
        marshal_one_def(st, *d, flags + 1)?;
    }
    if !def.sourcemap.is_empty() {
        // Delta-encoded so monotone local ranges stay small on the wire.
        let mut current = 0i32;
        for map in &def.sourcemap {
            push_varint(st.buf, map.start.wrapping_sub(current));
            push_varint(st.buf, map.end.wrapping_sub(map.start));
            current = map.end;
        }
    }
    Ok(())
}

fn marshal_one_env(
    st: &mut MarshalState<'_>,
    env_ref: GcRef,
    flags: i32,
) -> Result<(), MarshalError> {
    check_depth(flags)?;
    if let Some(id) = st.seen_envs.iter().position(|&e| e == env_ref) {
        st.buf.push(TAG_FUNCENV_REF);
        push_varint(st.buf, id as i32);
        return Ok(());
    }
    st.seen_envs.push(env_ref);

    let env = match st.heap.env_ref(env_ref) {
        Some(e) => e.clone(),
        None => {
            return Err(MarshalError::WrongType {
                expected: "function environment",
                found: st.heap.kind(env_ref).name(),
            })
        }
    };
    push_varint(st.buf, env.offset);
    push_varint(st.buf, env.length);
    if env.offset != 0 {
        // Live variant: the owning fiber carries the cells.
        let fiber = env.fiber.ok_or(MarshalError::WrongType {
            expected: "environment with an owning fiber",
            found: "detached environment",
        })?;
        marshal_one(st, Value::Ref(fiber), flags + 1)
    } else {
        if env.values.len() != env.length as usize {
            return Err(MarshalError::WrongType {
                expected: "environment cells matching the declared length",
                found: "mismatched cell count",
            });
        }
        for v in env.values {
            marshal_one(st, v, flags + 1)?;
        }
        Ok(())
    }
}

fn marshal_one_fiber(
    st: &mut MarshalState<'_>,
    fiber_ref: GcRef,
    flags: i32,
) -> Result<(), MarshalError> {
    check_depth(flags)?;
    let fiber = match st.heap.fiber_ref(fiber_ref) {
        Some(f) => f.clone(),
        None => {
            return Err(MarshalError::WrongType {
                expected: "fiber",
                found: st.heap.kind(fiber_ref).name(),
            })
        }
    };
    if fiber.status() == FiberStatus::Alive {
        return Err(MarshalError::AliveFiber);
    }
    let mut fiber_flags = fiber.flags;
    if fiber.child.is_some() {
        fiber_flags |= FIBER_FLAG_HAS_CHILD;
    }
    push_varint(st.buf, fiber_flags);
    push_varint(st.buf, fiber.frame);
    push_varint(st.buf, fiber.stack_start);
    push_varint(st.buf, fiber.stack_top);
    push_varint(st.buf, fiber.max_stack);

    // Walk the frame chain from the innermost frame outward.
    let mut base = fiber.frame;
    let mut top = fiber.stack_start - FRAME_SIZE;
    while base > 0 {
        let frame = match fiber.frame_at(base) {
            Some(f) => f.clone(),
            None => return Err(MarshalError::BadFrame("missing frame record")),
        };
        let func = frame.func.ok_or(MarshalError::NativeFrame)?;
        let mut frame_flags = frame.flags;
        if frame.env.is_some() {
            frame_flags |= FRAME_FLAG_HAS_ENV;
        }
        push_varint(st.buf, frame_flags);
        push_varint(st.buf, frame.prev_frame);
        push_varint(st.buf, frame.pc);
        marshal_one(st, Value::Ref(func), flags + 1)?;
        if let Some(env) = frame.env {
            marshal_one_env(st, env, flags + 1)?;
        }
        if base > top || top as usize > fiber.data.len() {
            return Err(MarshalError::BadFrame("frame slots out of range"));
        }
        for k in base..top {
            marshal_one(st, fiber.data[k as usize], flags + 1)?;
        }
        top = base - FRAME_SIZE;
        base = frame.prev_frame;
    }
    if let Some(child) = fiber.child {
        marshal_one(st, Value::Ref(child), flags + 1)?;
    }
    Ok(())
}

/// Context handed to opaque-type marshal callbacks.
pub struct MarshalContext<'a, 'b> {
    st: &'a mut MarshalState<'b>,
    pub flags: i32,
}

impl MarshalContext<'_, '_> {
    pub fn push_varint(&mut self, x: i32) {
        push_varint(self.st.buf, x);
    }

    pub fn push_byte(&mut self, b: u8) {
        self.st.buf.push(b);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.st.buf.extend_from_slice(bytes);
    }

    pub fn push_value(&mut self, v: Value) -> Result<(), MarshalError> {
        marshal_one(self.st, v, self.flags + 1)
    }
}

// ---------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------

struct UnmarshalState<'a> {
    heap: &'a mut Heap,
    data: &'a [u8],
    pos: usize,
    lookup: Vec<Value>,
    lookup_envs: Vec<GcRef>,
    lookup_defs: Vec<GcRef>,
    reg: Option<GcRef>,
}

impl<'a> UnmarshalState<'a> {
    fn peek(&self) -> Result<u8, MarshalError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(MarshalError::Truncated(self.pos))
    }

    fn read_u8(&mut self) -> Result<u8, MarshalError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], MarshalError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(MarshalError::Truncated(self.data.len()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_varint(&mut self) -> Result<i32, MarshalError> {
        let at = self.pos;
        let b0 = self.read_u8()?;
        if b0 < 0x80 {
            Ok(b0 as i32)
        } else if b0 < 0xC0 {
            let b1 = self.read_u8()?;
            let raw = (((b0 & 0x3F) as i32) << 8) | b1 as i32;
            // Sign-extend from 14 bits.
            Ok((raw << 18) >> 18)
        } else if b0 == TAG_INTEGER {
            let b = self.read_bytes(4)?;
            Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        } else {
            Err(MarshalError::BadOpcode { byte: b0, at })
        }
    }

    /// A non-negative varint used as a length.
    fn read_len(&mut self) -> Result<usize, MarshalError> {
        let n = self.read_varint()?;
        if n < 0 {
            return Err(MarshalError::Truncated(self.pos));
        }
        Ok(n as usize)
    }

    /// Capacity hint bounded by the input left to read, so a forged
    /// length cannot force a huge allocation up front.
    fn capacity_hint(&self, len: usize) -> usize {
        len.min(self.data.len() - self.pos)
    }
}

fn expect_string(st: &UnmarshalState<'_>, v: Value) -> Result<GcRef, MarshalError> {
    match v.as_ref() {
        Some(r) if st.heap.kind(r) == ObjectKind::Str => Ok(r),
        _ => Err(MarshalError::WrongType {
            expected: "string",
            found: st.heap.type_name(v),
        }),
    }
}

fn unmarshal_one(st: &mut UnmarshalState<'_>, flags: i32) -> Result<Value, MarshalError> {
    check_depth(flags)?;
    let at = st.pos;
    let lead = st.peek()?;
    if lead <= TAG_INTEGER {
        return Ok(Value::Int(st.read_varint()?));
    }
    st.pos += 1;
    match lead {
        TAG_NIL => Ok(Value::Nil),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_REAL => {
            let b = st.read_bytes(8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            let out = Value::Float(f64::from_le_bytes(raw));
            st.lookup.push(out);
            Ok(out)
        }
        TAG_STRING | TAG_SYMBOL | TAG_KEYWORD | TAG_BUFFER | TAG_REGISTRY => {
            let len = st.read_len()?;
            let bytes = st.read_bytes(len)?;
            let out = match lead {
                TAG_STRING => Value::Ref(st.heap.string(bytes)),
                TAG_SYMBOL => Value::Ref(st.heap.symbol(bytes)),
                TAG_KEYWORD => Value::Ref(st.heap.keyword(bytes)),
                TAG_BUFFER => Value::Ref(st.heap.buffer(bytes)),
                _ => match st.reg {
                    // An unknown registry name decodes to nil but still
                    // takes up its id slot.
                    Some(reg) => {
                        let sym = st.heap.symbol(bytes);
                        st.heap.table_get(reg, Value::Ref(sym))
                    }
                    None => Value::Nil,
                },
            };
            st.lookup.push(out);
            Ok(out)
        }
        TAG_FIBER => Ok(Value::Ref(unmarshal_one_fiber(st, flags)?)),
        TAG_FUNCTION => {
            let def = unmarshal_one_def(st, flags + 1)?;
            let env_count = st.heap.def_ref(def).map(|d| d.environments.len()).unwrap_or(0);
            let closure = st.heap.closure(def, Vec::with_capacity(env_count));
            let out = Value::Ref(closure);
            st.lookup.push(out);
            for _ in 0..env_count {
                let env = unmarshal_one_env(st, flags + 1)?;
                if let Some(c) = st.heap.closure_mut(closure) {
                    c.envs.push(env);
                }
            }
            Ok(out)
        }
        TAG_OPAQUE => unmarshal_one_opaque(st, flags),
        TAG_REFERENCE => {
            let id = st.read_varint()?;
            st.lookup
                .get(id as usize)
                .copied()
                .ok_or(MarshalError::BadReference { id })
        }
        TAG_ARRAY => {
            let len = st.read_len()?;
            let cap = st.capacity_hint(len);
            let array = st.heap.array(Vec::with_capacity(cap));
            let out = Value::Ref(array);
            st.lookup.push(out);
            for _ in 0..len {
                let v = unmarshal_one(st, flags + 1)?;
                if let Some(items) = st.heap.array_mut(array) {
                    items.push(v);
                }
            }
            Ok(out)
        }
        TAG_TUPLE => {
            let len = st.read_len()?;
            let flag = st.read_varint()?;
            let mut items = Vec::with_capacity(st.capacity_hint(len));
            for _ in 0..len {
                items.push(unmarshal_one(st, flags + 1)?);
            }
            let out = Value::Ref(st.heap.tuple(flag << 16, items));
            st.lookup.push(out);
            Ok(out)
        }
        TAG_STRUCT => {
            let len = st.read_len()?;
            let mut pairs = Vec::with_capacity(st.capacity_hint(len));
            for _ in 0..len {
                let key = unmarshal_one(st, flags + 1)?;
                let value = unmarshal_one(st, flags + 1)?;
                pairs.push((key, value));
            }
            let out = Value::Ref(st.heap.struct_from(pairs));
            st.lookup.push(out);
            Ok(out)
        }
        TAG_TABLE | TAG_TABLE_PROTO => {
            let len = st.read_len()?;
            let table = st.heap.table(None);
            let out = Value::Ref(table);
            st.lookup.push(out);
            if lead == TAG_TABLE_PROTO {
                let proto = unmarshal_one(st, flags + 1)?;
                let proto_ref = match proto.as_ref() {
                    Some(p) if st.heap.kind(p) == ObjectKind::Table => p,
                    _ => {
                        return Err(MarshalError::WrongType {
                            expected: "table",
                            found: st.heap.type_name(proto),
                        })
                    }
                };
                if let Some(t) = st.heap.table_mut(table) {
                    t.proto = Some(proto_ref);
                }
            }
            for _ in 0..len {
                let key = unmarshal_one(st, flags + 1)?;
                let value = unmarshal_one(st, flags + 1)?;
                st.heap.table_put(table, key, value);
            }
            Ok(out)
        }
        _ => Err(MarshalError::BadOpcode { byte: lead, at }),
    }
}

fn unmarshal_one_opaque(st: &mut UnmarshalState<'_>, flags: i32) -> Result<Value, MarshalError> {
    // The encoder assigns the opaque value its id before emitting the
    // type-name keyword, so reserve the slot first and fill it below.
    let slot = st.lookup.len();
    st.lookup.push(Value::Nil);
    let namev = unmarshal_one(st, flags + 1)?;
    let name_ref = match namev.as_ref() {
        Some(r) if st.heap.kind(r) == ObjectKind::Keyword => r,
        _ => {
            return Err(MarshalError::WrongType {
                expected: "keyword",
                found: st.heap.type_name(namev),
            })
        }
    };
    let name_bytes = st.heap.str_bytes(name_ref).unwrap_or(&[]).to_vec();
    let ty = match st.heap.get_opaque_type(&name_bytes) {
        Some(ty) => ty,
        None => {
            return Err(MarshalError::UnregisteredOpaque(
                String::from_utf8_lossy(&name_bytes).into_owned(),
            ))
        }
    };
    let Some(unmarshal_fn) = ty.unmarshal else {
        return Err(MarshalError::UnregisteredOpaque(ty.name.to_string()));
    };
    let size = st.read_len()?;
    // An instance block larger than the whole input is a forged size;
    // reject it before allocating anything of that size. The callback
    // gets a block of exactly the declared size either way.
    if size > st.data.len() {
        return Err(MarshalError::Truncated(st.pos));
    }
    let opaque = st.heap.opaque(ty, vec![0u8; size].into_boxed_slice());
    st.lookup[slot] = Value::Ref(opaque);
    let mut block = vec![0u8; size];
    {
        let mut ctx = UnmarshalContext {
            st: &mut *st,
            flags,
        };
        unmarshal_fn(&mut block, &mut ctx)?;
    }
    if let HeapObject::Opaque(o) = st.heap.get_mut(opaque) {
        o.data = block.into_boxed_slice();
    }
    Ok(Value::Ref(opaque))
}

fn unmarshal_one_def(st: &mut UnmarshalState<'_>, flags: i32) -> Result<GcRef, MarshalError> {
    check_depth(flags)?;
    if st.peek()? == TAG_FUNCDEF_REF {
        st.pos += 1;
        let id = st.read_varint()?;
        return st
            .lookup_defs
            .get(id as usize)
            .copied()
            .ok_or(MarshalError::BadDefReference { id });
    }

    // Allocate a zero-length skeleton first so a failure partway leaves
    // a collectible object behind the already published id.
    let def_ref = st.heap.alloc(HeapObject::FuncDef(FuncDef::default()));
    st.lookup_defs.push(def_ref);

    let mut def = FuncDef {
        flags: st.read_varint()?,
        slot_count: st.read_varint()?,
        arity: st.read_varint()?,
        ..FuncDef::default()
    };
    let constants_len = st.read_len()?;
    let bytecode_len = st.read_len()?;
    let environments_len = if def.flags & FUNCDEF_FLAG_HAS_ENVS != 0 {
        st.read_len()?
    } else {
        0
    };
    let defs_len = if def.flags & FUNCDEF_FLAG_HAS_DEFS != 0 {
        st.read_len()?
    } else {
        0
    };
    if def.flags & FUNCDEF_FLAG_HAS_NAME != 0 {
        let v = unmarshal_one(st, flags + 1)?;
        def.name = Some(expect_string(st, v)?);
    }
    if def.flags & FUNCDEF_FLAG_HAS_SOURCE != 0 {
        let v = unmarshal_one(st, flags + 1)?;
        def.source = Some(expect_string(st, v)?);
    }
    for _ in 0..constants_len {
        let c = unmarshal_one(st, flags + 1)?;
        def.constants.push(c);
    }
    for _ in 0..bytecode_len {
        let b = st.read_bytes(4)?;
        def.bytecode.push(u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
    }
    for _ in 0..environments_len {
        def.environments.push(st.read_varint()?);
    }
    for _ in 0..defs_len {
        let d = unmarshal_one_def(st, flags + 1)?;
        def.defs.push(d);
    }
    if def.flags & FUNCDEF_FLAG_HAS_SOURCEMAP != 0 {
        let mut current = 0i32;
        for _ in 0..bytecode_len {
            current = current.wrapping_add(st.read_varint()?);
            let start = current;
            current = current.wrapping_add(st.read_varint()?);
            def.sourcemap.push(SourceMapping {
                start,
                end: current,
            });
        }
    }

    // The definition is only valid once the verifier accepts it.
    verifier::verify(&def)?;
    st.heap.replace(def_ref, HeapObject::FuncDef(def));
    Ok(def_ref)
}

fn unmarshal_one_env(st: &mut UnmarshalState<'_>, flags: i32) -> Result<GcRef, MarshalError> {
    check_depth(flags)?;
    if st.peek()? == TAG_FUNCENV_REF {
        st.pos += 1;
        let id = st.read_varint()?;
        return st
            .lookup_envs
            .get(id as usize)
            .copied()
            .ok_or(MarshalError::BadEnvReference { id });
    }

    let env_ref = st.heap.alloc(HeapObject::FuncEnv(FuncEnv {
        offset: 0,
        length: 0,
        fiber: None,
        values: Vec::new(),
    }));
    st.lookup_envs.push(env_ref);
    let offset = st.read_varint()?;
    let length = st.read_varint()?;
    if offset != 0 {
        // Live variant: decode the owning fiber, which may itself have
        // claimed this environment for one of its frames. The claim must
        // agree with the wire.
        let fiberv = unmarshal_one(st, flags)?;
        let fiber_ref = match fiberv.as_ref() {
            Some(r) if st.heap.kind(r) == ObjectKind::Fiber => r,
            _ => {
                return Err(MarshalError::WrongType {
                    expected: "fiber",
                    found: st.heap.type_name(fiberv),
                })
            }
        };
        let (claimed_offset, claimed_length) = match st.heap.env_ref(env_ref) {
            Some(e) => (e.offset, e.length),
            None => (0, 0),
        };
        if claimed_offset != 0 && claimed_offset != offset {
            return Err(MarshalError::BadFrame(
                "environment offset does not match its fiber frame",
            ));
        }
        if claimed_length != 0 && claimed_length != length {
            return Err(MarshalError::BadFrame(
                "environment length does not match its fiber frame",
            ));
        }
        let stack_len = st.heap.fiber_ref(fiber_ref).map(|f| f.data.len()).unwrap_or(0);
        if offset < 0 || length < 0 || offset as i64 + length as i64 > stack_len as i64 {
            return Err(MarshalError::BadFrame(
                "environment window outside the fiber stack",
            ));
        }
        if let Some(e) = st.heap.env_mut(env_ref) {
            e.offset = offset;
            e.length = length;
            e.fiber = Some(fiber_ref);
        }
    } else {
        if length < 0 {
            return Err(MarshalError::Truncated(st.pos));
        }
        let mut values = Vec::with_capacity(st.capacity_hint(length as usize));
        for _ in 0..length {
            values.push(unmarshal_one(st, flags)?);
        }
        if let Some(e) = st.heap.env_mut(env_ref) {
            e.length = length;
            e.values = values;
        }
    }
    Ok(env_ref)
}

fn unmarshal_one_fiber(st: &mut UnmarshalState<'_>, flags: i32) -> Result<GcRef, MarshalError> {
    check_depth(flags)?;
    // Publish the fiber before reading its body so the frame chain can
    // reference it cyclically.
    let fiber_ref = st.heap.alloc(HeapObject::Fiber(Fiber::default()));
    st.lookup.push(Value::Ref(fiber_ref));

    let wire_flags = st.read_varint()?;
    let frame = st.read_varint()?;
    let stack_start = st.read_varint()?;
    let stack_top = st.read_varint()?;
    let max_stack = st.read_varint()?;

    if frame < 0
        || stack_top < 0
        || frame as i64 + FRAME_SIZE as i64 > stack_start as i64
        || stack_start > stack_top
        || stack_top > max_stack
    {
        return Err(MarshalError::BadFrame("incorrect stack setup"));
    }
    // A declared stack larger than the input that populates it can only
    // be a forged header; reject it before sizing the data vector.
    if stack_top as i64 > st.data.len() as i64 {
        return Err(MarshalError::BadFrame("stack larger than input"));
    }

    if let Some(f) = st.heap.fiber_mut(fiber_ref) {
        f.flags = wire_flags;
        f.stack_start = stack_start;
        f.stack_top = stack_top;
        f.max_stack = max_stack;
        f.data = vec![Value::Nil; stack_top as usize + 10];
    }

    // The encoder wrote frames innermost-first; follow the same chain.
    let mut stack = frame as i64;
    let mut stacktop = stack_start as i64 - FRAME_SIZE as i64;
    while stack > 0 {
        let mut frame_flags = st.read_varint()?;
        let prev_frame = st.read_varint()?;
        let pc = st.read_varint()?;

        let funcv = unmarshal_one(st, flags + 1)?;
        let func_ref = match funcv.as_ref() {
            Some(r) if st.heap.kind(r) == ObjectKind::Closure => r,
            _ => {
                return Err(MarshalError::WrongType {
                    expected: "function",
                    found: st.heap.type_name(funcv),
                })
            }
        };
        let def_ref = st.heap.closure_ref(func_ref).map(|c| c.def);
        let (slot_count, bytecode_len) = match def_ref.and_then(|d| st.heap.def_ref(d)) {
            Some(d) => (d.slot_count, d.bytecode.len()),
            None => (0, 0),
        };

        let mut env = None;
        if frame_flags & FRAME_FLAG_HAS_ENV != 0 {
            frame_flags &= !FRAME_FLAG_HAS_ENV;
            let env_ref = unmarshal_one_env(st, flags + 1)?;
            let (claimed_offset, claimed_length) = match st.heap.env_ref(env_ref) {
                Some(e) => (e.offset, e.length),
                None => (0, 0),
            };
            if claimed_offset != 0 && claimed_offset as i64 != stack {
                return Err(MarshalError::BadFrame(
                    "environment offset does not match fiber frame",
                ));
            }
            if claimed_length != 0 && claimed_length as i64 != stacktop - stack {
                return Err(MarshalError::BadFrame(
                    "environment length does not match fiber frame",
                ));
            }
            if let Some(e) = st.heap.env_mut(env_ref) {
                e.offset = stack as i32;
                e.length = (stacktop - stack) as i32;
                e.fiber = Some(fiber_ref);
            }
            env = Some(env_ref);
        }

        if slot_count as i64 != stacktop - stack {
            return Err(MarshalError::BadFrame("stack frame size mismatch"));
        }
        if pc < 0 || pc as usize >= bytecode_len {
            return Err(MarshalError::BadFrame(
                "stack frame program counter out of range",
            ));
        }
        if prev_frame as i64 + FRAME_SIZE as i64 > stack {
            return Err(MarshalError::BadFrame(
                "stack frame does not align with previous frame",
            ));
        }

        for k in stack..stacktop {
            let v = unmarshal_one(st, flags + 1)?;
            if let Some(f) = st.heap.fiber_mut(fiber_ref) {
                f.data[k as usize] = v;
            }
        }

        if let Some(f) = st.heap.fiber_mut(fiber_ref) {
            f.frames.push(StackFrame {
                base: stack as i32,
                flags: frame_flags,
                prev_frame,
                pc,
                func: Some(func_ref),
                env,
            });
        }

        stacktop = stack - FRAME_SIZE as i64;
        stack = prev_frame as i64;
    }
    if stack < 0 {
        return Err(MarshalError::BadFrame("too many stack frames"));
    }

    if wire_flags & FIBER_FLAG_HAS_CHILD != 0 {
        let childv = unmarshal_one(st, flags + 1)?;
        let child_ref = match childv.as_ref() {
            Some(r) if st.heap.kind(r) == ObjectKind::Fiber => r,
            _ => {
                return Err(MarshalError::WrongType {
                    expected: "fiber",
                    found: st.heap.type_name(childv),
                })
            }
        };
        if let Some(f) = st.heap.fiber_mut(fiber_ref) {
            f.flags &= !FIBER_FLAG_HAS_CHILD;
            f.child = Some(child_ref);
        }
    }

    // Published last so a failed decode leaves no live frame chain.
    if let Some(f) = st.heap.fiber_mut(fiber_ref) {
        f.frame = frame;
    }
    Ok(fiber_ref)
}

/// Context handed to opaque-type unmarshal callbacks.
pub struct UnmarshalContext<'a, 'b> {
    st: &'a mut UnmarshalState<'b>,
    pub flags: i32,
}

impl UnmarshalContext<'_, '_> {
    pub fn read_varint(&mut self) -> Result<i32, MarshalError> {
        self.st.read_varint()
    }

    pub fn read_byte(&mut self) -> Result<u8, MarshalError> {
        self.st.read_u8()
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, MarshalError> {
        self.st.read_bytes(len).map(|b| b.to_vec())
    }

    pub fn read_value(&mut self) -> Result<Value, MarshalError> {
        unmarshal_one(self.st, self.flags)
    }
}

// ---------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------

/// Serialize a value into a fresh byte buffer.
///
/// `rreg` is an optional reverse registry table mapping values to the
/// symbols they should be replaced by on the wire.
pub fn marshal(heap: &mut Heap, x: Value, rreg: Option<GcRef>) -> Result<Vec<u8>, MarshalError> {
    let mut buf = Vec::new();
    marshal_into(heap, x, rreg, &mut buf)?;
    Ok(buf)
}

/// Serialize a value, appending to a caller-supplied sink.
///
/// On failure the sink may hold partial output and must be discarded.
pub fn marshal_into(
    heap: &mut Heap,
    x: Value,
    rreg: Option<GcRef>,
    buf: &mut Vec<u8>,
) -> Result<(), MarshalError> {
    if let Some(r) = rreg {
        if heap.kind(r) != ObjectKind::Table {
            return Err(MarshalError::WrongType {
                expected: "table",
                found: heap.kind(r).name(),
            });
        }
    }
    let mut st = MarshalState {
        heap,
        buf,
        seen: HashMap::new(),
        seen_envs: Vec::new(),
        seen_defs: Vec::new(),
        rreg,
        next_id: 0,
    };
    marshal_one(&mut st, x, 0)?;
    debug!(bytes = buf.len(), "marshaled value");
    Ok(())
}

/// Decode one value from the start of `data`.
///
/// `reg` is an optional forward registry table mapping symbols back to
/// values. Returns the value and the index of the first byte not
/// consumed, so concatenated values can be decoded sequentially.
pub fn unmarshal(
    heap: &mut Heap,
    data: &[u8],
    reg: Option<GcRef>,
) -> Result<(Value, usize), MarshalError> {
    if let Some(r) = reg {
        if heap.kind(r) != ObjectKind::Table {
            return Err(MarshalError::WrongType {
                expected: "table",
                found: heap.kind(r).name(),
            });
        }
    }
    let mut st = UnmarshalState {
        heap,
        data,
        pos: 0,
        lookup: Vec::new(),
        lookup_envs: Vec::new(),
        lookup_defs: Vec::new(),
        reg,
    };
    let value = unmarshal_one(&mut st, 0)?;
    let next = st.pos;
    debug!(consumed = next, "unmarshaled value");
    Ok((value, next))
}

/// Build a forward registry table from a scoping table.
///
/// Walks the table and its prototype chain, collecting symbol-keyed
/// entries whose cell (a table or struct) carries a `:value` or `:ref`
/// slot. The result maps symbols to values and is suitable as the
/// forward registry of [`unmarshal`]; invert it for [`marshal`].
pub fn env_lookup(heap: &mut Heap, env: GcRef) -> Result<GcRef, MarshalError> {
    if heap.kind(env) != ObjectKind::Table {
        return Err(MarshalError::WrongType {
            expected: "table",
            found: heap.kind(env).name(),
        });
    }
    let kw_value = heap.keyword("value");
    let kw_ref = heap.keyword("ref");
    let result = heap.table(None);
    let mut current = Some(env);
    let mut depth = 0;
    while let Some(t) = current {
        if depth > MAX_PROTO_DEPTH {
            break;
        }
        let (entries, proto) = match heap.table_ref(t) {
            Some(table) => (table.entries().to_vec(), table.proto),
            None => break,
        };
        for (key, cell) in entries {
            let is_symbol = matches!(key, Value::Ref(r) if heap.kind(r) == ObjectKind::Symbol);
            if !is_symbol {
                continue;
            }
            let resolved = entry_value(heap, cell, kw_value, kw_ref);
            heap.table_put(result, key, resolved);
        }
        current = proto;
        depth += 1;
    }
    Ok(result)
}

/// Look inside a scope entry for the value it binds.
fn entry_value(heap: &Heap, cell: Value, kw_value: GcRef, kw_ref: GcRef) -> Value {
    let Some(r) = cell.as_ref() else {
        return Value::Nil;
    };
    match heap.get(r) {
        HeapObject::Table(_) => {
            let v = heap.table_get(r, Value::Ref(kw_value));
            if v.is_nil() {
                heap.table_get(r, Value::Ref(kw_ref))
            } else {
                v
            }
        }
        HeapObject::Struct(_) => {
            let v = heap.struct_get(r, Value::Ref(kw_value));
            if v.is_nil() {
                heap.struct_get(r, Value::Ref(kw_ref))
            } else {
                v
            }
        }
        _ => Value::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_int(x: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        push_varint(&mut buf, x);
        buf
    }

    fn decode_int(bytes: &[u8]) -> Result<i32, MarshalError> {
        let mut heap = Heap::new();
        let mut st = UnmarshalState {
            heap: &mut heap,
            data: bytes,
            pos: 0,
            lookup: Vec::new(),
            lookup_envs: Vec::new(),
            lookup_defs: Vec::new(),
            reg: None,
        };
        st.read_varint()
    }

    #[test]
    fn test_varint_one_byte() {
        assert_eq!(encode_int(0), vec![0x00]);
        assert_eq!(encode_int(42), vec![0x2A]);
        assert_eq!(encode_int(127), vec![0x7F]);
    }

    #[test]
    fn test_varint_two_bytes() {
        assert_eq!(encode_int(128), vec![0x80, 0x80]);
        assert_eq!(encode_int(-1), vec![0xBF, 0xFF]);
        assert_eq!(encode_int(-8192), vec![0xA0, 0x00]);
        assert_eq!(encode_int(8191), vec![0x9F, 0xFF]);
    }

    #[test]
    fn test_varint_five_bytes() {
        assert_eq!(
            encode_int(1_000_000),
            vec![0xC8, 0x00, 0x0F, 0x42, 0x40]
        );
        assert_eq!(encode_int(8192), vec![0xC8, 0x00, 0x00, 0x20, 0x00]);
    }

    #[test]
    fn test_varint_roundtrip_boundaries() {
        for x in [
            0,
            1,
            127,
            128,
            8191,
            -8192,
            8192,
            -8193,
            i32::MIN,
            i32::MAX,
        ] {
            assert_eq!(decode_int(&encode_int(x)).unwrap(), x, "value {x}");
        }
    }

    #[test]
    fn test_varint_bad_lead_bytes() {
        for b in 0xC0..=0xC7u8 {
            assert!(matches!(
                decode_int(&[b]),
                Err(MarshalError::BadOpcode { .. })
            ));
        }
        assert!(matches!(decode_int(&[0xC9]), Err(MarshalError::BadOpcode { .. })));
    }

    #[test]
    fn test_varint_truncated() {
        assert!(matches!(decode_int(&[]), Err(MarshalError::Truncated(_))));
        assert!(matches!(decode_int(&[0x80]), Err(MarshalError::Truncated(_))));
        assert!(matches!(
            decode_int(&[0xC8, 0x00]),
            Err(MarshalError::Truncated(_))
        ));
    }

    #[test]
    fn test_int_in_range() {
        assert_eq!(int_in_range(5.0), Some(5));
        assert_eq!(int_in_range(-0.0), Some(0));
        assert_eq!(int_in_range(5.5), None);
        assert_eq!(int_in_range(f64::NAN), None);
        assert_eq!(int_in_range(1e300), None);
        assert_eq!(int_in_range(i32::MAX as f64), Some(i32::MAX));
        assert_eq!(int_in_range(i32::MIN as f64), Some(i32::MIN));
    }
}
