//! Heap objects and the allocator for the tarn runtime.
//!
//! The heap is a slab of tagged objects addressed by [`GcRef`] handles.
//! Strings, symbols and keywords are interned so that equal byte content
//! always yields the same handle. The tracing collector itself lives in
//! the host; this crate only allocates, and objects that become
//! unreachable (for example after a failed decode) are left for the host
//! tracer to reclaim.

use std::collections::HashMap;
use std::fmt;

use tracing::trace;

use super::bytecode::FuncDef;
use super::fiber::Fiber;
use super::marshal::{MarshalContext, MarshalError, UnmarshalContext};
use super::value::Value;

/// Maximum prototype-chain depth followed by table lookups.
pub const MAX_PROTO_DEPTH: usize = 200;

/// A handle to a heap object.
///
/// Handles are only produced by [`Heap::alloc`], so a handle is always in
/// bounds for the heap that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef(usize);

impl fmt::Display for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocation kinds, used to tag heap slots for the host tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Str,
    Symbol,
    Keyword,
    Buffer,
    Array,
    Tuple,
    Table,
    Struct,
    Opaque,
    Native,
    Closure,
    FuncDef,
    FuncEnv,
    Fiber,
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Str => "string",
            ObjectKind::Symbol => "symbol",
            ObjectKind::Keyword => "keyword",
            ObjectKind::Buffer => "buffer",
            ObjectKind::Array => "array",
            ObjectKind::Tuple => "tuple",
            ObjectKind::Table => "table",
            ObjectKind::Struct => "struct",
            ObjectKind::Opaque => "opaque",
            ObjectKind::Native => "native function",
            ObjectKind::Closure => "function",
            ObjectKind::FuncDef => "function definition",
            ObjectKind::FuncEnv => "function environment",
            ObjectKind::Fiber => "fiber",
        }
    }
}

/// An immutable sequence carrying a small flag word. The upper 16 bits of
/// the flag are a host-supplied tag; the low bits are runtime-internal.
#[derive(Debug, Clone)]
pub struct Tuple {
    pub flag: i32,
    pub items: Box<[Value]>,
}

/// A mutable mapping with an optional prototype table.
///
/// Entries keep insertion order. Nil keys are rejected and putting a nil
/// value deletes the entry, so no stored entry ever has a nil key.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub proto: Option<GcRef>,
    entries: Vec<(Value, Value)>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }
}

/// An immutable mapping.
#[derive(Debug, Clone)]
pub struct Struct {
    entries: Box<[(Value, Value)]>,
}

impl Struct {
    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Marshal callback for an opaque type: serializes the instance bytes
/// through the context's push primitives.
pub type OpaqueMarshalFn =
    fn(&[u8], &mut MarshalContext<'_, '_>) -> Result<(), MarshalError>;

/// Unmarshal callback for an opaque type: fills a freshly allocated
/// instance block from the context's read primitives.
pub type OpaqueUnmarshalFn =
    fn(&mut [u8], &mut UnmarshalContext<'_, '_>) -> Result<(), MarshalError>;

/// Descriptor for a host-defined opaque type.
///
/// Types without a marshal/unmarshal pair cannot cross a marshal boundary
/// except through a registry.
pub struct OpaqueType {
    pub name: &'static str,
    pub marshal: Option<OpaqueMarshalFn>,
    pub unmarshal: Option<OpaqueUnmarshalFn>,
}

impl fmt::Debug for OpaqueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueType").field("name", &self.name).finish()
    }
}

/// A host-defined opaque value: a raw instance block plus its type.
#[derive(Debug)]
pub struct Opaque {
    pub ty: &'static OpaqueType,
    pub data: Box<[u8]>,
}

/// A host-implemented function. Natives carry no bytecode and have no
/// encoding; they cross a marshal boundary only through a registry.
#[derive(Clone, Copy)]
pub struct NativeFn {
    pub name: &'static str,
    pub fun: fn(&mut Heap, &[Value]) -> Value,
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({})", self.name)
    }
}

/// A function value: a shared definition plus captured environments, one
/// per environment index declared by the definition.
#[derive(Debug, Clone)]
pub struct Closure {
    pub def: GcRef,
    pub envs: Vec<GcRef>,
}

/// A captured lexical frame.
///
/// Either a live window `[offset, offset+length)` into the owning fiber's
/// stack, or a detached vector of cells. `offset == 0` means detached.
#[derive(Debug, Clone)]
pub struct FuncEnv {
    pub offset: i32,
    pub length: i32,
    pub fiber: Option<GcRef>,
    pub values: Vec<Value>,
}

/// A heap-allocated object.
#[derive(Debug)]
pub enum HeapObject {
    Str(Box<[u8]>),
    Symbol(Box<[u8]>),
    Keyword(Box<[u8]>),
    Buffer(Vec<u8>),
    Array(Vec<Value>),
    Tuple(Tuple),
    Table(Table),
    Struct(Struct),
    Opaque(Opaque),
    Native(NativeFn),
    Closure(Closure),
    FuncDef(FuncDef),
    FuncEnv(FuncEnv),
    Fiber(Fiber),
}

impl HeapObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            HeapObject::Str(_) => ObjectKind::Str,
            HeapObject::Symbol(_) => ObjectKind::Symbol,
            HeapObject::Keyword(_) => ObjectKind::Keyword,
            HeapObject::Buffer(_) => ObjectKind::Buffer,
            HeapObject::Array(_) => ObjectKind::Array,
            HeapObject::Tuple(_) => ObjectKind::Tuple,
            HeapObject::Table(_) => ObjectKind::Table,
            HeapObject::Struct(_) => ObjectKind::Struct,
            HeapObject::Opaque(_) => ObjectKind::Opaque,
            HeapObject::Native(_) => ObjectKind::Native,
            HeapObject::Closure(_) => ObjectKind::Closure,
            HeapObject::FuncDef(_) => ObjectKind::FuncDef,
            HeapObject::FuncEnv(_) => ObjectKind::FuncEnv,
            HeapObject::Fiber(_) => ObjectKind::Fiber,
        }
    }
}

/// The object heap: allocator, intern tables, and the opaque type
/// registry.
#[derive(Default)]
pub struct Heap {
    slots: Vec<HeapObject>,
    strings: HashMap<Box<[u8]>, GcRef>,
    symbols: HashMap<Box<[u8]>, GcRef>,
    keywords: HashMap<Box<[u8]>, GcRef>,
    opaque_types: HashMap<&'static str, &'static OpaqueType>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new object and return its handle.
    pub fn alloc(&mut self, obj: HeapObject) -> GcRef {
        let r = GcRef(self.slots.len());
        trace!(kind = obj.kind().name(), handle = r.0, "alloc");
        self.slots.push(obj);
        r
    }

    pub fn get(&self, r: GcRef) -> &HeapObject {
        &self.slots[r.0]
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut HeapObject {
        &mut self.slots[r.0]
    }

    /// Replace the object behind a handle, keeping the handle stable.
    /// Used by the decoder to fill placeholder objects in cyclic graphs.
    pub(crate) fn replace(&mut self, r: GcRef, obj: HeapObject) {
        self.slots[r.0] = obj;
    }

    pub fn kind(&self, r: GcRef) -> ObjectKind {
        self.get(r).kind()
    }

    /// The precise type name of a value, for diagnostics.
    pub fn type_name(&self, v: Value) -> &'static str {
        match v {
            Value::Ref(r) => self.kind(r).name(),
            _ => v.kind_name(),
        }
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Intern an immutable string.
    pub fn string(&mut self, s: impl AsRef<[u8]>) -> GcRef {
        let bytes = s.as_ref();
        if let Some(&r) = self.strings.get(bytes) {
            return r;
        }
        let r = self.alloc(HeapObject::Str(bytes.into()));
        self.strings.insert(bytes.into(), r);
        r
    }

    /// Intern a symbol.
    pub fn symbol(&mut self, s: impl AsRef<[u8]>) -> GcRef {
        let bytes = s.as_ref();
        if let Some(&r) = self.symbols.get(bytes) {
            return r;
        }
        let r = self.alloc(HeapObject::Symbol(bytes.into()));
        self.symbols.insert(bytes.into(), r);
        r
    }

    /// Intern a keyword.
    pub fn keyword(&mut self, s: impl AsRef<[u8]>) -> GcRef {
        let bytes = s.as_ref();
        if let Some(&r) = self.keywords.get(bytes) {
            return r;
        }
        let r = self.alloc(HeapObject::Keyword(bytes.into()));
        self.keywords.insert(bytes.into(), r);
        r
    }

    /// Allocate a fresh mutable buffer. Buffers are never interned.
    pub fn buffer(&mut self, s: impl AsRef<[u8]>) -> GcRef {
        self.alloc(HeapObject::Buffer(s.as_ref().to_vec()))
    }

    pub fn array(&mut self, items: Vec<Value>) -> GcRef {
        self.alloc(HeapObject::Array(items))
    }

    pub fn tuple(&mut self, flag: i32, items: Vec<Value>) -> GcRef {
        self.alloc(HeapObject::Tuple(Tuple {
            flag,
            items: items.into_boxed_slice(),
        }))
    }

    pub fn table(&mut self, proto: Option<GcRef>) -> GcRef {
        self.alloc(HeapObject::Table(Table {
            proto,
            entries: Vec::new(),
        }))
    }

    /// Build an immutable struct from key/value pairs. Nil keys are
    /// dropped and a repeated key replaces the earlier entry.
    pub fn struct_from(&mut self, pairs: Vec<(Value, Value)>) -> GcRef {
        let mut entries: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            if k.is_nil() {
                continue;
            }
            if let Some(i) = entries.iter().position(|(ek, _)| self.values_equal(*ek, k)) {
                entries[i].1 = v;
            } else {
                entries.push((k, v));
            }
        }
        self.alloc(HeapObject::Struct(Struct {
            entries: entries.into_boxed_slice(),
        }))
    }

    /// Allocate a closure. The caller must supply one environment per
    /// environment index declared by the definition.
    pub fn closure(&mut self, def: GcRef, envs: Vec<GcRef>) -> GcRef {
        self.alloc(HeapObject::Closure(Closure { def, envs }))
    }

    pub fn opaque(&mut self, ty: &'static OpaqueType, data: Box<[u8]>) -> GcRef {
        self.alloc(HeapObject::Opaque(Opaque { ty, data }))
    }

    pub fn native(&mut self, f: NativeFn) -> GcRef {
        self.alloc(HeapObject::Native(f))
    }

    /// Allocate a detached function environment owning its cells.
    pub fn funcenv_detached(&mut self, values: Vec<Value>) -> GcRef {
        self.alloc(HeapObject::FuncEnv(FuncEnv {
            offset: 0,
            length: values.len() as i32,
            fiber: None,
            values,
        }))
    }

    /// Allocate a live function environment pointing into a fiber stack.
    pub fn funcenv_live(&mut self, fiber: GcRef, offset: i32, length: i32) -> GcRef {
        self.alloc(HeapObject::FuncEnv(FuncEnv {
            offset,
            length,
            fiber: Some(fiber),
            values: Vec::new(),
        }))
    }

    // ------------------------------------------------------------------
    // Opaque type registry
    // ------------------------------------------------------------------

    pub fn register_opaque_type(&mut self, ty: &'static OpaqueType) {
        self.opaque_types.insert(ty.name, ty);
    }

    pub fn get_opaque_type(&self, name: &[u8]) -> Option<&'static OpaqueType> {
        std::str::from_utf8(name)
            .ok()
            .and_then(|n| self.opaque_types.get(n).copied())
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    /// Bytes of a string, symbol or keyword.
    pub fn str_bytes(&self, r: GcRef) -> Option<&[u8]> {
        match self.get(r) {
            HeapObject::Str(b) | HeapObject::Symbol(b) | HeapObject::Keyword(b) => Some(b),
            _ => None,
        }
    }

    pub fn array_ref(&self, r: GcRef) -> Option<&Vec<Value>> {
        match self.get(r) {
            HeapObject::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn array_mut(&mut self, r: GcRef) -> Option<&mut Vec<Value>> {
        match self.get_mut(r) {
            HeapObject::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn table_ref(&self, r: GcRef) -> Option<&Table> {
        match self.get(r) {
            HeapObject::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn table_mut(&mut self, r: GcRef) -> Option<&mut Table> {
        match self.get_mut(r) {
            HeapObject::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn tuple_ref(&self, r: GcRef) -> Option<&Tuple> {
        match self.get(r) {
            HeapObject::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn struct_ref(&self, r: GcRef) -> Option<&Struct> {
        match self.get(r) {
            HeapObject::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn closure_ref(&self, r: GcRef) -> Option<&Closure> {
        match self.get(r) {
            HeapObject::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn closure_mut(&mut self, r: GcRef) -> Option<&mut Closure> {
        match self.get_mut(r) {
            HeapObject::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn def_ref(&self, r: GcRef) -> Option<&FuncDef> {
        match self.get(r) {
            HeapObject::FuncDef(d) => Some(d),
            _ => None,
        }
    }

    pub fn env_ref(&self, r: GcRef) -> Option<&FuncEnv> {
        match self.get(r) {
            HeapObject::FuncEnv(e) => Some(e),
            _ => None,
        }
    }

    pub fn env_mut(&mut self, r: GcRef) -> Option<&mut FuncEnv> {
        match self.get_mut(r) {
            HeapObject::FuncEnv(e) => Some(e),
            _ => None,
        }
    }

    pub fn fiber_ref(&self, r: GcRef) -> Option<&Fiber> {
        match self.get(r) {
            HeapObject::Fiber(f) => Some(f),
            _ => None,
        }
    }

    pub fn fiber_mut(&mut self, r: GcRef) -> Option<&mut Fiber> {
        match self.get_mut(r) {
            HeapObject::Fiber(f) => Some(f),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Value operations
    // ------------------------------------------------------------------

    /// Structural value equality.
    ///
    /// Mutable containers compare by identity. Strings, symbols and
    /// keywords compare by content (with interning this coincides with
    /// identity); tuples and structs compare element-wise. Numbers
    /// compare across the two representations.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(_), _) | (Value::Float(_), _) => a.number_eq(&b),
            (Value::Ref(x), Value::Ref(y)) => {
                if x == y {
                    return true;
                }
                match (self.get(x), self.get(y)) {
                    (HeapObject::Str(p), HeapObject::Str(q)) => p == q,
                    (HeapObject::Symbol(p), HeapObject::Symbol(q)) => p == q,
                    (HeapObject::Keyword(p), HeapObject::Keyword(q)) => p == q,
                    (HeapObject::Tuple(p), HeapObject::Tuple(q)) => {
                        p.items.len() == q.items.len()
                            && p.items
                                .iter()
                                .zip(q.items.iter())
                                .all(|(l, r)| self.values_equal(*l, *r))
                    }
                    (HeapObject::Struct(p), HeapObject::Struct(q)) => {
                        p.len() == q.len()
                            && p.entries().iter().all(|(k, v)| {
                                q.entries()
                                    .iter()
                                    .any(|(qk, qv)| {
                                        self.values_equal(*k, *qk) && self.values_equal(*v, *qv)
                                    })
                            })
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Look up a key in a table, following the prototype chain.
    pub fn table_get(&self, table: GcRef, key: Value) -> Value {
        let mut current = Some(table);
        let mut depth = 0;
        while let Some(r) = current {
            if depth > MAX_PROTO_DEPTH {
                break;
            }
            let Some(t) = self.table_ref(r) else { break };
            for (k, v) in t.entries() {
                if self.values_equal(*k, key) {
                    return *v;
                }
            }
            current = t.proto;
            depth += 1;
        }
        Value::Nil
    }

    /// Insert into a table. Nil keys are ignored; a nil value deletes the
    /// entry. Does nothing if the handle is not a table.
    pub fn table_put(&mut self, table: GcRef, key: Value, value: Value) {
        if key.is_nil() {
            return;
        }
        let pos = match self.table_ref(table) {
            Some(t) => t
                .entries
                .iter()
                .position(|(k, _)| self.values_equal(*k, key)),
            None => return,
        };
        let Some(t) = self.table_mut(table) else { return };
        match (pos, value) {
            (Some(i), Value::Nil) => {
                t.entries.remove(i);
            }
            (Some(i), v) => t.entries[i].1 = v,
            (None, Value::Nil) => {}
            (None, v) => t.entries.push((key, v)),
        }
    }

    /// Look up a key in a struct.
    pub fn struct_get(&self, s: GcRef, key: Value) -> Value {
        let Some(st) = self.struct_ref(s) else {
            return Value::Nil;
        };
        for (k, v) in st.entries() {
            if self.values_equal(*k, key) {
                return *v;
            }
        }
        Value::Nil
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning() {
        let mut heap = Heap::new();
        let a = heap.string("hello");
        let b = heap.string("hello");
        let c = heap.string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Symbols and keywords intern in separate namespaces
        let s = heap.symbol("hello");
        let k = heap.keyword("hello");
        assert_ne!(a, s);
        assert_ne!(s, k);
        assert_eq!(heap.symbol("hello"), s);
    }

    #[test]
    fn test_buffers_not_interned() {
        let mut heap = Heap::new();
        let a = heap.buffer("data");
        let b = heap.buffer("data");
        assert_ne!(a, b);
    }

    #[test]
    fn test_table_put_get() {
        let mut heap = Heap::new();
        let t = heap.table(None);
        let key = heap.keyword("name");
        heap.table_put(t, Value::Ref(key), Value::Int(1));
        assert_eq!(heap.table_get(t, Value::Ref(key)), Value::Int(1));

        // Overwrite
        heap.table_put(t, Value::Ref(key), Value::Int(2));
        assert_eq!(heap.table_get(t, Value::Ref(key)), Value::Int(2));
        assert_eq!(heap.table_ref(t).unwrap().len(), 1);

        // Nil value deletes
        heap.table_put(t, Value::Ref(key), Value::Nil);
        assert_eq!(heap.table_get(t, Value::Ref(key)), Value::Nil);
        assert!(heap.table_ref(t).unwrap().is_empty());

        // Nil key ignored
        heap.table_put(t, Value::Nil, Value::Int(3));
        assert!(heap.table_ref(t).unwrap().is_empty());
    }

    #[test]
    fn test_table_proto_chain() {
        let mut heap = Heap::new();
        let proto = heap.table(None);
        let t = heap.table(Some(proto));
        let key = heap.symbol("x");
        heap.table_put(proto, Value::Ref(key), Value::Int(42));
        assert_eq!(heap.table_get(t, Value::Ref(key)), Value::Int(42));

        // Shadowing in the child wins
        heap.table_put(t, Value::Ref(key), Value::Int(1));
        assert_eq!(heap.table_get(t, Value::Ref(key)), Value::Int(1));
    }

    #[test]
    fn test_cyclic_proto_chain_terminates() {
        let mut heap = Heap::new();
        let a = heap.table(None);
        let b = heap.table(Some(a));
        heap.table_mut(a).unwrap().proto = Some(b);
        let key = heap.symbol("missing");
        assert_eq!(heap.table_get(a, Value::Ref(key)), Value::Nil);
    }

    #[test]
    fn test_values_equal() {
        let mut heap = Heap::new();
        assert!(heap.values_equal(Value::Int(1), Value::Float(1.0)));

        let t1 = {
            let s = heap.string("x");
            heap.tuple(0, vec![Value::Int(1), Value::Ref(s)])
        };
        let t2 = {
            let s = heap.string("x");
            heap.tuple(0, vec![Value::Int(1), Value::Ref(s)])
        };
        assert!(heap.values_equal(Value::Ref(t1), Value::Ref(t2)));

        // Mutable containers compare by identity
        let a1 = heap.array(vec![Value::Int(1)]);
        let a2 = heap.array(vec![Value::Int(1)]);
        assert!(!heap.values_equal(Value::Ref(a1), Value::Ref(a2)));
        assert!(heap.values_equal(Value::Ref(a1), Value::Ref(a1)));
    }

    #[test]
    fn test_struct_get() {
        let mut heap = Heap::new();
        let k = heap.keyword("value");
        let s = heap.struct_from(vec![
            (Value::Ref(k), Value::Int(9)),
            (Value::Nil, Value::Int(1)),
        ]);
        assert_eq!(heap.struct_ref(s).unwrap().len(), 1);
        assert_eq!(heap.struct_get(s, Value::Ref(k)), Value::Int(9));
    }
}
