//! The garbage-collected object heap.
//!
//! Objects live in a slot arena with stable indices and are threaded onto
//! an intrusive all-objects list that the sweep phase walks. Collection
//! is a non-moving tricolor mark-sweep: the VM marks the roots it owns
//! (stack, frames, globals, open upvalues, compiler chain), the gray work
//! list is traced here, the interned-string table drops entries whose key
//! was never marked, and sweep frees everything still white.
//!
//! The heap tracks an approximate byte count per object, charged at
//! allocation and refunded at free. Crossing `next_gc` (or every
//! allocation under stress mode) asks the owner to collect.

use tracing::{debug, trace};

use crate::object::{Class, Closure, Function, Obj, ObjRef, Upvalue, UpvalueState};
use crate::table::{Entry, Table};
use crate::value::Value;

/// First collection threshold; doubles from live bytes afterwards.
const FIRST_GC: usize = 256 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

struct Slot {
    marked: bool,
    /// Next entry on the all-objects list.
    next: Option<ObjRef>,
    /// Bytes charged when this object was allocated.
    size: usize,
    obj: Obj,
}

pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Head of the all-objects list (most recent allocation first).
    head: Option<ObjRef>,
    /// Marked but not yet traced.
    gray: Vec<ObjRef>,
    /// Weak interning table: string → nil, cleared of dead keys each
    /// collection before sweep.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect on every allocation; shakes out rooting bugs.
    pub stress: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            gray: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            stress: false,
        }
    }

    /// Link a new object into the arena and the all-objects list.
    ///
    /// Never collects; the owner checks [`Heap::should_collect`] *before*
    /// building the object so that everything the object refers to is
    /// still rooted when the collector runs.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj_size(&obj);
        self.bytes_allocated += size;
        let slot = Slot {
            marked: false,
            next: self.head,
            size,
            obj,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };
        let r = ObjRef(index);
        self.head = Some(r);
        trace!(target: "lark::gc", slot = index, kind = self.get(r).kind_name(), "allocate");
        r
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // -----------------------------------------------------------------------
    // Typed accessors
    // -----------------------------------------------------------------------

    fn slot(&self, r: ObjRef) -> &Slot {
        self.slots[r.0 as usize].as_ref().unwrap()
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut Slot {
        self.slots[r.0 as usize].as_mut().unwrap()
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.slot(r).obj
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.slot_mut(r).obj
    }

    pub fn string(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::String(s) => &s.chars,
            _ => unreachable!("expected string"),
        }
    }

    pub fn string_hash(&self, r: ObjRef) -> u32 {
        match self.get(r) {
            Obj::String(s) => s.hash,
            _ => unreachable!("expected string"),
        }
    }

    /// Like [`Heap::string`] but without the kind invariant.
    pub fn as_string(&self, r: ObjRef) -> Option<&str> {
        match self.get(r) {
            Obj::String(s) => Some(&s.chars),
            _ => None,
        }
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!("expected function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => unreachable!("expected class"),
        }
    }

    // -----------------------------------------------------------------------
    // Display
    // -----------------------------------------------------------------------

    /// Render a value the way `print` does.
    pub fn render_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => crate::value::format_number(n, 6),
            Value::Obj(r) => self.render_object(r),
        }
    }

    fn render_object(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::String(s) => s.chars.to_string(),
            Obj::Function(f) => self.render_function(f),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(c) => self.render_function(self.function(c.function)),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.string(c.name).to_string(),
            Obj::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name))
            }
            Obj::BoundMethod(b) => {
                self.render_function(self.function(self.closure(b.method).function))
            }
            Obj::List(l) => format!("<list : {}>", l.items.len()),
        }
    }

    fn render_function(&self, function: &Function) -> String {
        match function.name {
            Some(name) => format!("<fn {}>", self.string(name)),
            None => "<script>".to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // String interning
    // -----------------------------------------------------------------------

    /// Look up an interned string by content without allocating.
    pub fn find_interned(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.strings.count == 0 {
            return None;
        }
        let mask = self.strings.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.strings.entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && self.string(key) == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Record a freshly allocated string in the interning table.
    pub(crate) fn record_interned(&mut self, r: ObjRef) {
        let hash = self.string_hash(r);
        self.strings.set(r, hash, Value::Nil);
    }

    // -----------------------------------------------------------------------
    // Mark phase
    // -----------------------------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = self.slot_mut(r);
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    // -----------------------------------------------------------------------
    // Trace phase
    // -----------------------------------------------------------------------

    /// Blacken gray objects until the work list runs dry.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        // Gather outgoing references first; marking mutates the arena.
        let mut children: Vec<Value> = Vec::new();
        match self.get(r) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend(f.chunk.constants.iter().copied());
            }
            Obj::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|&upvalue| Value::Obj(upvalue)));
            }
            Obj::Upvalue(u) => {
                if let UpvalueState::Closed(value) = u.state {
                    children.push(value);
                }
            }
            Obj::Class(c) => {
                children.push(Value::Obj(c.name));
                children.extend(
                    c.methods
                        .iter()
                        .flat_map(|(key, value)| [Value::Obj(key), value]),
                );
            }
            Obj::Instance(i) => {
                children.push(Value::Obj(i.class));
                children.extend(
                    i.fields
                        .iter()
                        .flat_map(|(key, value)| [Value::Obj(key), value]),
                );
            }
            Obj::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::Obj(b.method));
            }
            Obj::List(l) => children.extend(l.items.iter().copied()),
        }
        for child in children {
            self.mark_value(child);
        }
    }

    // -----------------------------------------------------------------------
    // Sweep phase
    // -----------------------------------------------------------------------

    /// Drop interning entries whose strings were not marked. Runs between
    /// trace and sweep, while the dead keys can still be read.
    pub fn remove_white_strings(&mut self) {
        for index in 0..self.strings.entries.len() {
            let entry = self.strings.entries[index];
            if let Some(key) = entry.key {
                if !self.slot(key).marked {
                    self.strings.entries[index] = Entry::TOMBSTONE;
                }
            }
        }
    }

    /// Walk the all-objects list, unmarking survivors and freeing the
    /// rest.
    pub fn sweep(&mut self) {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.head;
        while let Some(r) = current {
            if self.slot(r).marked {
                self.slot_mut(r).marked = false;
                previous = Some(r);
                current = self.slot(r).next;
            } else {
                let next = self.slot(r).next;
                match previous {
                    Some(p) => self.slot_mut(p).next = next,
                    None => self.head = next,
                }
                self.free_object(r);
                current = next;
            }
        }
    }

    fn free_object(&mut self, r: ObjRef) {
        let slot = self.slots[r.0 as usize].take().unwrap();
        self.bytes_allocated -= slot.size;
        trace!(target: "lark::gc", slot = r.0, kind = slot.obj.kind_name(), "free");
        self.free.push(r.0);
    }

    /// Reschedule the next collection; `before` is the byte count when
    /// the collection started.
    pub fn finish_collection(&mut self, before: usize) {
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        debug!(
            target: "lark::gc",
            collected = before.saturating_sub(self.bytes_allocated),
            live = self.bytes_allocated,
            next = self.next_gc,
            "gc end"
        );
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Approximate footprint charged against the collection threshold.
fn obj_size(obj: &Obj) -> usize {
    use std::mem::size_of;
    let payload = match obj {
        Obj::String(s) => s.chars.len(),
        Obj::Function(f) => {
            f.chunk.code.len() + f.chunk.constants.len() * size_of::<Value>()
        }
        Obj::Closure(c) => c.upvalues.capacity() * size_of::<ObjRef>(),
        Obj::Class(c) => c.methods.entries.len() * size_of::<Entry>(),
        Obj::Instance(i) => i.fields.entries.len() * size_of::<Entry>(),
        Obj::List(l) => l.items.capacity() * size_of::<Value>(),
        Obj::Native(_) | Obj::Upvalue(_) | Obj::BoundMethod(_) => 0,
    };
    size_of::<Slot>() + payload
}
