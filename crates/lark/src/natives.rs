//! Native functions installed into the global table at startup.
//!
//! Natives have no structured error channel; by convention a native that
//! cannot produce a meaningful result returns nil.

use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;

/// `clock()` — seconds since the interpreter started.
pub fn clock(vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Number(vm.uptime().as_secs_f64())
}

/// `len(x)` — length of a list; nil for anything else.
pub fn len(vm: &mut Vm, args: &[Value]) -> Value {
    match args.first() {
        Some(Value::Obj(r)) => match vm.heap().get(*r) {
            Obj::List(list) => Value::Number(list.items.len() as f64),
            _ => Value::Nil,
        },
        _ => Value::Nil,
    }
}

/// `gc()` — force a full collection.
pub fn gc(vm: &mut Vm, _args: &[Value]) -> Value {
    vm.collect_garbage(&[], None);
    Value::Nil
}
