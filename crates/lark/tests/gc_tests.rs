//! Collector behavior under stress mode, where every allocation runs a
//! full collection. Any missing root shows up here as a use-after-free
//! level bug: a wrong value, a bad method lookup, a corrupted string.

use lark::{Interpreter, Options};
use pretty_assertions::assert_eq;

fn run_stressed(source: &str) -> String {
    let mut interpreter = Interpreter::with_options(Options {
        stress_gc: true,
        ..Options::default()
    });
    interpreter.capture_output();
    interpreter
        .interpret(source)
        .expect("program should survive stress collection");
    interpreter.take_output()
}

#[test]
fn string_building_survives_collection() {
    let source = "
var s = \"\";
for (var i = 0; i < 10; i = i + 1) {
  s = s + \"x\";
}
print s;
print len([1, 2, 3]);
";
    assert_eq!(run_stressed(source), "xxxxxxxxxx\n3\n");
}

#[test]
fn interning_still_holds_under_stress() {
    assert_eq!(run_stressed("print \"a\" + \"b\" == \"ab\";"), "true\n");
}

#[test]
fn classes_and_instances_survive_collection() {
    let source = "
class Node {
  init(value) {
    this.value = value;
    this.next = nil;
  }
}
var head = Node(0);
var cursor = head;
for (var i = 1; i < 20; i = i + 1) {
  cursor.next = Node(i);
  cursor = cursor.next;
}
var total = 0;
cursor = head;
while (cursor != nil) {
  total = total + cursor.value;
  cursor = cursor.next;
}
print total;
";
    assert_eq!(run_stressed(source), "190\n");
}

#[test]
fn closures_and_upvalues_survive_collection() {
    let source = "
fun make(base) {
  var total = base;
  fun add(n) {
    total = total + n;
    return total;
  }
  return add;
}
var add = make(100);
add(1);
add(2);
print add(3);
";
    assert_eq!(run_stressed(source), "106\n");
}

#[test]
fn methods_resolve_after_inherit_under_stress() {
    let source = "
class A {
  hello() { return \"hello \" + this.name(); }
  name() { return \"a\"; }
}
class B < A {
  name() { return \"b\"; }
}
print B().hello();
";
    assert_eq!(run_stressed(source), "hello b\n");
}

#[test]
fn forced_collection_is_reentrant_with_live_data() {
    let source = "
var keep = [1, 2, 3];
gc();
gc();
print keep[2] + len(keep);
";
    assert_eq!(run_stressed(source), "6\n");
}

#[test]
fn unreachable_cycles_do_not_break_later_work() {
    // instances pointing at each other die together once unrooted
    let source = "
fun tie() {
  class Pair {}
  var a = Pair();
  var b = Pair();
  a.other = b;
  b.other = a;
}
tie();
gc();
print \"after\";
";
    assert_eq!(run_stressed(source), "after\n");
}
