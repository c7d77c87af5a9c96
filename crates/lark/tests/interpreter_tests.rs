use lark::Interpreter;
use pretty_assertions::assert_eq;

/// Run a program and return everything it printed.
fn run(source: &str) -> String {
    let mut interpreter = Interpreter::new();
    interpreter.capture_output();
    interpreter
        .interpret(source)
        .expect("program should run cleanly");
    interpreter.take_output()
}

#[test]
fn arithmetic_and_grouping() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run("print 5 * (3 + 2) == 25;"), "true\n");
    assert_eq!(run("print 10 / 4;"), "2.5\n");
    assert_eq!(run("print -3 + 1;"), "-2\n");
}

#[test]
fn power_is_right_associative_and_binds_above_unary() {
    assert_eq!(run("print 2 ^ 10;"), "1024\n");
    assert_eq!(run("print 2 ^ 3 ^ 2;"), "512\n");
    assert_eq!(run("print -2 ^ 2;"), "-4\n");
}

#[test]
fn comparison_and_equality() {
    assert_eq!(run("print 1 < 2;"), "true\n");
    assert_eq!(run("print 2 <= 2;"), "true\n");
    assert_eq!(run("print 3 >= 4;"), "false\n");
    assert_eq!(run("print 1 != 2;"), "true\n");
    assert_eq!(run("print nil == nil;"), "true\n");
    assert_eq!(run("print \"a\" == \"a\";"), "true\n");
    assert_eq!(run("print \"a\" + \"b\" == \"ab\";"), "true\n");
    // lists compare by identity
    assert_eq!(run("print [] == [];"), "false\n");
}

#[test]
fn truthiness() {
    assert_eq!(run("print !nil;"), "true\n");
    assert_eq!(run("print !false;"), "true\n");
    assert_eq!(run("print !0;"), "false\n");
    assert_eq!(run("print !\"\";"), "false\n");
}

#[test]
fn string_concatenation_stringifies_numbers() {
    assert_eq!(run("print \"a\" + 1;"), "a1\n");
    assert_eq!(run("print 2 + \"b\";"), "2b\n");
    assert_eq!(run("print \"半\" + \"角\";"), "半角\n");
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(run("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(run("print false and 1;"), "false\n");
    assert_eq!(run("print 0 and 1;"), "1\n");
    assert_eq!(
        run("fun boom() { return 1 + nil; } print false and boom();"),
        "false\n"
    );
}

#[test]
fn ternary_and_comma() {
    assert_eq!(run("print true ? 1 : 2;"), "1\n");
    assert_eq!(run("print false ? 1 : 2;"), "2\n");
    assert_eq!(run("print 1 < 2 ? 1 < 1 ? \"a\" : \"b\" : \"c\";"), "b\n");
    assert_eq!(run("print (1, 2, 3);"), "3\n");
}

#[test]
fn assignment_binds_tighter_than_comma() {
    // `x = 1, 2` assigns 1; the comma operator then discards it
    assert_eq!(run("var g = 0; g = 1, 2; print g;"), "1\n");
    assert_eq!(run("{ var a = 0; a = 1, 2; print a; }"), "1\n");
    assert_eq!(run("class C {} var c = C(); c.f = 1, 2; print c.f;"), "1\n");
    assert_eq!(run("var l = [0]; l[0] = 1, 2; print l[0];"), "1\n");
}

#[test]
fn global_and_local_scoping() {
    assert_eq!(
        run("var x = \"global\"; { var x = \"local\"; print x; } print x;"),
        "local\nglobal\n"
    );
    assert_eq!(run("var a = 1; a = a + 1; print a;"), "2\n");
}

#[test]
fn if_else_branches() {
    assert_eq!(run("if (1 < 2) print \"then\"; else print \"else\";"), "then\n");
    assert_eq!(run("if (nil) print \"then\"; else print \"else\";"), "else\n");
}

#[test]
fn while_loop_with_continue() {
    let source = "
var i = 0;
var hits = 0;
while (i < 5) {
  i = i + 1;
  if (i == 2) continue;
  hits = hits + 1;
}
print hits;
";
    assert_eq!(run(source), "4\n");
}

#[test]
fn for_loop_with_break_and_continue() {
    let source = "
var total = 0;
for (var i = 0; i < 10; i = i + 1) {
  if (i == 3) continue;
  if (i == 8) break;
  total = total + i;
}
print total;
";
    assert_eq!(run(source), "25\n");
}

#[test]
fn for_loop_without_clauses() {
    let source = "
var i = 0;
for (;;) {
  i = i + 1;
  if (i == 3) break;
}
print i;
";
    assert_eq!(run(source), "3\n");
}

#[test]
fn functions_return_values() {
    let source = "
fun add(a, b) { return a + b; }
print add(1, 2);
print add;
";
    assert_eq!(run(source), "3\n<fn add>\n");
}

#[test]
fn recursion() {
    let source = "
fun fib(n) {
  if (n < 2) return n;
  return fib(n - 1) + fib(n - 2);
}
print fib(10);
";
    assert_eq!(run(source), "55\n");
}

#[test]
fn function_without_return_yields_nil() {
    assert_eq!(run("fun noop() {} print noop();"), "nil\n");
}

#[test]
fn anonymous_function_expressions() {
    assert_eq!(run("var double = fun(n) { return n * 2; }; print double(21);"), "42\n");
    assert_eq!(run("print fun(n) { return n + 1; }(41);"), "42\n");
}

#[test]
fn closure_counter_accumulates() {
    let source = "
fun make() {
  var x = 0;
  fun inc() {
    x = x + 1;
    return x;
  }
  return inc;
}
var f = make();
f();
f();
print f();
";
    assert_eq!(run(source), "3\n");
}

#[test]
fn closures_share_one_captured_cell() {
    let source = "
fun pair() {
  var value = 0;
  return [fun(v) { value = v; }, fun() { return value; }];
}
var fns = pair();
var set = fns[0];
var get = fns[1];
set(42);
print get();
";
    assert_eq!(run(source), "42\n");
}

#[test]
fn upvalues_close_when_scope_ends() {
    let source = "
var make;
{
  var local = \"captured\";
  fun get() { return local; }
  make = get;
}
print make();
";
    assert_eq!(run(source), "captured\n");
}

#[test]
fn transitive_capture_through_nested_functions() {
    let source = "
fun outer() {
  var x = \"x\";
  fun middle() {
    fun inner() { return x; }
    return inner;
  }
  return middle;
}
print outer()()();
";
    assert_eq!(run(source), "x\n");
}

#[test]
fn class_init_and_methods() {
    let source = "
class A {
  init(x) { this.x = x; }
  get() { return this.x; }
}
print A(7).get();
print A(7).get() == 7;
";
    assert_eq!(run(source), "7\ntrue\n");
}

#[test]
fn instances_print_with_their_class_name() {
    let source = "
class Point {}
print Point;
print Point();
";
    assert_eq!(run(source), "Point\nPoint instance\n");
}

#[test]
fn bare_return_in_initializer_still_yields_the_instance() {
    let source = "
class C {
  init() {
    this.x = 1;
    return;
  }
}
var c = C();
print c.x;
print C();
";
    assert_eq!(run(source), "1\nC instance\n");
}

#[test]
fn fields_shadow_methods() {
    let source = "
class A {
  m() { return \"method\"; }
}
var a = A();
print a.m();
a.m = fun() { return \"field\"; };
print a.m();
";
    assert_eq!(run(source), "method\nfield\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let source = "
class A {
  init() { this.name = \"left\"; }
  who() { return this.name; }
}
var a = A();
var m = a.who;
print m();
print a.who;
";
    assert_eq!(run(source), "left\n<fn who>\n");
}

#[test]
fn inheritance_override_and_super() {
    let source = "
class A {
  m() { return 1; }
}
class B < A {
  m() { return super.m() + 10; }
}
print B().m();
";
    assert_eq!(run(source), "11\n");
}

#[test]
fn inherited_methods_are_callable_directly() {
    let source = "
class A {
  hello() { return \"hi\"; }
}
class B < A {}
print B().hello();
";
    assert_eq!(run(source), "hi\n");
}

#[test]
fn getters_run_on_property_access() {
    let source = "
class Circle {
  init(r) { this.r = r; }
  area {
    return 3 * this.r * this.r;
  }
}
print Circle(2).area;
";
    assert_eq!(run(source), "12\n");
}

#[test]
fn super_getter_runs_on_access() {
    let source = "
class A {
  tag { return \"a\"; }
}
class B < A {
  tag { return super.tag + \"b\"; }
}
print B().tag;
";
    assert_eq!(run(source), "ab\n");
}

#[test]
fn list_literals_subscripts_and_mutation() {
    let source = "
var l = [1, 2, 3];
l[1] = 9;
print l[1];
print len(l);
print l;
";
    assert_eq!(run(source), "9\n3\n<list : 3>\n");
}

#[test]
fn list_elements_can_be_any_value() {
    let source = "
fun f() { return \"fn\"; }
var l = [f, \"two\", 3];
print l[0]();
print l[2] + 1;
";
    assert_eq!(run(source), "fn\n4\n");
}

#[test]
fn subscript_assignment_is_an_expression() {
    assert_eq!(run("var l = [0]; print l[0] = 5;"), "5\n");
}

#[test]
fn natives_clock_len_gc() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
    assert_eq!(run("print clock;"), "<native fn>\n");
    assert_eq!(run("print len([1, 2, 3]);"), "3\n");
    assert_eq!(run("print len(\"not a list\");"), "nil\n");
    assert_eq!(run("print gc();"), "nil\n");
}

#[test]
fn print_formats_every_kind_of_value() {
    assert_eq!(run("print nil;"), "nil\n");
    assert_eq!(run("print true;"), "true\n");
    assert_eq!(run("print 2.5;"), "2.5\n");
    assert_eq!(run("print 100;"), "100\n");
    assert_eq!(run("print \"text\";"), "text\n");
    assert_eq!(run("fun f() {} print f;"), "<fn f>\n");
    assert_eq!(run("print [1, [2]];"), "<list : 2>\n");
}

#[test]
fn globals_persist_across_interpret_calls() {
    let mut interpreter = Interpreter::new();
    interpreter.capture_output();
    interpreter.interpret("var shared = 41;").unwrap();
    interpreter.interpret("shared = shared + 1;").unwrap();
    interpreter.interpret("print shared;").unwrap();
    assert_eq!(interpreter.take_output(), "42\n");
}

#[test]
fn vm_recovers_after_a_runtime_error() {
    let mut interpreter = Interpreter::new();
    interpreter.capture_output();
    assert!(interpreter.interpret("print missing;").is_err());
    interpreter.interpret("print \"still alive\";").unwrap();
    assert_eq!(interpreter.take_output(), "still alive\n");
}

#[test]
fn constant_pool_spills_into_long_form() {
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("print {};\n", i));
    }
    let expected: String = (0..300).map(|i| format!("{}\n", i)).collect();
    assert_eq!(run(&source), expected);
}

#[test]
fn globals_beyond_the_short_operand_range() {
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("var g{} = {};\n", i, i));
    }
    source.push_str("print g0 + g299;\n");
    assert_eq!(run(&source), "299\n");
}
