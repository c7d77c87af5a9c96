use lark::{Error, Interpreter};

fn compile_errors(source: &str) -> Vec<String> {
    let mut interpreter = Interpreter::new();
    interpreter.capture_output();
    match interpreter.interpret(source) {
        Err(Error::Compile(errors)) => errors,
        other => panic!("expected a compile error, got {:?}", other.err()),
    }
}

fn runtime_error(source: &str) -> (String, Vec<String>) {
    let mut interpreter = Interpreter::new();
    interpreter.capture_output();
    match interpreter.interpret(source) {
        Err(Error::Runtime { message, trace }) => (message, trace),
        other => panic!("expected a runtime error, got {:?}", other.err()),
    }
}

// ---------------------------------------------------------------------------
// Compile-time diagnostics
// ---------------------------------------------------------------------------

#[test]
fn missing_expression_reports_the_offending_lexeme() {
    let errors = compile_errors("1 +;");
    assert_eq!(errors, vec!["[line 1] Error at ';': Expect expression."]);
}

#[test]
fn error_at_end_of_input() {
    let errors = compile_errors("print 1");
    assert_eq!(errors, vec!["[line 1] Error at end: Expect ';' after value."]);
}

#[test]
fn invalid_assignment_target() {
    let errors = compile_errors("1 = 2;");
    assert_eq!(errors, vec!["[line 1] Error at '=': Invalid assignment target."]);
}

#[test]
fn reading_a_local_in_its_own_initializer() {
    let errors = compile_errors("{ var a = a; }");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'a': Can't read variable in its own initializer."]
    );
}

#[test]
fn duplicate_local_declaration() {
    let errors = compile_errors("{ var a = 1; var a = 2; }");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'a': Variable with this name already declared in this scope."]
    );
}

#[test]
fn return_outside_a_function() {
    let errors = compile_errors("return 1;");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'return': Can't return from top-level code."]
    );
}

#[test]
fn returning_a_value_from_an_initializer() {
    let errors = compile_errors("class C { init() { return 1; } }");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'return': Can't return a value from an initializer."]
    );
}

#[test]
fn this_and_super_need_a_class() {
    let errors = compile_errors("print this;");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'this': Can't use 'this' outside of a class."]
    );
    let errors = compile_errors("print super.m;");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'super': Can't use 'super' outside of a class."]
    );
    let errors = compile_errors("class A { m() { return super.m; } }");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'super': Can't use 'super' in a class with no superclass."]
    );
}

#[test]
fn a_class_cannot_inherit_from_itself() {
    let errors = compile_errors("class A < A {}");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'A': A class can't inherit from itself."]
    );
}

#[test]
fn break_and_continue_need_a_loop() {
    let errors = compile_errors("break;");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'break': Can't use 'break' outside of a loop."]
    );
    let errors = compile_errors("continue;");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'continue': Can't use 'continue' outside of a loop."]
    );
}

#[test]
fn scanner_diagnostics_surface_through_the_compiler() {
    let errors = compile_errors("var s = \"unterminated;");
    assert_eq!(errors, vec!["[line 1] Error: Unterminated string."]);
    let errors = compile_errors("var x = @;");
    assert_eq!(errors, vec!["[line 1] Error: Unexpected character."]);
}

#[test]
fn panic_mode_resynchronizes_at_statement_boundaries() {
    let errors = compile_errors("var = 1;\nprint nil nil;\n");
    assert_eq!(
        errors,
        vec![
            "[line 1] Error at '=': Expect variable name.",
            "[line 2] Error at 'nil': Expect ';' after value.",
        ]
    );
}

#[test]
fn too_many_parameters() {
    let mut params = Vec::new();
    for i in 0..256 {
        params.push(format!("p{}", i));
    }
    let source = format!("fun f({}) {{}}", params.join(", "));
    let errors = compile_errors(&source);
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'p255': Can't have more than 255 parameters."]
    );
}

#[test]
fn too_many_arguments() {
    let args = vec!["0"; 256].join(", ");
    let source = format!("fun f() {{}} f({});", args);
    let errors = compile_errors(&source);
    assert_eq!(
        errors,
        vec!["[line 1] Error at '0': Can't have more than 255 arguments."]
    );
}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

#[test]
fn undefined_variable_read() {
    let (message, trace) = runtime_error("print missing;");
    assert_eq!(message, "Undefined variable 'missing'.");
    assert_eq!(trace, vec!["script line 1"]);
}

#[test]
fn assignment_does_not_create_globals() {
    let mut interpreter = Interpreter::new();
    interpreter.capture_output();
    assert!(interpreter.interpret("ghost = 1;").is_err());
    // the failed assignment must not have defined the name
    match interpreter.interpret("print ghost;") {
        Err(Error::Runtime { message, .. }) => {
            assert_eq!(message, "Undefined variable 'ghost'.");
        }
        other => panic!("expected a runtime error, got {:?}", other.err()),
    }
}

#[test]
fn arithmetic_type_errors() {
    let (message, _) = runtime_error("print 1 - \"one\";");
    assert_eq!(message, "Operands must be numbers.");
    let (message, _) = runtime_error("print 2 ^ nil;");
    assert_eq!(message, "Operands must be numbers.");
    let (message, _) = runtime_error("print -\"negative\";");
    assert_eq!(message, "Operand must be a number.");
    let (message, _) = runtime_error("print true + 1;");
    assert_eq!(message, "Operands must be two numbers or two strings.");
}

#[test]
fn calling_a_non_callable() {
    let (message, _) = runtime_error("var x = 1; x();");
    assert_eq!(message, "Can only call functions and classes.");
}

#[test]
fn arity_mismatch() {
    let (message, _) = runtime_error("fun f(a) {} f(1, 2);");
    assert_eq!(message, "Expected 1 arguments but got 2.");
    let (message, _) = runtime_error("class A {} A(1);");
    assert_eq!(message, "Expected 0 arguments but got 1.");
    let (message, _) = runtime_error("class A { init(x, y) {} } A(1);");
    assert_eq!(message, "Expected 2 arguments but got 1.");
}

#[test]
fn property_access_requires_instances() {
    let (message, _) = runtime_error("var x = 1; print x.field;");
    assert_eq!(message, "Only instances have properties.");
    let (message, _) = runtime_error("var x = 1; x.field = 2;");
    assert_eq!(message, "Only instances have fields.");
    let (message, _) = runtime_error("var x = 1; x.m();");
    assert_eq!(message, "Only instances have methods.");
}

#[test]
fn undefined_property() {
    let (message, _) = runtime_error("class A {} print A().missing;");
    assert_eq!(message, "Undefined property 'missing'.");
    let (message, _) = runtime_error("class A {} A().missing();");
    assert_eq!(message, "Undefined property 'missing'.");
}

#[test]
fn superclass_must_be_a_class() {
    let (message, _) = runtime_error("var NotAClass = 1; class B < NotAClass {}");
    assert_eq!(message, "Superclass must be a class.");
}

#[test]
fn list_index_errors() {
    let (message, _) = runtime_error("var l = [1]; print l[5];");
    assert_eq!(message, "Index out of bounds.");
    let (message, _) = runtime_error("var l = [1]; l[0 - 1] = 2;");
    assert_eq!(message, "Index out of bounds.");
    let (message, _) = runtime_error("var l = [1]; print l[\"zero\"];");
    assert_eq!(message, "List index must be a number.");
    let (message, _) = runtime_error("var notalist = 1; print notalist[0];");
    assert_eq!(message, "Can only subscript lists.");
}

#[test]
fn backtrace_lists_frames_innermost_first() {
    let source = "fun inner() { return 1 + nil; }\nfun outer() { return inner(); }\nouter();";
    let (message, trace) = runtime_error(source);
    assert_eq!(message, "Operands must be two numbers or two strings.");
    assert_eq!(
        trace,
        vec!["inner() line 1", "outer() line 2", "script line 3"]
    );
}

#[test]
fn unbounded_recursion_overflows_the_frame_stack() {
    let (message, trace) = runtime_error("fun f() { f(); }\nf();");
    assert_eq!(message, "Stack overflow.");
    assert_eq!(
        trace,
        vec![
            "f() line 1",
            "[^ line repeated 1022 time(s)]",
            "script line 2",
        ]
    );
}

#[test]
fn runtime_error_display_includes_the_trace() {
    let mut interpreter = Interpreter::new();
    interpreter.capture_output();
    let err = interpreter.interpret("print missing;").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Undefined variable 'missing'.\nscript line 1"
    );
}

#[test]
fn compile_error_display_joins_diagnostics() {
    let mut interpreter = Interpreter::new();
    interpreter.capture_output();
    let err = interpreter.interpret("1 +;").unwrap_err();
    assert_eq!(err.to_string(), "[line 1] Error at ';': Expect expression.");
}
