//! End-to-end language tests: run scripts through the `rook` binary and
//! check stdout, stderr, and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;

const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;

fn run_script(source: &str) -> assert_cmd::assert::Assert {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.rook");
    std::fs::write(&path, source).unwrap();
    Command::cargo_bin("rook").unwrap().arg(&path).assert()
}

// ----------------------------------------------------------------------
// Expressions and printing
// ----------------------------------------------------------------------

#[test]
fn test_arithmetic_precedence() {
    run_script("print 1 + 2 * 3;")
        .success()
        .stdout("7\n")
        .stderr("");
}

#[test]
fn test_grouping_overrides_precedence() {
    run_script("print (1 + 2) * 3;").success().stdout("9\n");
}

#[test]
fn test_number_formatting() {
    run_script("print 2.5; print 10 / 4; print 1 / 2; print -3;")
        .success()
        .stdout("2.5\n2.5\n0.5\n-3\n");
}

#[test]
fn test_unary_and_equality() {
    run_script("print !true; print !nil; print 1 == 1; print 1 != 2; print nil == false;")
        .success()
        .stdout("false\ntrue\ntrue\ntrue\nfalse\n");
}

#[test]
fn test_comparisons() {
    run_script("print 1 < 2; print 2 <= 2; print 3 > 4; print 4 >= 4;")
        .success()
        .stdout("true\ntrue\nfalse\ntrue\n");
}

#[test]
fn test_short_circuit_operators() {
    run_script("print false or 2; print nil and 1; print true and 3; print 4 or 5;")
        .success()
        .stdout("2\nnil\n3\n4\n");
}

#[test]
fn test_string_concatenation() {
    run_script("var a = \"foo\"; var b = \"bar\"; print a + b;")
        .success()
        .stdout("foobar\n")
        .stderr("");
}

#[test]
fn test_string_equality_is_content_equality() {
    // Interning makes identity comparison behave as content comparison,
    // including for strings built at run time.
    run_script(
        "print \"ab\" == \"ab\"; \
         print \"hello\" + \"\" == \"hello\"; \
         print \"long\" + \"er string\" == \"longer string\"; \
         print \"a\" == \"b\";",
    )
    .success()
    .stdout("true\ntrue\ntrue\nfalse\n");
}

// ----------------------------------------------------------------------
// Variables and scope
// ----------------------------------------------------------------------

#[test]
fn test_shadowing_in_nested_blocks() {
    run_script("var x = 1; { var x = 2; { var x = 3; print x; } print x; } print x;")
        .success()
        .stdout("3\n2\n1\n");
}

#[test]
fn test_let_assignment_is_a_compile_error() {
    run_script("let k = 5; k = 6;")
        .code(EXIT_COMPILE_ERROR)
        .stderr(predicate::str::contains("readonly"));
}

#[test]
fn test_let_reads_fine() {
    run_script("let k = 5; print k + 1;").success().stdout("6\n");
}

#[test]
fn test_undefined_variable_is_a_runtime_error() {
    run_script("nonexistent();")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(
            predicate::str::contains("Undefined variable 'nonexistent'.")
                .and(predicate::str::contains("[line 1] in script")),
        );
}

#[test]
fn test_assignment_evaluates_to_value() {
    run_script("var a = 1; print a = 2; print a;")
        .success()
        .stdout("2\n2\n");
}

// ----------------------------------------------------------------------
// Control flow
// ----------------------------------------------------------------------

#[test]
fn test_if_else() {
    run_script("if (1 < 2) print \"then\"; else print \"else\"; if (false) print \"no\"; else print \"yes\";")
        .success()
        .stdout("then\nyes\n");
}

#[test]
fn test_while_loop() {
    run_script("var i = 0; while (i < 3) { print i; i = i + 1; }")
        .success()
        .stdout("0\n1\n2\n");
}

#[test]
fn test_for_loop() {
    run_script("for (var i = 0; i < 3; i = i + 1) print i;")
        .success()
        .stdout("0\n1\n2\n");
}

#[test]
fn test_continue_in_for_runs_increment() {
    run_script("for (var i = 0; i < 5; i = i + 1) { if (i == 2) continue; print i; }")
        .success()
        .stdout("0\n1\n3\n4\n");
}

#[test]
fn test_continue_in_while() {
    run_script(
        "var i = 0; while (i < 5) { i = i + 1; if (i == 3) continue; print i; }",
    )
    .success()
    .stdout("1\n2\n4\n5\n");
}

#[test]
fn test_switch_matches_case() {
    run_script(
        "switch (2) { case 1: print \"one\"; case 2: print \"two\"; default: print \"other\"; } print \"done\";",
    )
    .success()
    .stdout("two\ndone\n");
}

#[test]
fn test_switch_falls_to_default() {
    run_script(
        "switch (9) { case 1: print \"one\"; default: print \"other\"; } print \"done\";",
    )
    .success()
    .stdout("other\ndone\n");
}

#[test]
fn test_switch_without_match_or_default() {
    run_script("switch (9) { case 1: print \"one\"; } print \"done\";")
        .success()
        .stdout("done\n");
}

#[test]
fn test_switch_compares_strings() {
    run_script(
        "switch (\"b\") { case \"a\": print 1; case \"b\": print 2; } ",
    )
    .success()
    .stdout("2\n");
}

// ----------------------------------------------------------------------
// Functions and closures
// ----------------------------------------------------------------------

#[test]
fn test_function_call_and_return() {
    run_script("fun add(a, b) { return a + b; } print add(3, 4);")
        .success()
        .stdout("7\n");
}

#[test]
fn test_recursion() {
    run_script("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);")
        .success()
        .stdout("55\n");
}

#[test]
fn test_counter_closure() {
    run_script(
        "fun mkCounter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; } \
         var c = mkCounter(); print c(); print c(); print c();",
    )
    .success()
    .stdout("1\n2\n3\n")
    .stderr("");
}

#[test]
fn test_closures_share_captured_variable() {
    run_script(
        "var setter; var getter; \
         fun make() { var shared = 0; fun s(v) { shared = v; } fun g() { return shared; } \
                      setter = s; getter = g; } \
         make(); setter(42); print getter();",
    )
    .success()
    .stdout("42\n");
}

#[test]
fn test_closure_captures_loop_variable_per_scope() {
    run_script(
        "var f; { var i = 10; fun show() { print i; } f = show; i = 20; } f();",
    )
    .success()
    .stdout("20\n");
}

#[test]
fn test_function_prints_by_name() {
    run_script("fun f() {} print f; print clock;")
        .success()
        .stdout("<fn f>\n<native fn>\n");
}

// ----------------------------------------------------------------------
// Classes
// ----------------------------------------------------------------------

#[test]
fn test_inherited_method() {
    run_script("class A { greet() { print \"hi\"; } } class B < A {} B().greet();")
        .success()
        .stdout("hi\n")
        .stderr("");
}

#[test]
fn test_initializer_and_fields() {
    run_script(
        "class C { init(x) { this.x = x; } get() { return this.x; } } print C(42).get();",
    )
    .success()
    .stdout("42\n");
}

#[test]
fn test_inherited_initializer() {
    run_script("class A { init(x) { this.x = x; } } class B < A {} print B(7).x;")
        .success()
        .stdout("7\n");
}

#[test]
fn test_super_call() {
    run_script(
        "class A { m() { return \"A\"; } } \
         class B < A { m() { return \"B+\" + super.m(); } } \
         print B().m();",
    )
    .success()
    .stdout("B+A\n");
}

#[test]
fn test_bound_method_carries_receiver() {
    run_script(
        "class C { init() { this.x = 5; } get() { return this.x; } } \
         var bound = C().get; print bound();",
    )
    .success()
    .stdout("5\n");
}

#[test]
fn test_field_shadows_method_on_invoke() {
    run_script(
        "class C { m() { return \"method\"; } } \
         fun field() { return \"field\"; } \
         var c = C(); print c.m(); c.m = field; print c.m();",
    )
    .success()
    .stdout("method\nfield\n");
}

#[test]
fn test_class_and_instance_print() {
    run_script("class C {} print C; print C();")
        .success()
        .stdout("C\nC instance\n");
}

#[test]
fn test_long_property_names() {
    run_script(
        "class C { init() { this.somelongproperty = 9; } } print C().somelongproperty;",
    )
    .success()
    .stdout("9\n");
}

// ----------------------------------------------------------------------
// Runtime errors
// ----------------------------------------------------------------------

#[test]
fn test_calling_a_number_fails() {
    run_script("var x = 1; x();")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Can only call functions and classes."));
}

#[test]
fn test_arity_mismatch_fails() {
    run_script("fun f(a) {} f();")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Expected 1 arguments but got 0."));
}

#[test]
fn test_class_without_initializer_rejects_arguments() {
    run_script("class C {} C(1);")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Expected 0 arguments but got 1."));
}

#[test]
fn test_property_on_non_instance_fails() {
    run_script("var x = 1; print x.y;")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Only instances have properties."));
}

#[test]
fn test_undefined_property_fails() {
    run_script("class C {} print C().missing;")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Undefined property 'missing'."));
}

#[test]
fn test_undefined_short_property_fails() {
    run_script("class C {} print C().z;")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Undefined property 'z'."));
}

#[test]
fn test_non_class_superclass_fails() {
    run_script("var NotAClass = 1; class B < NotAClass {}")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Superclass must be a class."));
}

#[test]
fn test_unbounded_recursion_overflows() {
    run_script("fun f() { f(); } f();")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Stack overflow."));
}

#[test]
fn test_negating_a_string_fails() {
    run_script("print -\"a\";")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Operand must be a number."));
}

#[test]
fn test_mixed_addition_fails() {
    run_script("print 1 + \"a\";")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains(
            "Operands must be two numbers or two strings.",
        ));
}

#[test]
fn test_stack_trace_names_functions() {
    run_script("fun inner() { missing(); } fun outer() { inner(); } outer();")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(
            predicate::str::contains("in inner()")
                .and(predicate::str::contains("in outer()"))
                .and(predicate::str::contains("in script")),
        );
}

// ----------------------------------------------------------------------
// Natives
// ----------------------------------------------------------------------

#[test]
fn test_clock_returns_a_positive_number() {
    run_script("print clock() > 0;").success().stdout("true\n");
}

#[test]
fn test_env_reads_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.rook");
    std::fs::write(&path, "print env(\"ROOK_E2E_VALUE\"); print env(\"ROOK_E2E_UNSET\");")
        .unwrap();
    Command::cargo_bin("rook")
        .unwrap()
        .arg(&path)
        .env("ROOK_E2E_VALUE", "hello rook")
        .env_remove("ROOK_E2E_UNSET")
        .assert()
        .success()
        .stdout("hello rook\nnil\n");
}

#[test]
fn test_rand_in_degenerate_range_is_deterministic() {
    run_script("print rand(1, 2);").success().stdout("1\n");
}

#[test]
fn test_rand_stays_in_range() {
    run_script(
        "var ok = true; \
         for (var i = 0; i < 50; i = i + 1) { \
           var r = rand(3, 6); \
           if (r < 3) ok = false; \
           if (r >= 6) ok = false; \
         } \
         print ok;",
    )
    .success()
    .stdout("true\n");
}

#[test]
fn test_rand_type_error() {
    run_script("rand(\"a\", 2);")
        .code(EXIT_RUNTIME_ERROR)
        .stderr(predicate::str::contains("Arguments to 'rand' must be numbers."));
}

#[test]
fn test_exit_terminates_with_code() {
    run_script("print 1; exit(3); print 2;")
        .code(3)
        .stdout("1\n");
}
