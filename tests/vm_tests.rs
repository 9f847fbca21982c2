// Integration tests for the Ardan execution engine.
//
// These tests compile and run complete Ardan programs and assert on the
// lines they print. They cover variable scoping, closures, classes with
// visibility, exception handling, enumeration order, async ordering and
// bytecode image round-trips.

use ardan::codec::{module_from_bytes, module_to_bytes};
use ardan::compile_source;
use ardan::run_source;
use ardan::vm::Vm;

fn printed(source: &str) -> Vec<String> {
    let (vm, _) = run_source(source).expect("program should run");
    vm.printed
}

fn fails(source: &str) -> String {
    match run_source(source) {
        Ok(_) => panic!("expected program to fail"),
        Err(error) => error.message,
    }
}

// ---- variable declarations ----

#[test]
fn var_declaration_yields_its_value() {
    assert_eq!(printed("var x = 6 * 7; print(x);"), vec!["42"]);
}

#[test]
fn let_is_block_scoped() {
    let message = fails("{ let x = 5; } print(x);");
    assert!(message.contains("not defined"), "got: {}", message);
}

#[test]
fn const_rejects_reassignment() {
    let message = fails("const x = 1; x = 2;");
    assert!(message.contains("constant"), "got: {}", message);
}

#[test]
fn shadowing_restores_outer_binding() {
    assert_eq!(
        printed("let x = 1; { let x = 2; print(x); } print(x);"),
        vec!["2", "1"]
    );
}

// ---- operators ----

#[test]
fn arithmetic_and_string_concatenation() {
    assert_eq!(
        printed("print(2 + 3 * 4); print(\"a\" + 1); print(2 ** 10);"),
        vec!["14", "a1", "1024"]
    );
}

#[test]
fn division_by_zero_produces_ieee_results() {
    assert_eq!(
        printed("print(1 / 0); print(-1 / 0); print(0 / 0);"),
        vec!["Infinity", "-Infinity", "NaN"]
    );
}

#[test]
fn bitwise_operators_use_int32_semantics() {
    assert_eq!(
        printed("print(1 << 3); print(-8 >> 1); print(-1 >>> 28); print(6 & 3); print(6 | 3); print(6 ^ 3);"),
        vec!["8", "-4", "15", "2", "7", "5"]
    );
}

#[test]
fn loose_and_strict_equality_diverge() {
    assert_eq!(
        printed("print(0 == \"0\"); print(0 === \"0\"); print(null == undefined); print(null === undefined);"),
        vec!["true", "false", "true", "false"]
    );
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(
        printed(
            "function boom() { throw \"called\"; } \
             print(false && boom()); print(true || boom()); print(null ?? \"fallback\");"
        ),
        vec!["false", "true", "fallback"]
    );
}

#[test]
fn compound_assignment_operators() {
    assert_eq!(
        printed("let x = 10; x += 5; x -= 3; x *= 2; print(x); let y = null; y ??= 7; print(y);"),
        vec!["24", "7"]
    );
}

#[test]
fn typeof_reports_language_tags() {
    assert_eq!(
        printed(
            "print(typeof 1); print(typeof \"s\"); print(typeof true); print(typeof null); \
             print(typeof undefined); print(typeof print); class C {} print(typeof C);"
        ),
        vec!["number", "string", "boolean", "object", "undefined", "function", "class"]
    );
}

// ---- control flow ----

#[test]
fn while_loop_with_break_and_continue() {
    assert_eq!(
        printed(
            "let i = 0; let s = \"\"; \
             while (true) { i = i + 1; if (i == 3) { continue; } if (i > 5) { break; } s = s + i; } \
             print(s);"
        ),
        vec!["1245"]
    );
}

#[test]
fn classic_for_loop_updates_after_continue() {
    assert_eq!(
        printed(
            "let s = \"\"; for (let i = 0; i < 5; i = i + 1) { if (i == 2) { continue; } s = s + i; } print(s);"
        ),
        vec!["0134"]
    );
}

#[test]
fn do_while_runs_at_least_once() {
    assert_eq!(printed("let n = 0; do { n = n + 1; } while (false); print(n);"), vec!["1"]);
}

#[test]
fn switch_matches_and_falls_through() {
    assert_eq!(
        printed(
            "let s = \"\"; let x = 1; \
             switch (x) { case 1: s = s + \"one\"; case 2: s = s + \"two\"; break; default: s = s + \"other\"; } \
             print(s);"
        ),
        vec!["onetwo"]
    );
    assert_eq!(
        printed(
            "let s = \"\"; let x = 9; \
             switch (x) { case 1: s = s + \"one\"; break; default: s = s + \"other\"; } \
             print(s);"
        ),
        vec!["other"]
    );
}

#[test]
fn ternary_and_nested_calls() {
    assert_eq!(
        printed(
            "function f(a, b) { return a + b; } function g(x) { return x * 2; } \
             print(f(1, g(2))); print(true ? \"yes\" : \"no\");"
        ),
        vec!["5", "yes"]
    );
}

// ---- functions & closures ----

#[test]
fn closure_captures_and_mutates_upvalue() {
    // A captured binding outlives its defining frame; both calls observe the
    // same closed-over slot.
    assert_eq!(
        printed(
            "function mk() { let x = 0; return function() { x = x + 1; return x; }; } \
             let f = mk(); print(f()); print(f());"
        ),
        vec!["1", "2"]
    );
}

#[test]
fn sibling_closures_share_one_upvalue() {
    assert_eq!(
        printed(
            "function mk() { let n = 0; \
               let bump = function() { n = n + 1; }; \
               let read = function() { return n; }; \
               return [bump, read]; } \
             let pair = mk(); pair[0](); pair[0](); print(pair[1]());"
        ),
        vec!["2"]
    );
}

#[test]
fn default_and_rest_parameters() {
    assert_eq!(
        printed(
            "function f(a, b = 10, ...rest) { return a + b + rest.length; } \
             print(f(1)); print(f(1, 2)); print(f(1, 2, 3, 4));"
        ),
        vec!["11", "3", "5"]
    );
}

#[test]
fn recursion_works_through_global_binding() {
    assert_eq!(
        printed("function fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } print(fib(10));"),
        vec!["55"]
    );
}

#[test]
fn each_for_of_iteration_gets_a_fresh_binding() {
    assert_eq!(
        printed(
            "let fns = []; \
             for (let v of [1, 2, 3]) { fns.push(function() { return v; }); } \
             print(fns[0]()); print(fns[1]()); print(fns[2]());"
        ),
        vec!["1", "2", "3"]
    );
}

// ---- objects & arrays ----

#[test]
fn object_literal_assignment_creates_properties() {
    assert_eq!(
        printed("let o = {}; o.a = 1; o.b = o.a + 1; print(o.b); print(o[\"a\"]);"),
        vec!["2", "1"]
    );
}

#[test]
fn for_in_enumerates_in_insertion_order() {
    assert_eq!(
        printed(
            "let o = {}; o.a = 1; o.b = 2; o.c = 3; let s = \"\"; for (let k in o) s = s + k; print(s);"
        ),
        vec!["abc"]
    );
}

#[test]
fn for_of_over_empty_array_runs_zero_times() {
    assert_eq!(printed("let n = 0; for (let x of []) { n = n + 1; } print(n);"), vec!["0"]);
}

#[test]
fn array_length_push_pop_join() {
    assert_eq!(
        printed(
            "let a = [1, 2]; a.push(3); print(a.length); print(a.pop()); print(a.join(\"-\")); \
             a[5] = 9; print(a.length);"
        ),
        vec!["3", "3", "1-2", "6"]
    );
}

#[test]
fn array_reduce_folds_left() {
    assert_eq!(
        printed("print([1, 2, 3, 4].reduce(function(acc, x) { return acc + x; }, 0));"),
        vec!["10"]
    );
}

#[test]
fn spreads_in_literals_and_calls() {
    assert_eq!(
        printed(
            "let xs = [2, 3]; let ys = [1, ...xs, 4]; print(ys.join(\",\")); \
             function sum(a, b, c) { return a + b + c; } print(sum(...[1, 2, 3]));"
        ),
        vec!["1,2,3,4", "6"]
    );
}

#[test]
fn object_spread_copies_properties() {
    assert_eq!(
        printed("let base = { a: 1, b: 2 }; let copy = { ...base, c: 3 }; print(copy.a + copy.b + copy.c);"),
        vec!["6"]
    );
}

#[test]
fn delete_leaves_undefined_behind() {
    assert_eq!(
        printed("let o = { x: 1 }; print(delete o.x); print(o.x == undefined);"),
        vec!["true", "true"]
    );
}

#[test]
fn in_operator_walks_chains() {
    assert_eq!(
        printed(
            "let o = { a: 1 }; print(\"a\" in o); print(\"b\" in o); \
             class A { var v = 1; } class B extends A {} \
             print(\"v\" in new B());"
        ),
        vec!["true", "false", "true"]
    );
}

#[test]
fn template_literals_interpolate() {
    assert_eq!(
        printed("let name = \"world\"; let n = 2; print(`hello ${name} ${n + 1}`);"),
        vec!["hello world 3"]
    );
}

#[test]
fn update_expressions_on_members_and_locals() {
    assert_eq!(
        printed(
            "let o = { n: 5 }; print(o.n++); print(o.n); print(++o.n); \
             let i = 0; print(i++); print(i); let a = [10]; a[0]++; print(a[0]);"
        ),
        vec!["5", "6", "7", "0", "1", "11"]
    );
}

// ---- classes ----

#[test]
fn instance_fields_and_methods() {
    assert_eq!(
        printed(
            "class Counter { var count = 0; bump() { count = count + 1; return count; } } \
             let c = new Counter(); c.bump(); print(c.bump());"
        ),
        vec!["2"]
    );
}

#[test]
fn constructor_arguments_initialize_state() {
    assert_eq!(
        printed(
            "class Point { var x = 0; var y = 0; \
               constructor(x, y) { this.x = x; this.y = y; } \
               sum() { return this.x + this.y; } } \
             print(new Point(3, 4).sum());"
        ),
        vec!["7"]
    );
}

#[test]
fn inheritance_and_protected_access() {
    assert_eq!(
        printed(
            "class A { protected var v = 10; getV() { return this.v; } } \
             class B extends A { show() { return this.getV() + 1; } } \
             print(new B().show());"
        ),
        vec!["11"]
    );
    let message = fails(
        "class A { protected var v = 10; } print(new A().v);",
    );
    assert!(message.contains("protected"), "got: {}", message);
}

#[test]
fn private_members_are_invisible_outside() {
    assert_eq!(
        printed(
            "class Safe { private var secret = 7; reveal() { return this.secret; } } \
             print(new Safe().reveal());"
        ),
        vec!["7"]
    );
    let message = fails("class Safe { private var secret = 7; } print(new Safe().secret);");
    assert!(message.contains("private"), "got: {}", message);
}

#[test]
fn static_members_live_on_the_class() {
    assert_eq!(
        printed(
            "class Registry { static var count = 0; static bump() { return 1; } } \
             Registry.count = Registry.count + 1; print(Registry.count); print(Registry.bump());"
        ),
        vec!["1", "1"]
    );
}

#[test]
fn explicit_super_call_chains_constructors() {
    assert_eq!(
        printed(
            "class A { var log = \"\"; constructor() { this.log = this.log + \"A\"; } } \
             class B extends A { constructor() { super(); } tag() { return \"B\"; } } \
             let b = new B(); print(b.tag());"
        ),
        vec!["B"]
    );
}

#[test]
fn super_method_access_reaches_the_parent() {
    assert_eq!(
        printed(
            "class A { greet() { return \"hi\"; } } \
             class B extends A { greet() { return super.greet() + \"!\"; } } \
             print(new B().greet());"
        ),
        vec!["hi!"]
    );
}

#[test]
fn instanceof_respects_the_class_chain() {
    assert_eq!(
        printed(
            "class A {} class B extends A {} let b = new B(); \
             print(b instanceof B); print(b instanceof A); print(new A() instanceof B);"
        ),
        vec!["true", "true", "false"]
    );
}

#[test]
fn const_fields_reject_assignment() {
    let message = fails(
        "class C { const k = 1; poke() { this.k = 2; } } new C().poke();",
    );
    assert!(message.contains("constant"), "got: {}", message);
}

#[test]
fn arrow_functions_capture_the_enclosing_this() {
    assert_eq!(
        printed(
            "class Holder { var n = 5; grab() { let f = () => this.n + 1; return f(); } } \
             print(new Holder().grab());"
        ),
        vec!["6"]
    );
}

#[test]
fn plain_function_expressions_do_not_capture_this() {
    let message = fails(
        "class Holder { var n = 5; grab() { let f = function() { return this.n; }; return f(); } } \
         print(new Holder().grab());",
    );
    assert!(message.contains("bound 'this'"), "got: {}", message);
}

#[test]
fn object_literal_methods_bind_their_receiver() {
    assert_eq!(
        printed("let o = { n: 41, bump() { return this.n + 1; } }; print(o.bump());"),
        vec!["42"]
    );
}

// ---- exceptions ----

#[test]
fn try_catch_finally_runs_in_order() {
    assert_eq!(
        printed(
            "let log = []; \
             try { log.push(\"t\"); throw \"e\"; } \
             catch (e) { log.push(e); } \
             finally { log.push(\"f\"); } \
             print(log.join(\",\"));"
        ),
        vec!["t,e,f"]
    );
}

#[test]
fn finally_runs_on_the_normal_path_too() {
    assert_eq!(
        printed("let log = []; try { log.push(\"t\"); } finally { log.push(\"f\"); } print(log.join(\",\"));"),
        vec!["t,f"]
    );
}

#[test]
fn uncaught_exception_in_finally_only_try_propagates() {
    assert_eq!(
        printed(
            "let log = []; \
             try { try { throw \"boom\"; } finally { log.push(\"inner\"); } } \
             catch (e) { log.push(e); } \
             print(log.join(\",\"));"
        ),
        vec!["inner,boom"]
    );
}

#[test]
fn exceptions_unwind_across_call_frames() {
    assert_eq!(
        printed(
            "function thrower() { throw \"deep\"; } \
             function middle() { thrower(); } \
             try { middle(); } catch (e) { print(\"caught \" + e); }"
        ),
        vec!["caught deep"]
    );
}

#[test]
fn rethrow_from_catch_reaches_outer_try() {
    assert_eq!(
        printed(
            "try { try { throw \"a\"; } catch (e) { throw e + \"b\"; } } \
             catch (e) { print(e); }"
        ),
        vec!["ab"]
    );
}

#[test]
fn uncaught_throw_is_fatal() {
    let message = fails("throw \"nope\";");
    assert!(message.contains("Uncaught"), "got: {}", message);
}

// ---- async ----

#[test]
fn await_resumes_on_the_next_turn() {
    // "after" prints before the awaited continuation runs
    assert_eq!(
        printed(
            "async function g() { return 42; } \
             async function h() { let x = await g(); print(x); } \
             h(); print(\"after\");"
        ),
        vec!["after", "42"]
    );
}

#[test]
fn then_callbacks_run_through_the_event_loop() {
    assert_eq!(
        printed(
            "async function g() { return 10; } \
             g().then(function(v) { print(v * 2); }); \
             print(\"first\");"
        ),
        vec!["first", "20"]
    );
}

#[test]
fn async_rejection_behaves_as_throw_at_the_await_point() {
    assert_eq!(
        printed(
            "async function bad() { throw \"broken\"; } \
             async function main() { \
               try { await bad(); print(\"unreachable\"); } \
               catch (e) { print(\"caught \" + e); } } \
             main(); print(\"sync\");"
        ),
        vec!["sync", "caught broken"]
    );
}

#[test]
fn awaiting_a_plain_value_still_defers() {
    assert_eq!(
        printed(
            "async function f() { let v = await 5; print(v); } f(); print(\"sync\");"
        ),
        vec!["sync", "5"]
    );
}

#[test]
fn chained_awaits_keep_fifo_order() {
    assert_eq!(
        printed(
            "async function step(n) { return n; } \
             async function main() { \
               let a = await step(1); print(a); \
               let b = await step(2); print(b); } \
             main(); print(\"start\");"
        ),
        vec!["start", "1", "2"]
    );
}

// ---- module round-trip ----

#[test]
fn compiled_module_round_trips_bit_exactly() {
    let module = compile_source(
        "function mk() { let x = 0; return function() { x = x + 1; return x; }; } \
         let f = mk(); print(f()); print(f());",
        None,
    )
    .expect("compiles");
    let bytes = module_to_bytes(&module).expect("writes");
    let back = module_from_bytes(&bytes).expect("reads");
    assert_eq!(module, back);
}

#[test]
fn round_tripped_module_runs_identically() {
    let source = "function mk() { let x = 0; return function() { x = x + 1; return x; }; } \
                  let f = mk(); print(f()); print(f());";
    let module = compile_source(source, None).expect("compiles");
    let bytes = module_to_bytes(&module).expect("writes");
    let back = module_from_bytes(&bytes).expect("reads");

    let mut vm = Vm::new();
    vm.interpret(&back).expect("runs");
    assert_eq!(vm.printed, vec!["1", "2"]);
}
