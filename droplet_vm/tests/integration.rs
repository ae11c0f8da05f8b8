//! End-to-end tests: source → type check → DLBC → VM → observed output.

use droplet_vm::{loader, Vm};

/// Compile source, load it into a fresh VM with captured output, and run.
fn execute(source: &str) -> (Vm, String) {
    let mut builder = droplet_compiler::compile_source(source).expect("compile failure");
    let bytes = builder.to_bytes();

    let mut vm = Vm::new();
    vm.capture_output();
    loader::load_bytes(&mut vm, &bytes).expect("load failure");
    vm.run_program().expect("run failure");
    let output = vm.take_output();
    (vm, output)
}

fn run(source: &str) -> String {
    execute(source).1
}

// =============================================================================
// Arithmetic and precedence
// =============================================================================

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(run("fn main(){ println(1 + 2 * 3) }"), "7\n");
}

#[test]
fn test_parenthesized_expressions() {
    assert_eq!(run("fn main(){ println((1 + 2) * 3) }"), "9\n");
}

#[test]
fn test_integer_division_yields_float() {
    assert_eq!(run("fn main(){ println(7 / 2) }"), "3.5\n");
}

#[test]
fn test_modulo_truncated_for_ints() {
    assert_eq!(run("fn main(){ println(7 % 3) }"), "1\n");
    assert_eq!(run("fn main(){ println(0 - 7 % 3) }"), "-1\n");
}

#[test]
fn test_unary_negation() {
    assert_eq!(run("fn main(){ let x = 5; println(-x) }"), "-5\n");
}

#[test]
fn test_float_arithmetic() {
    assert_eq!(run("fn main(){ println(1.5 + 2.25) }"), "3.75\n");
    assert_eq!(run("fn main(){ println(2.0 * 3) }"), "6.0\n");
}

#[test]
fn test_bool_logic() {
    assert_eq!(
        run("fn main(){ println(true && false); println(true || false); println(!true) }"),
        "false\ntrue\nfalse\n"
    );
}

#[test]
fn test_comparisons() {
    assert_eq!(
        run("fn main(){ println(1 < 2); println(2 <= 2); println(3 > 4); println(1 == 1.0) }"),
        "true\ntrue\nfalse\ntrue\n"
    );
}

// =============================================================================
// Classes, fields, methods, constructors
// =============================================================================

#[test]
fn test_class_fields_methods_constructor() {
    let src = "class Point { pub x:int=0 pub y:int=0
  new(a:int,b:int){ self.x=a; self.y=b }
  pub fn sum()->int{ return self.x + self.y } }
fn main(){ let p = new Point(3,4); println(p.sum()) }";
    assert_eq!(run(src), "7\n");
}

#[test]
fn test_field_defaults_from_initializers() {
    let src = "class C { pub n:int=41
  new(){ }
  pub fn bump()->int{ self.n = self.n + 1; return self.n } }
fn main(){ let c = new C(); println(c.bump()) }";
    assert_eq!(run(src), "42\n");
}

#[test]
fn test_constructor_param_matching_field_name() {
    let src = "class Box { pub v:int=0
  new(v:int){ } }
fn main(){ let b = new Box(9); println(b.v) }";
    assert_eq!(run(src), "9\n");
}

#[test]
fn test_instance_renders_with_class_name() {
    let src = "class Widget { new(){ } }\nfn main(){ println(new Widget()) }";
    assert_eq!(run(src), "<object:Widget>\n");
}

#[test]
fn test_method_calls_on_inherited_class() {
    let src = "class Animal { pub fn legs()->int { return 4 } }
class Dog : Animal { }
fn main(){ let d = new Dog(); println(d.legs()) }";
    assert_eq!(run(src), "4\n");
}

#[test]
fn test_subclass_sets_parent_field() {
    let src = "class Base { pub tag:int=0 }
class Child : Base {
  new(){ self.tag = 7 }
  pub fn get()->int { return self.tag } }
fn main(){ let c = new Child(); println(c.get()) }";
    assert_eq!(run(src), "7\n");
}

#[test]
fn test_static_method_call() {
    let src = "class M { pub static fn twice(x:int)->int { return x + x } }
fn main(){ println(M.twice(21)) }";
    assert_eq!(run(src), "42\n");
}

#[test]
fn test_static_field_initializer_runs_before_main() {
    let src = "class Config { pub static limit:int = 99 }
fn main(){ println(Config.limit) }";
    assert_eq!(run(src), "99\n");
}

#[test]
fn test_static_field_assignment() {
    let src = "class Counter { pub static n:int = 0 }
fn main(){ Counter.n = 5; Counter.n += 2; println(Counter.n) }";
    assert_eq!(run(src), "7\n");
}

// =============================================================================
// Operator overloading
// =============================================================================

#[test]
fn test_operator_overload_add() {
    let src = "class V { pub n:int=0
  new(x:int){ self.n=x }
  pub op + (o:V)->V { return new V(self.n + o.n) } }
fn main(){ let a=new V(2); let b=new V(5); println((a+b).n) }";
    assert_eq!(run(src), "7\n");
}

#[test]
fn test_operator_overload_comparison() {
    let src = "class Size { pub n:int=0
  new(x:int){ self.n=x }
  pub op < (o:Size)->bool { return self.n < o.n } }
fn main(){ let a=new Size(1); let b=new Size(2); println(a < b) }";
    assert_eq!(run(src), "true\n");
}

#[test]
fn test_operator_overload_index_get() {
    let src = "class Grid { pub cells:list[int] = [10,20,30]
  new(){ }
  pub op [] (i:int)->int { return self.cells[i] } }
fn main(){ let g = new Grid(); println(g[1]) }";
    assert_eq!(run(src), "20\n");
}

// =============================================================================
// Fallible returns
// =============================================================================

#[test]
fn test_fallible_guard_pattern_error_path() {
    let src = "fn parse(s:str)->int! { if s == \"x\" { return new Error() } return 42 }
fn main(){ let r = parse(\"x\"); if r is Error { println(\"bad\"); return } println(r) }";
    assert_eq!(run(src), "bad\n");
}

#[test]
fn test_fallible_guard_pattern_success_path() {
    let src = "fn parse(s:str)->int! { if s == \"x\" { return new Error() } return 42 }
fn main(){ let r = parse(\"ok\"); if r is Error { println(\"bad\"); return } println(r) }";
    assert_eq!(run(src), "42\n");
}

#[test]
fn test_fallible_if_else_narrowing() {
    let src = "fn double(n:int)->int! { if n % 2 == 1 { return new Error() } return n + n }
fn main(){ let r = double(8); if r is Error { println(\"odd\") } else { println(r) } }";
    assert_eq!(run(src), "16\n");
}

// =============================================================================
// Lists, for-in, indexing
// =============================================================================

#[test]
fn test_for_in_sum() {
    let src = "fn main(){ let xs = [10,20,30]; let s:int=0; for v in xs { s = s + v } println(s) }";
    assert_eq!(run(src), "60\n");
}

#[test]
fn test_for_in_over_list_containing_nil() {
    // Length-driven iteration visits nil elements instead of stopping.
    let src = "fn main(){ let xs = [new Error(), new Error(), new Error()]; xs[1] = null; let n:int=0; for v in xs { n = n + 1 } println(n) }";
    assert_eq!(run(src), "3\n");
}

#[test]
fn test_index_write_then_read() {
    let src = "fn main(){ let xs = [1,2,3]; xs[1] = 9; println(xs[1]) }";
    assert_eq!(run(src), "9\n");
}

#[test]
fn test_index_assignment_is_expression() {
    let src = "fn main(){ let xs = [0]; let v = xs[0] = 5; println(v) }";
    assert_eq!(run(src), "5\n");
}

#[test]
fn test_out_of_range_read_is_nil() {
    let src = "fn main(){ let xs = [1]; println(xs[5]) }";
    assert_eq!(run(src), "nil\n");
}

#[test]
fn test_list_rendering() {
    let src = "fn main(){ println([1, 2, 3]) }";
    assert_eq!(run(src), "[1, 2, 3]\n");
}

#[test]
fn test_len_builtin() {
    let src = "fn main(){ println(len([1,2,3,4])) }";
    assert_eq!(run(src), "4\n");
}

#[test]
fn test_nested_lists() {
    let src = "fn main(){ let m = [[1,2],[3,4]]; println(m[1][0]) }";
    assert_eq!(run(src), "3\n");
}

// =============================================================================
// Control flow
// =============================================================================

#[test]
fn test_while_loop() {
    let src = "fn main(){ let i = 0; let s = 0; while i < 5 { s = s + i; i = i + 1 } println(s) }";
    assert_eq!(run(src), "10\n");
}

#[test]
fn test_break_exits_loop() {
    let src = "fn main(){ let i = 0; loop { i = i + 1; if i == 4 { break } } println(i) }";
    assert_eq!(run(src), "4\n");
}

#[test]
fn test_continue_skips_iteration() {
    let src = "fn main(){ let s = 0; for v in [1,2,3,4,5] { if v % 2 == 0 { continue } s = s + v } println(s) }";
    assert_eq!(run(src), "9\n");
}

#[test]
fn test_continue_in_while_reevaluates_condition() {
    let src = "fn main(){ let i = 0; let hits = 0; while i < 6 { i = i + 1; if i % 2 == 0 { continue } hits = hits + 1 } println(hits) }";
    assert_eq!(run(src), "3\n");
}

#[test]
fn test_if_else_chain() {
    let src = "fn classify(n:int)->str { if n < 0 { return \"neg\" } else if n == 0 { return \"zero\" } else { return \"pos\" } }
fn main(){ println(classify(-2)); println(classify(0)); println(classify(3)) }";
    assert_eq!(run(src), "neg\nzero\npos\n");
}

#[test]
fn test_recursion() {
    let src = "fn fib(n:int)->int { if n < 2 { return n } return fib(n - 1) + fib(n - 2) }
fn main(){ println(fib(10)) }";
    assert_eq!(run(src), "55\n");
}

#[test]
fn test_mutual_recursion_forward_reference() {
    let src = "fn is_even(n:int)->bool { if n == 0 { return true } return is_odd(n - 1) }
fn is_odd(n:int)->bool { if n == 0 { return false } return is_even(n - 1) }
fn main(){ println(is_even(10)); println(is_odd(7)) }";
    assert_eq!(run(src), "true\ntrue\n");
}

// =============================================================================
// Strings
// =============================================================================

#[test]
fn test_string_concat() {
    let src = "fn main(){ println(\"foo\" + \"bar\") }";
    assert_eq!(run(src), "foobar\n");
}

#[test]
fn test_string_concat_identity() {
    let src = "fn main(){ println(\"\" + \"x\") }";
    assert_eq!(run(src), "x\n");
}

#[test]
fn test_string_equality() {
    let src = "fn main(){ let a = \"hi\"; println(a == \"hi\"); println(a == \"ho\") }";
    assert_eq!(run(src), "true\nfalse\n");
}

#[test]
fn test_str_builtin() {
    let src = "fn main(){ println(\"n=\" + str(42)) }";
    assert_eq!(run(src), "n=42\n");
}

#[test]
fn test_int_float_builtins() {
    let src = "fn main(){ println(int(\"12\")); println(int(\"oops\")); println(float(3)) }";
    assert_eq!(run(src), "12\n0\n3.0\n");
}

// =============================================================================
// Casts and type tests
// =============================================================================

#[test]
fn test_is_type_exact_match() {
    let src = "class A { new(){ } }\nclass B : A { new(){ } }
fn main(){ let b = new B(); println(b is B); println(b is A) }";
    // `is` is non-hierarchical: exact class-name match only.
    assert_eq!(run(src), "true\nfalse\n");
}

#[test]
fn test_upcast_is_runtime_identity() {
    let src = "class A { pub fn id()->int { return 1 } }\nclass B : A { }
fn main(){ let b = new B(); let a = b as A; println(a.id()) }";
    assert_eq!(run(src), "1\n");
}

// =============================================================================
// Compound assignment
// =============================================================================

#[test]
fn test_compound_assign_local() {
    let src = "fn main(){ let x = 10; x += 5; x -= 3; println(x) }";
    assert_eq!(run(src), "12\n");
}

#[test]
fn test_compound_assign_field() {
    let src = "class C { pub n:int=10 new(){ } }
fn main(){ let c = new C(); c.n += 7; println(c.n) }";
    assert_eq!(run(src), "17\n");
}

#[test]
fn test_compound_assign_index() {
    let src = "fn main(){ let xs = [5, 6]; xs[1] += 4; println(xs[1]) }";
    assert_eq!(run(src), "10\n");
}

// =============================================================================
// Assignment as expression
// =============================================================================

#[test]
fn test_assignment_yields_value() {
    let src = "fn main(){ let a = 0; let b = a = 3; println(a + b) }";
    assert_eq!(run(src), "6\n");
}

#[test]
fn test_field_assignment_yields_value() {
    let src = "class C { pub n:int=0 new(){ } }
fn main(){ let c = new C(); let v = c.n = 8; println(v) }";
    assert_eq!(run(src), "8\n");
}

// =============================================================================
// Print behavior
// =============================================================================

#[test]
fn test_print_multiple_args_space_joined() {
    let src = "fn main(){ println(1, \"two\", 3.0) }";
    assert_eq!(run(src), "1 two 3.0\n");
}

#[test]
fn test_print_without_newline() {
    let src = "fn main(){ print(\"a\"); print(\"b\"); println(\"c\") }";
    assert_eq!(run(src), "abc\n");
}

#[test]
fn test_nil_rendering() {
    let src = "fn main(){ let x: Error = null; println(x) }";
    assert_eq!(run(src), "nil\n");
}

// =============================================================================
// Stack discipline
// =============================================================================

#[test]
fn test_stack_is_balanced_after_main() {
    // main leaves exactly its implicit return value.
    let (mut vm, _) = execute("fn main(){ let a = 1; let b = 2; println(a + b) }");
    assert_eq!(vm.stack.pop(), droplet_core::Value::nil());
    assert_eq!(vm.stack.sp(), 0);
}

#[test]
fn test_void_function_call_as_statement() {
    let src = "fn side(){ println(\"hi\") }\nfn main(){ side(); side() }";
    assert_eq!(run(src), "hi\nhi\n");
}

#[test]
fn test_bare_return_from_void_function() {
    let src = "fn maybe(n:int) { if n > 0 { return } println(\"non-positive\") }
fn main(){ maybe(1); maybe(-1) }";
    assert_eq!(run(src), "non-positive\n");
}
