//! End-to-end scenarios: source text in, JIT-compiled and executed,
//! `main`'s return value out. Exercises every phase (lex, parse, analyze,
//! IR generation, register allocation, two-pass encoding, linking, the
//! executable-arena flip) without going through the CLI or filesystem.

use tinycc::arena::ExecutableArena;
use tinycc::codegen;
use tinycc::diag::Sink;
use tinycc::front::{self, ast::TranslationUnit};
use tinycc::ir;
use tinycc::link;
use tinycc::sema;

fn run_program(src: &str) -> i64 {
    let mut sink = Sink::new();
    let tokens = front::lex::Lexer::new(src, "<e2e>").tokenize(&mut sink);
    let mut unit: TranslationUnit = front::parse(&tokens, "<e2e>", &mut sink);
    assert!(!sink.has_errors(), "parse errors: {:?}", sink.diagnostics());

    sema::analyze(&mut unit, "<e2e>", &mut sink);
    assert!(!sink.has_errors(), "semantic errors: {:?}", sink.diagnostics());

    let mut compiled = Vec::new();
    for func in &unit.functions {
        if func.is_prototype {
            continue;
        }
        let ir_func = ir::gen_function(func, "<e2e>", &mut sink).expect("codegen should succeed for valid input");
        let alloc = codegen::allocate(&ir_func);
        let f = codegen::build_function(&ir_func, &alloc, func.params.len()).expect("two-pass sizes should agree");
        compiled.push(f);
    }
    assert!(!sink.has_errors(), "codegen errors: {:?}", sink.diagnostics());

    let total: usize = compiled.iter().map(|f| f.code.len()).sum();
    let mut arena = ExecutableArena::new(total.max(1)).unwrap();
    let (code, placed) = link::link_all(&compiled, arena.base_addr(), &mut sink).expect("linking should succeed");
    arena.write(&code);
    arena.make_executable().unwrap();

    let main_fn = placed.iter().find(|p| p.name.to_string() == "main").expect("a 'main' function");
    unsafe { arena.call_entry(main_fn.offset) }
}

#[test]
fn precedence() {
    assert_eq!(run_program("int main(){ return 2+3*4; }"), 14);
}

#[test]
fn bitwise_operators() {
    assert_eq!(run_program("int main(){ int a = 12; int b = 5; return (a&b)|(a^b); }"), 13);
}

#[test]
fn recursive_calls_share_a_name() {
    assert_eq!(
        run_program("int add(int x, int y){ return x+y; } int main(){ return add(add(1,2), add(3,4)); }"),
        10
    );
}

#[test]
fn while_loop_accumulates() {
    assert_eq!(
        run_program("int main(){ int i = 0; int s = 0; while (i < 10) { s = s + i; i = i + 1; } return s; }"),
        45
    );
}

#[test]
fn recursive_factorial() {
    assert_eq!(
        run_program("int fact(int n){ if (n <= 1) return 1; return n * fact(n-1); } int main(){ return fact(6); }"),
        720
    );
}

#[test]
fn seventh_argument_spills_to_the_stack() {
    assert_eq!(
        run_program(
            "int seven_args(int a,int b,int c,int d,int e,int f,int g){ return g; } \
             int main(){ return seven_args(1,2,3,4,5,6,77); }"
        ),
        77
    );
}

#[test]
fn eighth_parameter_ordering_is_preserved() {
    assert_eq!(
        run_program(
            "int eight_args(int a,int b,int c,int d,int e,int f,int g,int h){ return h - g; } \
             int main(){ return eight_args(1,2,3,4,5,6,10,20); }"
        ),
        10
    );
}

#[test]
fn zero_parameter_function_returns_zero() {
    assert_eq!(run_program("int main(){ return 0; }"), 0);
}

#[test]
fn division_rounds_toward_zero() {
    assert_eq!(run_program("int main(){ return -7/2; }"), -3);
}

#[test]
fn right_shift_of_a_signed_value_sign_extends() {
    assert_eq!(run_program("int main(){ int x = -8; return x >> 1; }"), -4);
}

#[test]
fn if_else_selects_the_right_branch() {
    assert_eq!(
        run_program("int main(){ int x = 0; if (1) { x = 1; } else { x = 2; } return x; }"),
        1
    );
    assert_eq!(
        run_program("int main(){ int x = 0; if (0) { x = 1; } else { x = 2; } return x; }"),
        2
    );
}

#[test]
fn reassigned_parameter_is_still_usable_after_a_loop() {
    assert_eq!(
        run_program("int main(){ int n = 3; while (n < 10) { n = n + 1; } return n; }"),
        10
    );
}
