// End-to-end runs through the public API

use mathvm_core::binary;
use mathvm_core::compiler::asm::assemble_listing;
use mathvm_core::compiler::bytecode::{Bytecode, Immediate};
use mathvm_core::compiler::{Function, FunctionBody, OpCode};
use mathvm_core::error::ErrorKind;
use mathvm_core::vm::NativeValue;
use mathvm_core::{
    translate, Code, Error, Interpreter, NativeRegistry, Translator, Var, VarType, VarValue,
};

fn run_code(code: &Code, vars: &mut [Var]) -> Result<String, Error> {
    let mut out = Vec::new();
    Interpreter::new(code).with_output(&mut out).execute(vars)?;
    Ok(String::from_utf8(out).unwrap())
}

fn run(source: &str) -> String {
    let code = translate(source).unwrap_or_else(|e| panic!("{}", e));
    run_code(&code, &mut []).unwrap_or_else(|e| panic!("{}", e))
}

fn translation_kind(source: &str) -> ErrorKind {
    match translate(source) {
        Err(Error::Translation(e)) => e.kind,
        Err(other) => panic!("expected translation error, got {}", other),
        Ok(_) => panic!("expected translation error for {:?}", source),
    }
}

#[test]
fn test_precedence() {
    assert_eq!(run("int x; x = 2 + 3 * 4; print(x);"), "14");
}

#[test]
fn test_int_assigned_to_double() {
    let code = translate("double a; a = 1; print(a);").unwrap();
    let listing = code.disassemble_to_string();
    assert!(listing.contains("ILOAD1\n1: I2D\n2: STOREDVAR @0"), "{}", listing);
    assert_eq!(run_code(&code, &mut []).unwrap(), "1.0");
}

#[test]
fn test_recursive_factorial() {
    let source = "function int fact(int n) {\n\
                    if (n <= 1) { return 1; }\n\
                    return n * fact(n - 1);\n\
                  }\n\
                  print(fact(5));";
    assert_eq!(run(source), "120");
}

#[test]
fn test_undeclared_variable() {
    assert_eq!(translation_kind("print(y);"), ErrorKind::UndefinedVariable);
}

#[test]
fn test_string_arithmetic_rejected() {
    assert_eq!(
        translation_kind("string s; s = 'a'; print(s + 1);"),
        ErrorKind::TypeMismatch
    );
}

#[test]
fn test_hand_crafted_underflow() {
    let mut bytecode = Bytecode::new();
    bytecode.emit(OpCode::ILoad1, Immediate::None);
    bytecode.emit(OpCode::Pop, Immediate::None);
    bytecode.emit(OpCode::Pop, Immediate::None);
    bytecode.emit(OpCode::Stop, Immediate::None);

    let mut code = Code::new();
    code.add_function(Function {
        name: "<top>".to_string(),
        id: 0,
        context_id: 0,
        params: Vec::new(),
        return_type: VarType::Void,
        locals_count: 0,
        body: FunctionBody::Bytecode(bytecode),
    });

    match run_code(&code, &mut []) {
        Err(Error::Runtime(e)) => {
            assert_eq!(e.offset, 2);
            assert_eq!(e.function, "<top>");
            assert!(e.to_string().contains("at offset 2"));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn test_repeated_interpretation_is_deterministic() {
    let code = translate(
        "double x = 1; int i; for (i in 1..20) { x = x * 1.1 + i; } print(x, ' ', i);",
    )
    .unwrap();
    let first = run_code(&code, &mut []).unwrap();
    let second = run_code(&code, &mut []).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_translation_is_reproducible() {
    let source = "string greeting = 'hi';\n\
                  function void greet(string who) { print(greeting, ' ', who, '\\n'); }\n\
                  greet('a'); greet('b'); greet('hi');";
    let a = translate(source).unwrap();
    let b = translate(source).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.disassemble_to_string(), b.disassemble_to_string());
    assert_eq!(run_code(&a, &mut []).unwrap(), "hi a\nhi b\nhi hi\n");
}

#[test]
fn test_mutual_recursion() {
    let source = "function int is_even(int n) { if (n == 0) { return 1; } return is_odd(n - 1); }\n\
                  function int is_odd(int n) { if (n == 0) { return 0; } return is_even(n - 1); }\n\
                  print(is_even(10), is_odd(7), is_even(3));";
    assert_eq!(run(source), "110");
}

#[test]
fn test_closure_style_counter() {
    let source = "int counter = 0;\n\
                  function void tick(int by) { counter += by; }\n\
                  function int twice(int v) {\n\
                    function int add_v(int w) { return w + v; }\n\
                    return add_v(v);\n\
                  }\n\
                  int i;\n\
                  for (i in 1..3) { tick(twice(i)); }\n\
                  print(counter);";
    // 2 + 4 + 6
    assert_eq!(run(source), "12");
}

#[test]
fn test_else_if_chain_and_while() {
    let source = "int n = 0;\n\
                  while (n < 6) {\n\
                    if (n == 0) { print('zero'); }\n\
                    else if (n % 2 == 0) { print('even'); }\n\
                    else { print('odd'); }\n\
                    print(' ');\n\
                    n += 1;\n\
                  }";
    assert_eq!(run(source), "zero odd even odd even odd ");
}

#[test]
fn test_compound_assignment_and_doubles() {
    let source = "double d = 10; d /= 4; d -= 0.5; d *= 3; int k = 7; k /= 2; k *= -1; print(d, ' ', k);";
    assert_eq!(run(source), "6.0 -3");
}

#[test]
fn test_comments_and_strings() {
    let source = "/* outer /* nested */ still comment */\n\
                  // line comment\n\
                  print(\"dq\", 'sq\\t', '');";
    assert_eq!(run(source), "dqsq\t");
}

#[test]
fn test_external_variables() {
    let code = translate("int n; double scale; string label; print(label, n * scale); n = n + 1; label = 'done';").unwrap();
    let mut vars = vec![
        Var::new("n", VarValue::Int(4)),
        Var::new("scale", VarValue::Double(0.5)),
        Var::new("label", VarValue::Str("x=".to_string())),
    ];
    assert_eq!(run_code(&code, &mut vars).unwrap(), "x=2.0");
    assert_eq!(vars[0].value, VarValue::Int(5));
    assert_eq!(vars[1].value, VarValue::Double(0.5));
    assert_eq!(vars[2].value, VarValue::Str("done".to_string()));
}

#[test]
fn test_custom_native_registry() {
    fn triple(args: &[NativeValue]) -> Result<NativeValue, String> {
        Ok(NativeValue::Int(args[0].as_int()? * 3))
    }

    let mut natives = NativeRegistry::with_builtins();
    natives.register(
        "triple",
        mathvm_core::compiler::NativeSignature::new(VarType::Int, &[VarType::Int]),
        triple,
    );
    let code = Translator::with_natives(natives.clone())
        .translate("function int triple(int x) native 'triple'; print(triple(14));")
        .unwrap();

    let mut out = Vec::new();
    Interpreter::new(&code)
        .with_natives(natives)
        .with_output(&mut out)
        .execute(&mut [])
        .unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "42");
}

#[test]
fn test_builtin_math_natives() {
    let source = "function double pow(double b, double e) native 'pow';\n\
                  function double floor(double x) native 'floor';\n\
                  function int abs(int x) native 'abs';\n\
                  function int atoi(string s) native 'atoi';\n\
                  print(pow(2, 10), ' ', floor(-1.5), ' ', abs(-9), ' ', atoi('12abc'));";
    assert_eq!(run(source), "1024.0 -2.0 9 12");
}

#[test]
fn test_translation_errors() {
    assert_eq!(
        translation_kind("function int f(int a) { return a; } print(f());"),
        ErrorKind::ArityMismatch
    );
    assert_eq!(
        translation_kind("function int f(int a) { if (a) { return 1; } }"),
        ErrorKind::MissingReturn
    );
    assert_eq!(
        translation_kind("function void f(int a) { int a; }"),
        ErrorKind::DuplicateVariable
    );
    assert_eq!(translation_kind("int x = ;"), ErrorKind::Syntax);
    assert_eq!(translation_kind("nope(1);"), ErrorKind::UndefinedFunction);
}

#[test]
fn test_shadowing_in_nested_block() {
    let source = "int x = 1; { int x = 2; print(x); } print(x);";
    assert_eq!(run(source), "21");
}

#[test]
fn test_runtime_error_keeps_earlier_output() {
    let code = translate("print('before'); int z; print(5 % z);").unwrap();
    let mut out = Vec::new();
    let err = Interpreter::new(&code)
        .with_output(&mut out)
        .execute(&mut [])
        .unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert_eq!(String::from_utf8(out).unwrap(), "before");
}

#[test]
fn test_listing_reassembles() {
    let source = "int i; double s = 0;\n\
                  function double half(double v) { return v / 2; }\n\
                  for (i in 0..8) { if (i > 2 || i == 0) { s += half(i); } }\n\
                  print(s);";
    let code = translate(source).unwrap();
    let listing = assemble_listing(&code.disassemble_to_string()).unwrap();
    for (function, assembled) in code.functions().iter().zip(&listing) {
        assert_eq!(Some(&assembled.bytecode), function.bytecode());
    }
}

#[test]
fn test_compiled_file_runs_identically() {
    let source = "function int sq(int v) { return v * v; } int i; for (i in 1..4) { print(sq(i), ','); }";
    let code = translate(source).unwrap();
    let restored = binary::deserialize(&binary::serialize(&code)).unwrap();
    assert_eq!(run_code(&restored, &mut []).unwrap(), "1,4,9,16,");
}
