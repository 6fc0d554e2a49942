//! Whole-program assembly.
//!
//! `compile_program` lowers the top level into the `@script` function
//! (with the native closures bootstrapped in its prologue), then renders
//! the module: target triple, types, libc declarations, constants,
//! globals, the runtime helpers, the native functions, every compiled
//! Lox function, and finally `@main`, which initializes the intern table
//! and GC roots, runs the script, and tears the heap down.

use super::error::CodeGenError;
use super::state::{CodeGen, FunctionContext};
use super::value::{NIL_VAL, QNAN, SIGN_BIT, imm};
use super::{callstack, gc, memory, objects, runtime, stack, strings, table, value};
use lox_frontend::ast::Program;
use std::fmt::Write as _;

/// The native functions every program gets: name and arity.
const NATIVES: &[(&str, usize)] = &[
    ("clock", 0),
    ("exit", 1),
    ("read", 0),
    ("utf", 4),
    ("printerr", 1),
];

impl CodeGen {
    /// Compile a resolved program into a complete textual IR module.
    pub fn compile_program(&mut self, program: &Program) -> Result<String, CodeGenError> {
        self.push_function(
            "script".to_string(),
            "script".to_string(),
            FunctionContext::Script,
            &[],
        );
        self.emit_native_bootstrap()?;
        for stmt in program {
            self.lower_stmt(stmt)?;
        }
        self.pop_function()?;

        let main = self.render_main()?;

        let mut module = String::new();
        writeln!(module, "target triple = \"{}\"", self.target_triple)?;
        writeln!(module)?;
        module.push_str(runtime::TYPE_DEFINITIONS);
        writeln!(module)?;
        for declaration in runtime::LIBC_DECLARATIONS {
            writeln!(module, "{}", declaration)?;
        }
        writeln!(module)?;
        runtime::emit_runtime_strings(&mut module)?;
        module.push_str(&self.string_globals);
        writeln!(module)?;
        runtime::emit_runtime_globals(&mut module)?;
        for global in &self.globals {
            writeln!(module, "{}", runtime::uninitialized_global(global))?;
        }
        writeln!(module)?;

        value::emit_truthy(&mut module)?;
        memory::emit_allocate_object(&mut module, self.stress_gc)?;
        memory::emit_free_object(&mut module)?;
        memory::emit_free_objects(&mut module)?;
        table::emit_all(&mut module)?;
        strings::emit_all(&mut module)?;
        stack::emit_all(&mut module)?;
        callstack::emit_all(&mut module)?;
        objects::emit_all(&mut module)?;
        gc::emit_all(&mut module)?;
        emit_native_functions(&mut module)?;

        module.push_str(&self.functions);
        module.push_str(&main);
        Ok(module)
    }

    /// Wrap each native IR function in a native closure bound to its
    /// global, in the script prologue.
    fn emit_native_bootstrap(&mut self) -> Result<(), CodeGenError> {
        for (name, arity) in NATIVES {
            let name_const = self.string_const(name)?;
            let name_str = self.fresh_temp();
            self.emit(format!(
                "{} = call ptr @$internString(ptr {}, i32 {})",
                name_str, name_const.global, name_const.len
            ));
            self.emit_push_temp_obj(&name_str);

            let function = self.fresh_temp();
            self.emit(format!(
                "{} = call ptr @$allocateFunction(ptr @native.{}, ptr {}, i32 {}, i1 true)",
                function, name, name_str, arity
            ));
            self.emit_push_temp_obj(&function);

            let closure = self.fresh_temp();
            self.emit(format!(
                "{} = call ptr @$allocateClosure(ptr {})",
                closure, function
            ));
            let value = self.emit_obj_val(&closure);
            self.define_variable(name, &value);
            self.emit_pop_temps(2);
        }
        Ok(())
    }

    /// `@main`: intern table and `$initString` first, then the global
    /// root registrations, the script itself, and the heap teardown.
    fn render_main(&mut self) -> Result<String, CodeGenError> {
        let init_const = self.string_const("init")?;
        let mut out = String::new();
        out.push_str("define i32 @main() {\nentry:\n");
        writeln!(out, "  %table = call ptr @$allocateTable()")?;
        writeln!(out, "  store ptr %table, ptr @strings")?;
        writeln!(
            out,
            "  %init = call ptr @$internString(ptr {}, i32 {})",
            init_const.global, init_const.len
        )?;
        writeln!(out, "  store ptr %init, ptr @initString")?;
        for global in &self.globals {
            writeln!(
                out,
                "  call void @$stackPush(ptr @stack.globals, ptr @g{})",
                global
            )?;
        }
        writeln!(out, "  %ignored = call i64 @script()")?;
        writeln!(out, "  call void @$freeObjects()")?;
        writeln!(out, "  %interned = load ptr, ptr @strings")?;
        writeln!(out, "  call void @$freeTable(ptr %interned)")?;
        writeln!(out, "  call void @$stackFree(ptr @stack.globals)")?;
        writeln!(out, "  call void @$stackFree(ptr @stack.locals)")?;
        writeln!(out, "  call void @$stackFree(ptr @stack.gray)")?;
        writeln!(out, "  ret i32 0")?;
        out.push_str("}\n");
        Ok(out)
    }
}

/// Emit the native function definitions. All share the user-function
/// signature so closure dispatch needs no special case.
fn emit_native_functions(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal i64 @native.clock(i64 %receiver, ptr %upvalues) {{
entry:
  %ticks = call i64 @clock()
  %scaled = sitofp i64 %ticks to double
  %seconds = fdiv double %scaled, 1.000000e+06
  %bits = bitcast double %seconds to i64
  ret i64 %bits
}}
"
    )?;

    writeln!(
        out,
        "define internal i64 @native.exit(i64 %receiver, ptr %upvalues, i64 %p0) {{
entry:
  %masked = and i64 %p0, {qnan}
  %is.num = icmp ne i64 %masked, {qnan}
  br i1 %is.num, label %ok, label %bad
bad:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.operand)
  call void @$printStackTrace()
  call void @exit(i32 70)
  unreachable
ok:
  %num = bitcast i64 %p0 to double
  %code = fptosi double %num to i32
  call void @exit(i32 %code)
  unreachable
}}
",
        qnan = imm(QNAN)
    )?;

    writeln!(
        out,
        "define internal i64 @native.read(i64 %receiver, ptr %upvalues) {{
entry:
  %char = call i32 @getchar()
  %eof = icmp eq i32 %char, -1
  br i1 %eof, label %end.of.input, label %byte
end.of.input:
  ret i64 {nil}
byte:
  %num = sitofp i32 %char to double
  %bits = bitcast double %num to i64
  ret i64 %bits
}}
",
        nil = imm(NIL_VAL)
    )?;

    emit_native_utf(out)?;

    writeln!(
        out,
        "define internal i64 @native.printerr(i64 %receiver, ptr %upvalues, i64 %p0) {{
entry:
  call void @$printErr(i64 %p0)
  ret i64 {nil}
}}
",
        nil = imm(NIL_VAL)
    )
}

/// `utf(a, b, c, d)`: compose up to four bytes into an interned string.
/// Nils after the first argument are skipped; anything else must be a
/// number in 0..=255.
fn emit_native_utf(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal i64 @native.utf(i64 %receiver, ptr %upvalues, i64 %p0, i64 %p1, i64 %p2, i64 %p3) {{
entry:
  %buf = alloca [4 x i8], align 1
  %count = alloca i32, align 4
  store i32 0, ptr %count
  br label %arg.0"
    )?;

    for i in 0..4 {
        let next = if i == 3 {
            "compose".to_string()
        } else {
            format!("arg.{}", i + 1)
        };
        if i == 0 {
            writeln!(out, "arg.0:\n  br label %check.0")?;
        } else {
            writeln!(
                out,
                "arg.{i}:
  %nil.{i} = icmp eq i64 %p{i}, {nil}
  br i1 %nil.{i}, label %{next}, label %check.{i}",
                i = i,
                nil = imm(NIL_VAL),
                next = next
            )?;
        }
        writeln!(
            out,
            "check.{i}:
  %masked.{i} = and i64 %p{i}, {qnan}
  %is.num.{i} = icmp ne i64 %masked.{i}, {qnan}
  br i1 %is.num.{i}, label %range.{i}, label %invalid
range.{i}:
  %num.{i} = bitcast i64 %p{i} to double
  %lo.{i} = fcmp oge double %num.{i}, 0.000000e+00
  %hi.{i} = fcmp ole double %num.{i}, 2.550000e+02
  %in.{i} = and i1 %lo.{i}, %hi.{i}
  br i1 %in.{i}, label %store.{i}, label %invalid
store.{i}:
  %byte.{i} = fptoui double %num.{i} to i8
  %n.{i} = load i32, ptr %count
  %slot.{i} = getelementptr inbounds [4 x i8], ptr %buf, i32 0, i32 %n.{i}
  store i8 %byte.{i}, ptr %slot.{i}
  %n.next.{i} = add i32 %n.{i}, 1
  store i32 %n.next.{i}, ptr %count
  br label %{next}",
            i = i,
            qnan = imm(QNAN),
            next = next
        )?;
    }

    writeln!(
        out,
        "compose:
  %length = load i32, ptr %count
  %str = call ptr @$internString(ptr %buf, i32 %length)
  %bits = ptrtoint ptr %str to i64
  %value = or i64 %bits, {objmask}
  ret i64 %value
invalid:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.utf)
  call void @$printStackTrace()
  call void @exit(i32 70)
  unreachable
}}
",
        objmask = imm(QNAN | SIGN_BIT)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lox_frontend::{ErrorReporter, parse_and_resolve};

    fn compile(source: &str) -> String {
        let mut reporter = ErrorReporter::new();
        let program = parse_and_resolve(source, &mut reporter);
        assert!(!reporter.had_error(), "compile errors in test source");
        let mut codegen = CodeGen::new(false, "x86_64-unknown-linux-gnu".to_string());
        codegen.compile_program(&program).expect("codegen failed")
    }

    #[test]
    fn test_module_skeleton() {
        let ir = compile("print 1;");
        assert!(ir.contains("target triple = \"x86_64-unknown-linux-gnu\""));
        assert!(ir.contains("%Obj = type { i8, i1, ptr }"));
        assert!(ir.contains("define internal i64 @script()"));
        assert!(ir.contains("define i32 @main()"));
        assert!(ir.contains("declare i32 @printf(ptr, ...)"));
    }

    #[test]
    fn test_main_bootstraps_and_tears_down() {
        let ir = compile("print 1;");
        let main_at = ir.find("define i32 @main()").unwrap();
        let main = &ir[main_at..];
        assert!(main.contains("store ptr %table, ptr @strings"));
        assert!(main.contains("store ptr %init, ptr @initString"));
        assert!(main.contains("call void @$freeObjects()"));
        assert!(main.contains("ret i32 0"));
    }

    #[test]
    fn test_natives_are_bootstrapped_into_globals() {
        let ir = compile("print clock();");
        for native in ["clock", "exit", "read", "utf", "printerr"] {
            assert!(
                ir.contains(&format!("@g{} = internal global i64", native)),
                "missing global for {}",
                native
            );
            assert!(ir.contains(&format!("define internal i64 @native.{}", native)));
        }
        // Natives are flagged native in their function objects.
        assert!(ir.contains("i1 true)"));
    }

    #[test]
    fn test_print_statement_lowers_to_runtime_call() {
        let ir = compile("print 1 + 2 * 3;");
        assert!(ir.contains("call void @$print(i64"));
        assert!(ir.contains("fmul double"));
        assert!(ir.contains("fadd double"));
    }

    #[test]
    fn test_number_literals_are_bitcast_constants() {
        let ir = compile("print 7;");
        assert!(ir.contains(&imm(7.0f64.to_bits())));
    }

    #[test]
    fn test_string_literal_interned_once() {
        let ir = compile("print \"hi\"; print \"hi\";");
        // One constant, two intern calls.
        assert_eq!(ir.matches("c\"hi\\00\"").count(), 1);
    }

    #[test]
    fn test_global_definition_and_checked_read() {
        let ir = compile("var a = 1; print a;");
        assert!(ir.contains("@ga = internal global i64"));
        assert!(ir.contains("store i64"));
        // Reads go through the uninitialized check.
        assert!(ir.contains("global.undefined"));
    }

    #[test]
    fn test_function_declaration_produces_closure() {
        let ir = compile("fun f() { return 1; } print f();");
        assert!(ir.contains("define internal i64 @fn.f."));
        assert!(ir.contains("call ptr @$allocateClosure(ptr"));
        assert!(ir.contains("call void @$pushCall(i32"));
        assert!(ir.contains("call void @$popCall()"));
    }

    #[test]
    fn test_closure_capture_emits_upvalues() {
        let ir = compile(
            "fun makeCounter() { var n = 0; fun c() { n = n + 1; return n; } return c; } \
             var c = makeCounter(); print c();",
        );
        assert!(ir.contains("call ptr @$allocateUpvalueArray(ptr"));
        assert!(ir.contains("call ptr @$allocateUpvalue(ptr"));
        assert!(ir.contains("call void @$closeUpvalues(ptr"));
    }

    #[test]
    fn test_class_with_inheritance() {
        let ir = compile(
            "class A { hi() { print 1; } } class B < A { hi() { super.hi(); } } B().hi();",
        );
        assert!(ir.contains("call ptr @$allocateClass(ptr"));
        assert!(ir.contains("call void @$tableAddAll(ptr"));
        assert!(ir.contains("call ptr @$bindMethod(i64"));
        assert!(ir.contains("Superclass must be a class."));
    }

    #[test]
    fn test_initializer_returns_receiver() {
        let ir = compile("class P { init(x) { this.x = x; } } print P(42).x;");
        assert!(ir.contains("define internal i64 @method.init."));
        assert!(ir.contains("ret i64 %receiver"));
        assert!(ir.contains("call ptr @$allocateInstance(ptr"));
    }

    #[test]
    fn test_runtime_error_paths_exit_70() {
        let ir = compile("var x; x();");
        assert!(ir.contains("Can only call functions and classes."));
        assert!(ir.contains("call void @$printStackTrace()"));
        assert!(ir.contains("call void @exit(i32 70)"));
    }

    #[test]
    fn test_stress_mode_changes_allocator() {
        let mut reporter = ErrorReporter::new();
        let program = parse_and_resolve("print 1;", &mut reporter);
        let mut codegen = CodeGen::new(true, "x86_64-unknown-linux-gnu".to_string());
        let ir = codegen.compile_program(&program).unwrap();
        let allocate_at = ir.find("define internal ptr @$allocateObject").unwrap();
        let body = &ir[allocate_at..allocate_at + 600];
        assert!(!body.contains("@nextGC"));
    }

    #[test]
    fn test_logical_or_produces_operand_value() {
        let ir = compile("print 1 or 2;");
        // The merge is a phi over the operand values, not booleans.
        assert!(ir.contains("phi i64"));
    }

    #[test]
    fn test_while_loop_shape() {
        let ir = compile("var i = 0; while (i < 3) { i = i + 1; }");
        assert!(ir.contains("while.cond"));
        assert!(ir.contains("while.body"));
        assert!(ir.contains("while.exit"));
    }
}
