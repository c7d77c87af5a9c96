//! Public embedding facade.

use crate::debug;
use crate::error::Result;
use crate::object::{Obj, ObjRef};
use crate::value::Value;
use crate::vm::Vm;

/// Runtime debugging switches.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Run the collector on every allocation; shakes out rooting bugs.
    pub stress_gc: bool,
    /// Disassemble each compiled function to stderr.
    pub print_code: bool,
    /// Emit a `trace`-level log line per executed instruction.
    pub trace_execution: bool,
}

/// An interpreter instance.
///
/// Globals, interned strings, and the heap persist across `interpret`
/// calls, so a REPL can feed one line at a time and definitions stick.
///
/// # Example
///
/// ```
/// use lark::Interpreter;
///
/// let mut interpreter = Interpreter::new();
/// interpreter.capture_output();
/// interpreter.interpret("print 1 + 2;").unwrap();
/// assert_eq!(interpreter.take_output(), "3\n");
/// ```
pub struct Interpreter {
    vm: Vm,
    options: Options,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let mut vm = Vm::new();
        vm.set_stress_gc(options.stress_gc);
        vm.set_trace_execution(options.trace_execution);
        Interpreter { vm, options }
    }

    /// Compile and run `source` to completion.
    ///
    /// Returns [`crate::Error::Compile`] with every diagnostic when the
    /// source does not compile, and [`crate::Error::Runtime`] with a
    /// backtrace when execution fails; the VM is reset and stays usable
    /// either way.
    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let function = self.vm.compile_source(source)?;
        if self.options.print_code {
            eprint!("{}", self.dump(function));
        }
        self.vm.run_function(function)
    }

    /// Redirect `print` output into an internal buffer instead of stdout.
    pub fn capture_output(&mut self) {
        self.vm.capture_output();
    }

    /// Drain the capture buffer. Empty when printing to stdout.
    pub fn take_output(&mut self) -> String {
        self.vm.take_output()
    }

    /// Disassemble `function` and every function reachable from its
    /// constant pool.
    fn dump(&self, function: ObjRef) -> String {
        let heap = self.vm.heap();
        let mut out = String::new();
        let mut pending = vec![function];
        while let Some(r) = pending.pop() {
            let function = heap.function(r);
            let name = match function.name {
                Some(name) if !heap.string(name).is_empty() => heap.string(name).to_string(),
                _ => "<script>".to_string(),
            };
            out.push_str(&debug::disassemble_chunk(heap, &function.chunk, &name));
            for value in &function.chunk.constants {
                if let Value::Obj(constant) = value {
                    if matches!(heap.get(*constant), Obj::Function(_)) {
                        pending.push(*constant);
                    }
                }
            }
        }
        out
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}
