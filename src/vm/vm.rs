use colored::*;

use super::instruction::OpCode;
use super::value::Value;
use super::{CallFrame, Result, RuntimeError, MAX_FRAMES};
use crate::debug::{self, TRACE_EXECUTION};
use crate::memory::{
    BoundMethod, Class, Closure, Function, Gc, Instance, NativeFn, NativeFunction, Object,
    Upvalue, GC,
};

/// The bytecode interpreter. All mutable state (value stack, call frames,
/// globals, open upvalues) lives in the garbage collector so that root
/// discovery sees a consistent view; the VM is just the dispatch logic on
/// top of that state.
pub struct VM<'gc> {
    gc: &'gc mut GC,
}

impl<'gc> VM<'gc> {
    pub fn new(gc: &'gc mut GC) -> Self {
        let mut vm = Self { gc };
        vm.define_native("clock", native_clock);
        vm.define_native("print", native_print);
        vm
    }

    /// Wraps the compiled script in a closure, pushes the initial call frame
    /// and runs to completion. On a runtime error the message and a stack
    /// trace are printed to stderr and the VM state is reset so a REPL can
    /// keep going.
    pub fn interpret_function(&mut self, function: Function) -> Result<()> {
        let function = self.gc.track_function(function);
        self.gc.stack.push(function.into());
        let closure = self.gc.track_closure(Closure::new(function), false);
        self.gc.stack.pop();
        self.gc.stack.push(closure.into());

        let result = self
            .call_value(closure.into(), 0)
            .and_then(|()| self.run());

        if let Err(err) = result {
            eprintln!("{}", err);
            self.print_stack_trace();
            self.reset();
            return Err(err);
        }
        Ok(())
    }

    fn define_native(&mut self, name: &str, fun: NativeFunction) {
        let native = self.gc.track_native(NativeFn::new(fun));
        self.gc.globals.insert(name.to_owned(), native.into());
    }

    fn print_stack_trace(&self) {
        for frame in self.gc.call_frames.iter().rev() {
            let function = frame.function();
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            match &function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, name.as_string()),
                None => eprintln!("[line {}] in script", line),
            }
        }
    }

    fn reset(&mut self) {
        self.gc.stack.clear();
        self.gc.call_frames.clear();
        self.gc.open_upvalues.clear();
    }

    fn run(&mut self) -> Result<()> {
        loop {
            if TRACE_EXECUTION {
                self.trace_instruction()?;
            }

            let instruction = OpCode::from(self.read_byte()?);
            match instruction {
                OpCode::Constant => {
                    let constant = self.read_constant()?;
                    self.gc.stack.push(constant);
                }
                OpCode::Nil => self.gc.stack.push(Value::Nil),
                OpCode::True => self.gc.stack.push(Value::Bool(true)),
                OpCode::False => self.gc.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.stack_base;
                    let value = self
                        .gc
                        .stack
                        .get(base + slot)
                        .cloned()
                        .ok_or(RuntimeError::EmptyStack)?;
                    self.gc.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frame()?.stack_base;
                    let value = self.peek(0)?.clone();
                    *self
                        .gc
                        .stack
                        .get_mut(base + slot)
                        .ok_or(RuntimeError::EmptyStack)? = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant()?.as_object();
                    let value = self
                        .gc
                        .globals
                        .get(name.as_string())
                        .cloned()
                        .ok_or_else(|| {
                            RuntimeError::UndefinedVariable(name.as_string().clone())
                        })?;
                    self.gc.stack.push(value);
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant()?.as_object();
                    let value = self.peek(0)?.clone();
                    self.gc.globals.insert(name.as_string().clone(), value);
                    self.pop()?;
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant()?.as_object();
                    let value = self.peek(0)?.clone();
                    match self.gc.globals.get_mut(name.as_string()) {
                        Some(slot) => *slot = value,
                        None => {
                            return Err(RuntimeError::UndefinedVariable(
                                name.as_string().clone(),
                            ))
                        }
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let upvalue = self.upvalue_at(slot)?;
                    let value = upvalue.as_upvalue().get(self.gc);
                    self.gc.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let value = self.peek(0)?.clone();
                    let mut upvalue = self.upvalue_at(slot)?;
                    match upvalue.as_upvalue_mut() {
                        Upvalue::Open(index) => {
                            let index = *index;
                            *self
                                .gc
                                .stack
                                .get_mut(index)
                                .ok_or(RuntimeError::EmptyStack)? = value;
                        }
                        Upvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self
                        .gc
                        .stack
                        .len()
                        .checked_sub(1)
                        .ok_or(RuntimeError::EmptyStack)?;
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Equal => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.gc.stack.push(Value::Bool(lhs == rhs));
                }
                OpCode::Greater => {
                    self.binary_number_op(|lhs, rhs| Value::Bool(lhs > rhs))?;
                }
                OpCode::Less => {
                    self.binary_number_op(|lhs, rhs| Value::Bool(lhs < rhs))?;
                }
                OpCode::Add => {
                    let rhs = self.peek(0)?.clone();
                    let lhs = self.peek(1)?.clone();
                    match (&lhs, &rhs) {
                        (Value::Number(lhs), Value::Number(rhs)) => {
                            let sum = lhs + rhs;
                            self.pop()?;
                            self.pop()?;
                            self.gc.stack.push(Value::Number(sum));
                        }
                        (Value::Object(lhs), Value::Object(rhs)) => {
                            match (lhs.as_ref(), rhs.as_ref()) {
                                (Object::String(lhs), Object::String(rhs)) => {
                                    let result =
                                        self.gc.track_string(format!("{}{}", lhs, rhs));
                                    self.pop()?;
                                    self.pop()?;
                                    self.gc.stack.push(result.into());
                                }
                                _ => return Err(RuntimeError::BadAddOperands),
                            }
                        }
                        _ => return Err(RuntimeError::BadAddOperands),
                    }
                }
                OpCode::Subtract => {
                    self.binary_number_op(|lhs, rhs| Value::Number(lhs - rhs))?;
                }
                OpCode::Multiply => {
                    self.binary_number_op(|lhs, rhs| Value::Number(lhs * rhs))?;
                }
                OpCode::Divide => {
                    self.binary_number_op(|lhs, rhs| Value::Number(lhs / rhs))?;
                }
                OpCode::Not => {
                    let value = self.pop()?;
                    self.gc.stack.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(v) => self.gc.stack.push(Value::Number(-v)),
                        _ => return Err(RuntimeError::OperandMustBeNumber),
                    }
                }
                OpCode::Jump => {
                    let offset = self.read_short()?;
                    self.frame_mut()?.ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short()?;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_short()?;
                    if !self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short()?;
                    self.frame_mut()?.ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte()? as usize;
                    let callee = self.peek(arg_count)?.clone();
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    let function = self.read_constant()?.as_object();
                    let closure = Closure::new(function);
                    let upvalue_count = closure.upvalue_count;
                    let mut closure = self.gc.track_closure(closure, true);
                    self.gc.stack.push(closure.into());

                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte()? == 1;
                        let index = self.read_byte()? as usize;
                        let upvalue = if is_local {
                            let base = self.frame()?.stack_base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.upvalue_at(index)?
                        };
                        closure.as_closure_mut().upvalues.push(upvalue);
                    }
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .gc
                        .call_frames
                        .pop()
                        .ok_or(RuntimeError::NoCallFrame)?;
                    self.close_upvalues(frame.stack_base);

                    if self.gc.call_frames.is_empty() {
                        // The slot left on the stack is the script closure.
                        self.pop()?;
                        return Ok(());
                    }

                    self.gc.stack.truncate(frame.stack_base);
                    self.gc.stack.push(result);
                }
                OpCode::Class => {
                    let name = self.read_constant()?.as_object();
                    let class = self.gc.track_class(Class::new(name), true);
                    self.gc.stack.push(class.into());
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1)? {
                        Value::Object(object)
                            if matches!(object.as_ref(), Object::Class(_)) =>
                        {
                            *object
                        }
                        _ => return Err(RuntimeError::SuperclassNotAClass),
                    };
                    let mut subclass = self.peek(0)?.as_object();
                    let methods = superclass.as_class().methods.clone();
                    subclass.as_class_mut().methods = methods;
                    self.pop()?;
                }
                OpCode::Method => {
                    let name = self.read_constant()?.as_object();
                    let method = self.peek(0)?.as_object();
                    let mut class = self.peek(1)?.as_object();
                    class
                        .as_class_mut()
                        .methods
                        .insert(name.as_string().clone(), method);
                    self.pop()?;
                }
                OpCode::GetProperty => {
                    let name = self.read_constant()?.as_object();
                    let instance = match self.peek(0)? {
                        Value::Object(object)
                            if matches!(object.as_ref(), Object::Instance(_)) =>
                        {
                            *object
                        }
                        _ => return Err(RuntimeError::PropertyOnNonInstance),
                    };

                    if let Some(value) =
                        instance.as_instance().fields.get(name.as_string()).cloned()
                    {
                        self.pop()?;
                        self.gc.stack.push(value);
                    } else {
                        let class = instance.as_instance().class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_constant()?.as_object();
                    let mut instance = match self.peek(1)? {
                        Value::Object(object)
                            if matches!(object.as_ref(), Object::Instance(_)) =>
                        {
                            *object
                        }
                        _ => return Err(RuntimeError::FieldOnNonInstance),
                    };

                    let value = self.peek(0)?.clone();
                    instance
                        .as_instance_mut()
                        .fields
                        .insert(name.as_string().clone(), value);

                    // Replace the instance with the assigned value so the
                    // assignment expression leaves its value behind.
                    let value = self.pop()?;
                    self.pop()?;
                    self.gc.stack.push(value);
                }
                OpCode::Invoke => {
                    let name = self.read_constant()?.as_object();
                    let arg_count = self.read_byte()? as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_constant()?.as_object();
                    let superclass = self.pop()?.as_object();
                    self.bind_method(superclass, name)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_constant()?.as_object();
                    let arg_count = self.read_byte()? as usize;
                    let superclass = self.pop()?.as_object();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
            }
        }
    }

    /// Invokes `stack[top - arg_count - 1]` with `arg_count` arguments.
    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<()> {
        if let Value::Object(object) = callee {
            match object.as_ref() {
                Object::Closure(_) => return self.call(object, arg_count),
                Object::Native(native) => {
                    let fun = native.fun;
                    let first = self.gc.stack.len() - arg_count;
                    let result = fun(&self.gc.stack[first..]);
                    self.gc.stack.truncate(first - 1);
                    self.gc.stack.push(result);
                    return Ok(());
                }
                Object::Class(_) => {
                    // The class itself still occupies the callee slot while
                    // the instance is allocated, keeping it rooted.
                    let instance =
                        self.gc.track_instance(Instance::new(object), true);
                    let receiver_slot = self.gc.stack.len() - arg_count - 1;
                    self.gc.stack[receiver_slot] = instance.into();

                    let initializer =
                        object.as_class().methods.get("init").copied();
                    return match initializer {
                        Some(initializer) => self.call(initializer, arg_count),
                        None if arg_count != 0 => Err(RuntimeError::ArityMismatch {
                            expected: 0,
                            got: arg_count as u8,
                        }),
                        None => Ok(()),
                    };
                }
                Object::BoundMethod(_) => {
                    let bound = object.as_bound_method();
                    let receiver = bound.receiver.clone();
                    let method = bound.method;
                    let receiver_slot = self.gc.stack.len() - arg_count - 1;
                    self.gc.stack[receiver_slot] = receiver;
                    return self.call(method, arg_count);
                }
                _ => {}
            }
        }
        Err(RuntimeError::NotCallable)
    }

    /// Pushes a frame for a closure after checking arity and call depth.
    fn call(&mut self, closure: Gc<Object>, arg_count: usize) -> Result<()> {
        let arity = closure.as_closure().function.as_function().arity;
        if arg_count != arity as usize {
            return Err(RuntimeError::ArityMismatch {
                expected: arity,
                got: arg_count as u8,
            });
        }

        if self.gc.call_frames.len() == MAX_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }

        let stack_base = self.gc.stack.len() - arg_count - 1;
        self.gc.call_frames.push(CallFrame::new(closure, stack_base));
        Ok(())
    }

    /// `GetProperty` + `Call` fused, with a fast path that skips allocating
    /// a bound method when the name resolves to a method. Fields shadow
    /// methods, as they do for plain property access.
    fn invoke(&mut self, name: Gc<Object>, arg_count: usize) -> Result<()> {
        let receiver_slot = self.gc.stack.len() - arg_count - 1;
        let instance = match &self.gc.stack[receiver_slot] {
            Value::Object(object) if matches!(object.as_ref(), Object::Instance(_)) => {
                *object
            }
            _ => return Err(RuntimeError::MethodOnNonInstance),
        };

        if let Some(field) = instance.as_instance().fields.get(name.as_string()).cloned()
        {
            self.gc.stack[receiver_slot] = field.clone();
            return self.call_value(field, arg_count);
        }

        let class = instance.as_instance().class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: Gc<Object>,
        name: Gc<Object>,
        arg_count: usize,
    ) -> Result<()> {
        let method = class
            .as_class()
            .methods
            .get(name.as_string())
            .copied()
            .ok_or_else(|| RuntimeError::UndefinedProperty(name.as_string().clone()))?;
        self.call(method, arg_count)
    }

    /// Replaces the receiver on top of the stack with a bound method for
    /// `name`, looked up on `class`.
    fn bind_method(&mut self, class: Gc<Object>, name: Gc<Object>) -> Result<()> {
        let method = class
            .as_class()
            .methods
            .get(name.as_string())
            .copied()
            .ok_or_else(|| RuntimeError::UndefinedProperty(name.as_string().clone()))?;

        // The receiver stays on the stack across the allocation safepoint.
        let receiver = self.peek(0)?.clone();
        let bound = self
            .gc
            .track_bound_method(BoundMethod::new(receiver, method), true);
        self.pop()?;
        self.gc.stack.push(bound.into());
        Ok(())
    }

    /// Reuses the open upvalue for a stack slot or allocates a new one,
    /// keeping the open list sorted by ascending slot.
    fn capture_upvalue(&mut self, index: usize) -> Gc<Object> {
        let position = self
            .gc
            .open_upvalues
            .binary_search_by_key(&index, |upvalue| upvalue.as_upvalue().as_open());
        match position {
            Ok(position) => self.gc.open_upvalues[position],
            Err(position) => {
                let upvalue = self.gc.track_upvalue(Upvalue::Open(index), true);
                self.gc.open_upvalues.insert(position, upvalue);
                upvalue
            }
        }
    }

    /// Closes every open upvalue pointing at `from` or above, copying the
    /// current stack value into the upvalue itself.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(upvalue) = self.gc.open_upvalues.last().copied() {
            let index = upvalue.as_upvalue().as_open();
            if index < from {
                break;
            }
            let value = self.gc.stack[index].clone();
            let mut upvalue = upvalue;
            upvalue.as_upvalue_mut().close(value);
            self.gc.open_upvalues.pop();
        }
    }

    fn binary_number_op(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        match (lhs, rhs) {
            (Value::Number(lhs), Value::Number(rhs)) => {
                self.gc.stack.push(op(lhs, rhs));
                Ok(())
            }
            _ => Err(RuntimeError::OperandsMustBeNumbers),
        }
    }

    fn frame(&self) -> Result<&CallFrame> {
        self.gc.call_frames.last().ok_or(RuntimeError::NoCallFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame> {
        self.gc
            .call_frames
            .last_mut()
            .ok_or(RuntimeError::NoCallFrame)
    }

    fn upvalue_at(&self, slot: usize) -> Result<Gc<Object>> {
        self.frame()?
            .closure
            .as_closure()
            .upvalues
            .get(slot)
            .copied()
            .ok_or(RuntimeError::InstructionOutOfBounds)
    }

    fn read_byte(&mut self) -> Result<u8> {
        self.frame_mut()?.next_byte()
    }

    fn read_short(&mut self) -> Result<usize> {
        self.frame_mut()?.next_short()
    }

    fn read_constant(&mut self) -> Result<Value> {
        self.frame_mut()?.next_constant()
    }

    fn peek(&self, distance: usize) -> Result<&Value> {
        let index = self
            .gc
            .stack
            .len()
            .checked_sub(distance + 1)
            .ok_or(RuntimeError::EmptyStack)?;
        self.gc.stack.get(index).ok_or(RuntimeError::EmptyStack)
    }

    fn pop(&mut self) -> Result<Value> {
        self.gc.stack.pop().ok_or(RuntimeError::EmptyStack)
    }

    fn trace_instruction(&self) -> Result<()> {
        let frame = self.frame()?;
        let (text, _) = debug::disassemble_instruction(&frame.function().chunk, frame.ip);
        let stack: String = self
            .gc
            .stack
            .iter()
            .map(|value| format!("[ {} ]", value))
            .collect();
        println!("{}\t{}", "[STACK]".yellow(), stack);
        println!("{}\t{:04}\t{}", "[INSTR]".green(), frame.ip, text);
        Ok(())
    }
}

fn native_clock(_args: &[Value]) -> Value {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}

fn native_print(args: &[Value]) -> Value {
    let rendered: Vec<String> = args.iter().map(Value::to_string).collect();
    println!("{}", rendered.join(", "));
    Value::Nil
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compiler::Compiler;
    use crate::compiler::parser::Parser;

    fn run(source: &str) -> std::result::Result<GC, RuntimeError> {
        run_with(GC::new(), source)
    }

    fn run_with(mut gc: GC, source: &str) -> std::result::Result<GC, RuntimeError> {
        let declarations = Parser::new(source).parse().expect("source should parse");
        let function = Compiler::new(&mut gc)
            .compile(&declarations)
            .expect("source should compile");
        let mut vm = VM::new(&mut gc);
        vm.interpret_function(function)?;
        Ok(gc)
    }

    fn number(gc: &GC, name: &str) -> f64 {
        match gc.globals[name] {
            Value::Number(n) => n,
            ref other => panic!("expected number, got {}", other),
        }
    }

    fn boolean(gc: &GC, name: &str) -> bool {
        match gc.globals[name] {
            Value::Bool(b) => b,
            ref other => panic!("expected bool, got {}", other),
        }
    }

    fn string(gc: &GC, name: &str) -> String {
        match &gc.globals[name] {
            Value::Object(object) => object.as_string().clone(),
            other => panic!("expected string, got {}", other),
        }
    }

    #[test]
    fn vm_raw_instructions() {
        use crate::compiler::chunk::Chunk;

        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::Number(1.2)) as u8;
        chunk.write_index(OpCode::Constant, index, 1);
        let index = chunk.add_constant(Value::Number(3.4)) as u8;
        chunk.write_index(OpCode::Constant, index, 1);
        chunk.write(OpCode::Add, 1);
        chunk.write(OpCode::Return, 2);

        let mut function = Function::script();
        function.chunk = chunk;

        let mut gc = GC::new();
        let mut vm = VM::new(&mut gc);
        assert!(vm.interpret_function(function).is_ok());
    }

    #[test]
    fn vm_arithmetic_precedence() {
        let gc = run("var r = 1 + 2 * 3;").unwrap();
        assert_eq!(number(&gc, "r"), 7.0);
    }

    #[test]
    fn vm_grouping_and_unary() {
        let gc = run("var r = (-1 + 2) * 3 - -4;").unwrap();
        assert_eq!(number(&gc, "r"), 7.0);
    }

    #[test]
    fn vm_comparisons() {
        let gc = run(
            r#"
            var a = 1 < 2;
            var b = 2 <= 2;
            var c = 3 > 4;
            var d = 4 >= 5;
            var e = 1 == 1;
            var f = 1 != 1;
            "#,
        )
        .unwrap();
        assert!(boolean(&gc, "a"));
        assert!(boolean(&gc, "b"));
        assert!(!boolean(&gc, "c"));
        assert!(!boolean(&gc, "d"));
        assert!(boolean(&gc, "e"));
        assert!(!boolean(&gc, "f"));
    }

    #[test]
    fn vm_not_and_truthiness() {
        let gc = run(
            r#"
            var a = !nil;
            var b = !false;
            var c = !0;
            var d = !!"";
            "#,
        )
        .unwrap();
        assert!(boolean(&gc, "a"));
        assert!(boolean(&gc, "b"));
        assert!(!boolean(&gc, "c"));
        assert!(boolean(&gc, "d"));
    }

    #[test]
    fn vm_string_concatenation() {
        let gc = run(r#"var s = "foo" + "bar";"#).unwrap();
        assert_eq!(string(&gc, "s"), "foobar");
    }

    #[test]
    fn vm_concatenated_strings_are_interned() {
        let gc = run(
            r#"
            var a = "he" + "llo";
            var b = "hello";
            var same = a == b;
            "#,
        )
        .unwrap();
        assert!(boolean(&gc, "same"));
    }

    #[test]
    fn vm_add_mixed_types_fails() {
        let err = run(r#"var r = "a" + 1;"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Operands to + must both be numbers or strings."
        );
    }

    #[test]
    fn vm_operands_must_be_numbers() {
        let err = run(r#"var r = "a" < 1;"#).unwrap_err();
        assert_eq!(err.to_string(), "Operands must be numbers.");
        let err = run(r#"var r = -"a";"#).unwrap_err();
        assert_eq!(err.to_string(), "Operand must be a number.");
    }

    #[test]
    fn vm_globals() {
        let gc = run("var a = 1; a = a + 1;").unwrap();
        assert_eq!(number(&gc, "a"), 2.0);
    }

    #[test]
    fn vm_undefined_global() {
        let err = run("var r = b;").unwrap_err();
        assert_eq!(err.to_string(), "Undefined variable 'b'.");
    }

    #[test]
    fn vm_assign_to_undefined_global() {
        let err = run("b = 1;").unwrap_err();
        assert_eq!(err.to_string(), "Undefined variable 'b'.");
    }

    #[test]
    fn vm_locals_and_shadowing() {
        let gc = run(
            r#"
            var r = 0;
            var a = 1;
            {
                var a = 2;
                {
                    var a = 3;
                    r = r + a;
                }
                r = r + a;
            }
            r = r + a;
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r"), 6.0);
    }

    #[test]
    fn vm_if_else() {
        let gc = run(
            r#"
            var a = 1;
            var b = 1;
            if (a == 1) { a = 10; } else { a = 20; }
            if (b == 2) { b = 100; } else { b = 200; }
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "a"), 10.0);
        assert_eq!(number(&gc, "b"), 200.0);
    }

    #[test]
    fn vm_and_or() {
        let gc = run(
            r#"
            var a = true and false;
            var b = true or false;
            var c = nil or "fallback";
            var d = nil and "skipped";
            "#,
        )
        .unwrap();
        assert!(!boolean(&gc, "a"));
        assert!(boolean(&gc, "b"));
        assert_eq!(string(&gc, "c"), "fallback");
        assert_eq!(gc.globals["d"], Value::Nil);
    }

    #[test]
    fn vm_while_loop() {
        let gc = run(
            r#"
            var sum = 0;
            var i = 0;
            while (i < 10) {
                sum = sum + i;
                i = i + 1;
            }
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "sum"), 45.0);
    }

    #[test]
    fn vm_for_loop() {
        let gc = run(
            r#"
            var sum = 0;
            for (var i = 0; i < 5; i = i + 1) {
                sum = sum + i;
            }
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "sum"), 10.0);
    }

    #[test]
    fn vm_fibonacci_recursive() {
        let gc = run(
            r#"
            fun fib(n) {
                if (n < 2) { return n; }
                return fib(n - 2) + fib(n - 1);
            }
            var r = fib(10);
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r"), 55.0);
    }

    #[test]
    fn vm_function_returns_nil_by_default() {
        let gc = run(
            r#"
            fun noop() {}
            var r = noop();
            "#,
        )
        .unwrap();
        assert_eq!(gc.globals["r"], Value::Nil);
    }

    #[test]
    fn vm_native_clock() {
        let gc = run("var t = clock();").unwrap();
        assert!(number(&gc, "t") > 0.0);
    }

    #[test]
    fn vm_print_statement() {
        assert!(run(r#"print 1 + 2 * 3;"#).is_ok());
        assert!(run(r#"print "foo" + "bar";"#).is_ok());
    }

    #[test]
    fn native_print_returns_nil() {
        let result = native_print(&[Value::Number(1.0), Value::Bool(true)]);
        assert_eq!(result, Value::Nil);
    }

    #[test]
    fn vm_arity_mismatch() {
        let err = run(
            r#"
            fun two(a, b) { return a + b; }
            two(1);
            "#,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Expected 2 arguments but got 1.");
    }

    #[test]
    fn vm_not_callable() {
        let err = run("var x = 1; x();").unwrap_err();
        assert_eq!(err.to_string(), "Can only call functions and classes.");
    }

    #[test]
    fn vm_stack_overflow() {
        let err = run("fun f() { f(); } f();").unwrap_err();
        assert_eq!(err.to_string(), "Stack overflow.");
    }

    #[test]
    fn vm_closure_counter() {
        let gc = run(
            r#"
            fun make() {
                var x = 0;
                fun inc() {
                    x = x + 1;
                    return x;
                }
                return inc;
            }
            var c = make();
            var r1 = c();
            var r2 = c();
            var r3 = c();
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r1"), 1.0);
        assert_eq!(number(&gc, "r2"), 2.0);
        assert_eq!(number(&gc, "r3"), 3.0);
    }

    #[test]
    fn vm_closures_capture_independent_variables() {
        let gc = run(
            r#"
            fun make(value) {
                fun get() { return value; }
                return get;
            }
            var doughnut = make("doughnut");
            var bagel = make("bagel");
            var r1 = doughnut();
            var r2 = bagel();
            "#,
        )
        .unwrap();
        assert_eq!(string(&gc, "r1"), "doughnut");
        assert_eq!(string(&gc, "r2"), "bagel");
    }

    #[test]
    fn vm_closed_upvalue_is_shared() {
        let gc = run(
            r#"
            var get;
            var set;
            fun make() {
                var x = 10;
                fun g() { return x; }
                fun s(v) { x = v; }
                get = g;
                set = s;
            }
            make();
            var r1 = get();
            set(5);
            var r2 = get();
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r1"), 10.0);
        assert_eq!(number(&gc, "r2"), 5.0);
    }

    #[test]
    fn vm_class_fields() {
        let gc = run(
            r#"
            class Pair {}
            var pair = Pair();
            pair.first = 1;
            pair.second = 2;
            var r = pair.first + pair.second;
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r"), 3.0);
    }

    #[test]
    fn vm_methods_and_this() {
        let gc = run(
            r#"
            class Scone {
                topping(first, second) {
                    return "scone with " + first + " and " + second;
                }
            }
            var scone = Scone();
            var r = scone.topping("berries", "cream");
            "#,
        )
        .unwrap();
        assert_eq!(string(&gc, "r"), "scone with berries and cream");
    }

    #[test]
    fn vm_initializer() {
        let gc = run(
            r#"
            class Point {
                init(n) { this.n = n; }
            }
            var r = Point(7).n;
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r"), 7.0);
    }

    #[test]
    fn vm_initializer_returns_receiver() {
        let gc = run(
            r#"
            class Point {
                init(n) { this.n = n; }
                double() { this.n = this.n * 2; return this; }
            }
            var r = Point(3).double().double().n;
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r"), 12.0);
    }

    #[test]
    fn vm_class_without_init_rejects_arguments() {
        let err = run("class Bagel {} Bagel(1, 2);").unwrap_err();
        assert_eq!(err.to_string(), "Expected 0 arguments but got 2.");
    }

    #[test]
    fn vm_bound_method_keeps_receiver() {
        let gc = run(
            r#"
            class Counter {
                init() { this.count = 0; }
                bump() {
                    this.count = this.count + 1;
                    return this.count;
                }
            }
            var counter = Counter();
            var bump = counter.bump;
            bump();
            bump();
            var r = counter.count;
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r"), 2.0);
    }

    #[test]
    fn vm_field_shadows_method_on_invoke() {
        let gc = run(
            r#"
            class Talker {
                speak() { return "method"; }
            }
            fun shadow() { return "field"; }
            var talker = Talker();
            talker.speak = shadow;
            var r = talker.speak();
            "#,
        )
        .unwrap();
        assert_eq!(string(&gc, "r"), "field");
    }

    #[test]
    fn vm_inheritance_copies_methods() {
        let gc = run(
            r#"
            class A {
                speak() { return "A"; }
            }
            class B < A {}
            var r = B().speak();
            "#,
        )
        .unwrap();
        assert_eq!(string(&gc, "r"), "A");
    }

    #[test]
    fn vm_super_invoke() {
        let gc = run(
            r#"
            var out = "";
            class A {
                speak() { out = out + "A"; }
            }
            class B < A {
                speak() {
                    super.speak();
                    out = out + "B";
                }
            }
            B().speak();
            "#,
        )
        .unwrap();
        assert_eq!(string(&gc, "out"), "AB");
    }

    #[test]
    fn vm_get_super_binds_method() {
        let gc = run(
            r#"
            class A {
                name() { return "A"; }
            }
            class B < A {
                name() { return "B"; }
                parent() {
                    var m = super.name;
                    return m();
                }
            }
            var r = B().parent();
            "#,
        )
        .unwrap();
        assert_eq!(string(&gc, "r"), "A");
    }

    #[test]
    fn vm_superclass_must_be_a_class() {
        let err = run("var NotClass = 1; class Sub < NotClass {}").unwrap_err();
        assert_eq!(err.to_string(), "Superclass must be a class.");
    }

    #[test]
    fn vm_property_errors() {
        let err = run("var x = 1; var r = x.field;").unwrap_err();
        assert_eq!(err.to_string(), "Only instances have properties.");

        let err = run("var x = 1; x.field = 2;").unwrap_err();
        assert_eq!(err.to_string(), "Only instances have fields.");

        let err = run("var x = 1; x.method();").unwrap_err();
        assert_eq!(err.to_string(), "Only instances have methods.");

        let err = run("class Empty {} var r = Empty().missing;").unwrap_err();
        assert_eq!(err.to_string(), "Undefined property 'missing'.");
    }

    #[test]
    fn vm_instance_equality_is_identity() {
        let gc = run(
            r#"
            class C {}
            var i = C();
            var j = C();
            var k = i;
            var different = i == j;
            var same = i == k;
            "#,
        )
        .unwrap();
        assert!(!boolean(&gc, "different"));
        assert!(boolean(&gc, "same"));
    }

    #[test]
    fn vm_stress_gc_preserves_closure_chain() {
        let source = r#"
            fun outer() {
                var parts = "";
                fun middle() {
                    parts = parts + "m";
                    fun inner() {
                        parts = parts + "i";
                        return parts;
                    }
                    return inner;
                }
                return middle;
            }
            var mid = outer();
            var in1 = mid();
            var in2 = mid();
            var r = in2();
        "#;

        let plain = run(source).unwrap();

        let mut stressed = GC::new();
        stressed.stress = true;
        let stressed = run_with(stressed, source).unwrap();

        assert_eq!(string(&plain, "r"), string(&stressed, "r"));
        assert_eq!(string(&stressed, "r"), "mmi");
    }

    #[test]
    fn vm_stress_gc_full_program() {
        let mut gc = GC::new();
        gc.stress = true;
        let gc = run_with(
            gc,
            r#"
            class Tree {
                init(depth) {
                    this.depth = depth;
                    if (depth > 0) {
                        this.left = Tree(depth - 1);
                        this.right = Tree(depth - 1);
                    }
                }
                count() {
                    if (this.depth == 0) { return 1; }
                    return 1 + this.left.count() + this.right.count();
                }
            }
            var r = Tree(4).count();
            "#,
        )
        .unwrap();
        assert_eq!(number(&gc, "r"), 31.0);
    }

    #[test]
    fn vm_return_inside_nested_blocks() {
        let gc = run(
            r#"
            fun pick(flag) {
                if (flag) {
                    var inner = "yes";
                    return inner;
                }
                return "no";
            }
            var r1 = pick(true);
            var r2 = pick(false);
            "#,
        )
        .unwrap();
        assert_eq!(string(&gc, "r1"), "yes");
        assert_eq!(string(&gc, "r2"), "no");
    }
}
