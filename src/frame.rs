//! Activation records and the per-thread call stack.
//!
//! All frames of a thread share one growable slot arena. A frame owns the
//! range `locals..end()`: its local variables followed by its operand
//! stack. Ranges of different frames never overlap, with one exception:
//! when an invocation instruction links a callee, the caller's stack
//! pointer is first lowered past the argument slots and the callee's local
//! range starts at that lowered pointer, so the arguments become the
//! callee's first locals in place. From then on the caller only touches
//! slots below its lowered stack pointer and the callee owns the range.
use std::sync::Arc;

use tracing::debug;

use crate::class::Class;
use crate::config::Config;
use crate::error::{Result, RuntimeError};
use crate::heap::Ref;
use crate::program::Method;
use crate::reader::BytecodeReader;
use crate::runtime::Value;
use crate::slot::Slot;

/// One activation record.
#[derive(Debug)]
pub struct Frame {
    pub method: Arc<Method>,
    pub class: Arc<Class>,
    pub reader: BytecodeReader,
    /// Address of the opcode being executed; exception ranges and switch
    /// offsets are measured from it.
    pub op_pc: usize,
    /// First local variable slot.
    pub locals: usize,
    pub locals_len: usize,
    /// First operand stack slot.
    pub base: usize,
    /// Next free operand stack slot.
    pub sp: usize,
    /// Pushed by the host through `execute`: returns and uncaught
    /// exceptions surface to the host instead of the caller frame.
    pub vm_invoke: bool,
}

impl Frame {
    pub fn end(&self) -> usize {
        self.base + self.method.max_stack as usize
    }

    pub fn stack_depth(&self) -> usize {
        self.sp - self.base
    }
}

#[derive(Debug)]
pub struct CallStack {
    slots: Vec<Slot>,
    frames: Vec<Frame>,
    max_slots: usize,
    max_frames: usize,
}

impl CallStack {
    pub fn new(config: &Config) -> Self {
        Self {
            slots: Vec::new(),
            frames: Vec::new(),
            max_slots: config.max_stack_slots,
            max_frames: config.max_frames,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Current frame. Only valid while a method is executing.
    pub fn frame(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    fn reserve(&mut self, locals: usize, method: &Method, locals_len: usize) -> Result<()> {
        if self.frames.len() >= self.max_frames {
            return Err(RuntimeError::StackOverflow {
                depth: self.frames.len(),
            });
        }
        let end = locals + locals_len + method.max_stack as usize;
        if end > self.max_slots {
            return Err(RuntimeError::StackOverflow {
                depth: self.frames.len(),
            });
        }
        if self.slots.len() < end {
            self.slots.resize(end, Slot::ZERO);
        }
        Ok(())
    }

    fn push(&mut self, method: Arc<Method>, locals: usize, locals_len: usize, vm_invoke: bool) {
        let base = locals + locals_len;
        debug!(method = %method, depth = self.frames.len() + 1, vm_invoke, "push frame");
        self.frames.push(Frame {
            class: method.class(),
            reader: BytecodeReader::new(method.code.clone()),
            method,
            op_pc: 0,
            locals,
            locals_len,
            base,
            sp: base,
            vm_invoke,
        });
    }

    /// Pushes a frame whose arguments are copied in by the host. It starts
    /// at the current frame's stack pointer.
    pub fn push_host_frame(&mut self, method: Arc<Method>, args: &[Slot]) -> Result<()> {
        let locals = self.frames.last().map_or(0, |f| f.sp);
        let locals_len = (method.max_locals as usize).max(args.len());
        self.reserve(locals, &method, locals_len)?;
        self.slots[locals..locals + args.len()].copy_from_slice(args);
        self.slots[locals + args.len()..locals + locals_len].fill(Slot::ZERO);
        self.push(method, locals, locals_len, true);
        Ok(())
    }

    /// Links `method` as a callee of the current frame, taking the top
    /// `arg_slots` operand slots as its first locals.
    pub fn push_linked_frame(&mut self, method: Arc<Method>, arg_slots: usize) -> Result<()> {
        let caller = self.frame_mut();
        caller.sp -= arg_slots;
        let locals = caller.sp;
        let locals_len = (method.max_locals as usize).max(arg_slots);
        if let Err(err) = self.reserve(locals, &method, locals_len) {
            self.frame_mut().sp += arg_slots;
            return Err(err);
        }
        self.slots[locals + arg_slots..locals + locals_len].fill(Slot::ZERO);
        self.push(method, locals, locals_len, false);
        Ok(())
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        debug!(method = %frame.method, depth = self.frames.len(), "pop frame");
        Some(frame)
    }

    /// Drops frames until `depth` remain.
    pub fn truncate(&mut self, depth: usize) {
        while self.frames.len() > depth {
            self.frames.pop();
        }
    }

    pub fn push_slot(&mut self, value: Slot) {
        let top = self.frames.len() - 1;
        let sp = self.frames[top].sp;
        self.slots[sp] = value;
        self.frames[top].sp = sp + 1;
    }

    pub fn pop_slot(&mut self) -> Slot {
        let top = self.frames.len() - 1;
        let sp = self.frames[top].sp - 1;
        self.frames[top].sp = sp;
        self.slots[sp]
    }

    /// Slot `depth` positions below the top of the operand stack.
    pub fn peek(&self, depth: usize) -> Slot {
        self.slots[self.frame().sp - 1 - depth]
    }

    pub fn push_slots(&mut self, values: &[Slot]) {
        for &value in values {
            self.push_slot(value);
        }
    }

    /// Removes the top `count` operand slots, returned bottom first.
    pub fn pop_slots(&mut self, count: usize) -> Vec<Slot> {
        let top = self.frames.len() - 1;
        let sp = self.frames[top].sp - count;
        self.frames[top].sp = sp;
        self.slots[sp..sp + count].to_vec()
    }

    /// The top `count` operand slots without popping them.
    pub fn top_slots(&self, count: usize) -> &[Slot] {
        let sp = self.frame().sp;
        &self.slots[sp - count..sp]
    }

    pub fn clear_operand_stack(&mut self) {
        let frame = self.frame_mut();
        frame.sp = frame.base;
    }

    pub fn push_int(&mut self, value: i32) {
        self.push_slot(Slot::from_int(value));
    }

    pub fn pop_int(&mut self) -> i32 {
        self.pop_slot().as_int()
    }

    pub fn push_float(&mut self, value: f32) {
        self.push_slot(Slot::from_float(value));
    }

    pub fn pop_float(&mut self) -> f32 {
        self.pop_slot().as_float()
    }

    pub fn push_ref(&mut self, value: Ref) {
        self.push_slot(Slot::from_ref(value));
    }

    pub fn pop_ref(&mut self) -> Ref {
        self.pop_slot().as_ref()
    }

    pub fn push_long(&mut self, value: i64) {
        self.push_slots(&Slot::pair_from_long(value));
    }

    pub fn pop_long(&mut self) -> i64 {
        let low = self.pop_slot();
        let high = self.pop_slot();
        Slot::long_from_pair(high, low)
    }

    pub fn push_double(&mut self, value: f64) {
        self.push_slots(&Slot::pair_from_double(value));
    }

    pub fn pop_double(&mut self) -> f64 {
        let low = self.pop_slot();
        let high = self.pop_slot();
        Slot::double_from_pair(high, low)
    }

    pub fn push_value(&mut self, value: Value) {
        match value {
            Value::Void => {}
            Value::Int(v) => self.push_int(v),
            Value::Float(v) => self.push_float(v),
            Value::Ref(v) => self.push_ref(v),
            Value::Long(v) => self.push_long(v),
            Value::Double(v) => self.push_double(v),
        }
    }

    pub fn local(&self, index: usize) -> Slot {
        self.slots[self.frame().locals + index]
    }

    pub fn set_local(&mut self, index: usize, value: Slot) {
        let at = self.frame().locals + index;
        self.slots[at] = value;
    }

    /// The current frame's local variable array.
    pub fn locals(&self) -> &[Slot] {
        let frame = self.frame();
        &self.slots[frame.locals..frame.locals + frame.locals_len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassBuilder;
    use crate::program::{AccessFlags, MethodBuilder};
    use pretty_assertions::assert_eq;

    fn class_with(methods: Vec<MethodBuilder>) -> Arc<Class> {
        methods
            .into_iter()
            .fold(ClassBuilder::new("t/Frames").no_super(), ClassBuilder::method)
            .build(None, Vec::new())
    }

    #[test]
    fn linked_frame_aliases_caller_arguments() {
        let class = class_with(vec![
            MethodBuilder::new("caller", "()V")
                .access(AccessFlags::STATIC)
                .code(4, 1, vec![0xb1]),
            MethodBuilder::new("callee", "(IJ)V")
                .access(AccessFlags::STATIC)
                .code(0, 4, vec![0xb1]),
        ]);
        let mut stack = CallStack::new(&Config::default());
        stack.push_host_frame(class.methods[0].clone(), &[]).ok();
        stack.push_int(9);
        stack.push_int(7);
        stack.push_long(-2);
        let caller_base = stack.frame().base;
        stack.push_linked_frame(class.methods[1].clone(), 3).ok();

        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.frame().locals, caller_base + 1);
        assert_eq!(stack.frame().locals_len, 4);
        assert_eq!(stack.local(0).as_int(), 7);
        assert_eq!(Slot::long_from_pair(stack.local(1), stack.local(2)), -2);

        stack.set_local(0, Slot::from_int(100));
        stack.pop_frame();
        assert_eq!(stack.frame().stack_depth(), 1);
        assert_eq!(stack.peek(0).as_int(), 9);
    }

    #[test]
    fn frame_limit_is_stack_overflow() {
        let class = class_with(vec![MethodBuilder::new("f", "()V")
            .access(AccessFlags::STATIC)
            .code(1, 0, vec![0xb1])]);
        let mut stack = CallStack::new(&Config::default().with_max_frames(2));
        assert!(stack.push_host_frame(class.methods[0].clone(), &[]).is_ok());
        assert!(stack.push_linked_frame(class.methods[0].clone(), 0).is_ok());
        assert!(matches!(
            stack.push_linked_frame(class.methods[0].clone(), 0),
            Err(RuntimeError::StackOverflow { depth: 2 })
        ));
    }

    #[test]
    fn category_two_values_round_trip() {
        let class = class_with(vec![MethodBuilder::new("f", "()V")
            .access(AccessFlags::STATIC)
            .code(4, 4, vec![0xb1])]);
        let mut stack = CallStack::new(&Config::default());
        stack.push_host_frame(class.methods[0].clone(), &[]).ok();
        stack.push_long(i64::MIN + 5);
        stack.push_double(-0.5);
        assert_eq!(stack.frame().stack_depth(), 4);
        assert_eq!(stack.pop_double(), -0.5);
        assert_eq!(stack.pop_long(), i64::MIN + 5);
        assert_eq!(stack.top_slots(0), &[] as &[Slot]);
    }
}
