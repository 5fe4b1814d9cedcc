use crate::compile::module_info::ModuleInfo;
use crate::errors::CompileError;
use crate::indices::TypeIndex;
use crate::values::ValType;
use smallvec::SmallVec;

/// Type of a value token on the validation stack. `Any` is the polymorphic
/// bottom produced in formally-unreachable frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateType {
    I32,
    I64,
    F32,
    F64,
    Any,
}

impl From<ValType> for ValidateType {
    fn from(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Self::I32,
            ValType::I64 => Self::I64,
            ValType::F32 => Self::F32,
            ValType::F64 => Self::F64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Func,
    Block,
    Loop,
    If,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    pub kind: BlockKind,
    pub sig: TypeIndex,
    /// Stack index of the enclosing block element; `None` for the function
    /// frame. Blocks reference ancestors by index, never by pointer.
    prev_block: Option<usize>,
    pub formally_unreachable: bool,
}

#[derive(Debug, Clone, Copy)]
enum Element {
    Value(ValidateType),
    Block(BlockInfo),
    /// Separates the then- and else-arms of an `if` frame.
    ElseFence,
}

/// The wasm stack-typing validator.
///
/// Driven by the frontend as it visits instructions; the compile stack is
/// kept in lockstep by the caller. The bottom-most block is always the
/// `Func` frame.
pub struct ValidationStack {
    nodes: Vec<Element>,
    current_block: usize,
    offset: usize,
}

impl ValidationStack {
    pub fn new(func_sig: TypeIndex) -> Self {
        let mut stack = Self {
            nodes: Vec::with_capacity(64),
            current_block: 0,
            offset: 0,
        };
        stack.reset(func_sig);
        stack
    }

    /// Reuse the allocation for the next function body.
    pub fn reset(&mut self, func_sig: TypeIndex) {
        self.nodes.clear();
        self.nodes.push(Element::Block(BlockInfo {
            kind: BlockKind::Func,
            sig: func_sig,
            prev_block: None,
            formally_unreachable: false,
        }));
        self.current_block = 0;
    }

    /// Bytecode offset used for error reporting.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    fn err(&self, message: &str) -> CompileError {
        CompileError::validation(self.offset, message)
    }

    fn current(&self) -> &BlockInfo {
        match &self.nodes[self.current_block] {
            Element::Block(info) => info,
            _ => unreachable!("current_block always indexes a block element"),
        }
    }

    fn current_mut(&mut self) -> &mut BlockInfo {
        match &mut self.nodes[self.current_block] {
            Element::Block(info) => info,
            _ => unreachable!("current_block always indexes a block element"),
        }
    }

    /// Index of the first value slot of the current frame.
    fn frame_start(&self) -> usize {
        let mut start = self.current_block + 1;
        if matches!(self.nodes.get(start), Some(Element::ElseFence)) {
            start += 1;
        }
        start
    }

    pub fn is_unreachable(&self) -> bool {
        self.current().formally_unreachable
    }

    /// Mark the current frame unreachable after an unconditional branch,
    /// `return` or `unreachable`. The frame's value tokens are discarded;
    /// later pops materialize `Any` on demand.
    pub fn mark_unreachable(&mut self) {
        let start = self.frame_start();
        self.nodes.truncate(start);
        self.current_mut().formally_unreachable = true;
    }

    pub fn push_value(&mut self, ty: ValType) {
        self.nodes.push(Element::Value(ty.into()));
    }

    /// Pop a value of type `ty` (or `Any`) off the stack.
    pub fn pop_value_expect(&mut self, ty: ValType) -> crate::Result<()> {
        self.check_value(ty.into(), true).map(|_| ())
    }

    /// Pop a value of any numeric type, returning what it was.
    pub fn pop_value_any(&mut self) -> crate::Result<ValidateType> {
        match self.nodes.last() {
            Some(Element::Value(vt)) => {
                let vt = *vt;
                self.nodes.pop();
                Ok(vt)
            }
            _ if self.is_unreachable() => Ok(ValidateType::Any),
            _ => Err(self.err("operand stack underflow")),
        }
    }

    fn check_value(&mut self, expect: ValidateType, pop: bool) -> crate::Result<ValidateType> {
        debug_assert_ne!(expect, ValidateType::Any);
        match self.nodes.last_mut() {
            Some(Element::Value(vt)) => {
                if *vt == ValidateType::Any {
                    *vt = expect;
                } else if *vt != expect {
                    return Err(self.err("operand type mismatch"));
                }
                let out = *vt;
                if pop {
                    self.nodes.pop();
                }
                Ok(out)
            }
            Some(Element::Block(_) | Element::ElseFence) | None => {
                if self.is_unreachable() {
                    // Materialize a phantom operand below the dead code.
                    Ok(ValidateType::Any)
                } else {
                    Err(self.err("operand stack underflow"))
                }
            }
        }
    }

    /// `validate_arithmetic`: pop `args` right to left, push the result.
    pub fn validate_arithmetic(
        &mut self,
        args: &[ValType],
        result: Option<ValType>,
    ) -> crate::Result<()> {
        for ty in args.iter().rev() {
            self.pop_value_expect(*ty)?;
        }
        if let Some(ty) = result {
            self.push_value(ty);
        }
        Ok(())
    }

    /// `select`: pop the i32 condition, then two operands sharing one
    /// numeric type; push that type back.
    pub fn validate_select(&mut self) -> crate::Result<ValidateType> {
        self.pop_value_expect(ValType::I32)?;
        let b = self.pop_value_any()?;
        let a = self.pop_value_any()?;
        let unified = match (a, b) {
            (ValidateType::Any, x) | (x, ValidateType::Any) => x,
            (x, y) if x == y => x,
            _ => return Err(self.err("select operands must share a type")),
        };
        self.nodes.push(Element::Value(unified));
        Ok(unified)
    }

    /// Enter a `block`/`loop`/`if` frame: pop the block's parameters, push
    /// the header, re-push the parameters into the new frame.
    pub fn push_block(
        &mut self,
        kind: BlockKind,
        sig: TypeIndex,
        module: &ModuleInfo,
    ) -> crate::Result<()> {
        debug_assert!(matches!(kind, BlockKind::Block | BlockKind::Loop | BlockKind::If));
        let params: SmallVec<[ValType; 8]> = module.types[sig].params.clone();
        for ty in params.iter().rev() {
            self.pop_value_expect(*ty)?;
        }
        self.nodes.push(Element::Block(BlockInfo {
            kind,
            sig,
            prev_block: Some(self.current_block),
            formally_unreachable: false,
        }));
        self.current_block = self.nodes.len() - 1;
        for ty in &params {
            self.push_value(*ty);
        }
        Ok(())
    }

    /// `else`: the then-arm must have produced the frame's results exactly;
    /// the else-arm restarts from the frame's parameters.
    pub fn validate_else(&mut self, module: &ModuleInfo) -> crate::Result<()> {
        let info = *self.current();
        if info.kind != BlockKind::If {
            return Err(self.err("else outside of if"));
        }
        if matches!(self.nodes.get(self.current_block + 1), Some(Element::ElseFence)) {
            return Err(self.err("duplicate else"));
        }
        self.expect_frame_results(info.sig, module)?;
        debug_assert_eq!(self.nodes.len(), self.current_block + 1);

        self.nodes.push(Element::ElseFence);
        let params: SmallVec<[ValType; 8]> = module.types[info.sig].params.clone();
        for ty in &params {
            self.push_value(*ty);
        }
        self.current_mut().formally_unreachable = false;
        Ok(())
    }

    /// `end`: validate the frame's results are present and exact, then
    /// remove the frame. Returns the closed block's info; ending the `Func`
    /// frame finishes the body.
    pub fn validate_end(&mut self, module: &ModuleInfo) -> crate::Result<BlockInfo> {
        let info = *self.current();
        let had_else =
            matches!(self.nodes.get(self.current_block + 1), Some(Element::ElseFence));
        self.expect_frame_results(info.sig, module)?;
        debug_assert_eq!(self.nodes.len(), self.current_block + 1);

        // An if without an else is the identity on its parameters.
        if info.kind == BlockKind::If && !had_else {
            let sig = &module.types[info.sig];
            if sig.params != sig.results {
                return Err(self.err("if without else must leave its inputs unchanged"));
            }
        }

        // Drop the fence (if any) and the header.
        self.nodes.truncate(self.current_block);
        if let Some(prev) = info.prev_block {
            self.current_block = prev;
            for ty in &module.types[info.sig].results {
                self.push_value(*ty);
            }
        } else {
            // Func frame closed; leave results off the (now empty) stack.
            debug_assert!(self.nodes.is_empty());
        }
        Ok(info)
    }

    /// Pop and check the current frame's results, right to left. Excess
    /// operands fail validation unless the frame is formally unreachable, in
    /// which case dead-code leftovers are dropped.
    fn expect_frame_results(&mut self, sig: TypeIndex, module: &ModuleInfo) -> crate::Result<()> {
        let results: SmallVec<[ValType; 2]> = module.types[sig].results.clone();
        for ty in results.iter().rev() {
            self.pop_value_expect(*ty)?;
        }
        let start = self.frame_start();
        if self.nodes.len() > start {
            if self.is_unreachable() {
                self.nodes.truncate(start);
            } else {
                return Err(self.err("values remain on stack at end of block"));
            }
        }
        // Put the fence back out of the way: truncate later relies on the
        // frame being exactly empty.
        if start != self.current_block + 1 {
            self.nodes.truncate(self.current_block + 1);
        }
        Ok(())
    }

    /// Resolve a branch target `depth` labels out, returning its info.
    pub fn branch_target(&self, depth: u32) -> crate::Result<BlockInfo> {
        let mut index = self.current_block;
        for _ in 0..depth {
            index = match &self.nodes[index] {
                Element::Block(info) => info
                    .prev_block
                    .ok_or_else(|| self.err("branch depth out of range"))?,
                _ => unreachable!(),
            };
        }
        match &self.nodes[index] {
            Element::Block(info) => Ok(*info),
            _ => unreachable!(),
        }
    }

    /// `br` / `br_if`: validate the target's branch types against the stack
    /// top. A conditional branch first pops its i32 condition. An
    /// unconditional branch marks the frame unreachable.
    pub fn validate_branch(
        &mut self,
        depth: u32,
        conditional: bool,
        module: &ModuleInfo,
    ) -> crate::Result<BlockInfo> {
        if conditional {
            self.pop_value_expect(ValType::I32)?;
        }
        let target = self.branch_target(depth)?;
        let types = self.branch_types(&target, module);
        // Peek-check: a conditional branch that is not taken falls through
        // with the values still on the stack.
        self.check_types_on_top(&types)?;
        if !conditional {
            self.mark_unreachable();
        }
        Ok(target)
    }

    /// `br_table`: pop the i32 index, check every target agrees with the
    /// default's branch types, mark unreachable.
    pub fn validate_branch_table(
        &mut self,
        depths: &[u32],
        default_depth: u32,
        module: &ModuleInfo,
    ) -> crate::Result<()> {
        self.pop_value_expect(ValType::I32)?;
        let default_target = self.branch_target(default_depth)?;
        let expected = self.branch_types(&default_target, module);
        for depth in depths {
            let target = self.branch_target(*depth)?;
            let types = self.branch_types(&target, module);
            if types != expected {
                return Err(self.err("br_table targets have inconsistent types"));
            }
        }
        self.check_types_on_top(&expected)?;
        self.mark_unreachable();
        Ok(())
    }

    /// Branch types of a target: a loop receives its parameters, everything
    /// else its results.
    pub fn branch_types(&self, target: &BlockInfo, module: &ModuleInfo) -> SmallVec<[ValType; 2]> {
        let sig = &module.types[target.sig];
        if target.kind == BlockKind::Loop {
            SmallVec::from_slice(&sig.params)
        } else {
            SmallVec::from_slice(&sig.results)
        }
    }

    /// `return`: check the function frame's results, mark unreachable.
    pub fn validate_return(&mut self, module: &ModuleInfo) -> crate::Result<()> {
        let mut index = self.current_block;
        loop {
            match &self.nodes[index] {
                Element::Block(info) => match info.prev_block {
                    Some(prev) => index = prev,
                    None => {
                        let results: SmallVec<[ValType; 2]> =
                            SmallVec::from_slice(&module.types[info.sig].results);
                        self.check_types_on_top(&results)?;
                        self.mark_unreachable();
                        return Ok(());
                    }
                },
                _ => unreachable!(),
            }
        }
    }

    /// `call` / `call_indirect` operand typing: pop params right to left,
    /// push results.
    pub fn validate_call(&mut self, sig: TypeIndex, module: &ModuleInfo) -> crate::Result<()> {
        let params: SmallVec<[ValType; 8]> = module.types[sig].params.clone();
        let results: SmallVec<[ValType; 2]> = module.types[sig].results.clone();
        for ty in params.iter().rev() {
            self.pop_value_expect(*ty)?;
        }
        for ty in &results {
            self.push_value(*ty);
        }
        Ok(())
    }

    /// Check (without popping) that `types` sit on the stack top in order.
    fn check_types_on_top(&mut self, types: &[ValType]) -> crate::Result<()> {
        // Pop, verify, push back: materializes `Any`s in unreachable frames.
        let mut popped: SmallVec<[ValidateType; 4]> = SmallVec::new();
        let mut failed = None;
        for ty in types.iter().rev() {
            match self.check_value((*ty).into(), true) {
                Ok(vt) => popped.push(vt),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        for vt in popped.into_iter().rev() {
            self.nodes.push(Element::Value(vt));
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::module_info::FuncSignature;

    fn module_with_sigs() -> (ModuleInfo, TypeIndex, TypeIndex, TypeIndex) {
        let mut module = ModuleInfo::default();
        let empty = module.types.push(FuncSignature::default());
        let one_i32 = module.types.push(FuncSignature::single_result(ValType::I32));
        let one_f64 = module.types.push(FuncSignature::single_result(ValType::F64));
        module.num_declared_types = 3;
        (module, empty, one_i32, one_f64)
    }

    #[test]
    fn block_round_trip() {
        let (module, empty, one_i32, _) = module_with_sigs();
        let mut stack = ValidationStack::new(one_i32);
        stack.push_block(BlockKind::Block, one_i32, &module).unwrap();
        stack.push_value(ValType::I32);
        let info = stack.validate_end(&module).unwrap();
        assert_eq!(info.kind, BlockKind::Block);
        // Result now sits in the func frame.
        let info = stack.validate_end(&module).unwrap();
        assert_eq!(info.kind, BlockKind::Func);
        let _ = empty;
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let (module, _, one_i32, _) = module_with_sigs();
        let mut stack = ValidationStack::new(one_i32);
        stack.push_value(ValType::F32);
        assert!(stack.validate_end(&module).is_err());
    }

    #[test]
    fn unreachable_materializes_any() {
        let (module, _, one_i32, _) = module_with_sigs();
        let mut stack = ValidationStack::new(one_i32);
        // `unreachable` then `end` with no produced value: fine.
        stack.mark_unreachable();
        assert!(stack.validate_end(&module).is_ok());
    }

    #[test]
    fn unreachable_drops_dead_leftovers() {
        let (module, _, one_i32, _) = module_with_sigs();
        let mut stack = ValidationStack::new(one_i32);
        stack.push_value(ValType::F64);
        stack.mark_unreachable();
        // Dead extra values after the branch are dropped silently.
        stack.push_value(ValType::I64);
        stack.push_value(ValType::I32);
        assert!(stack.validate_end(&module).is_ok());
    }

    #[test]
    fn reachable_leftovers_are_an_error() {
        let (module, empty, _, _) = module_with_sigs();
        let mut stack = ValidationStack::new(empty);
        stack.push_value(ValType::I32);
        assert!(stack.validate_end(&module).is_err());
    }

    #[test]
    fn if_without_else_needs_neutral_sig() {
        let (module, empty, one_i32, _) = module_with_sigs();
        let mut stack = ValidationStack::new(empty);
        stack.push_value(ValType::I32); // condition, consumed by the frontend
        stack.pop_value_expect(ValType::I32).unwrap();
        stack.push_block(BlockKind::If, one_i32, &module).unwrap();
        stack.push_value(ValType::I32);
        assert!(stack.validate_end(&module).is_err());
    }

    #[test]
    fn if_else_round_trip() {
        let (module, _, one_i32, _) = module_with_sigs();
        let mut stack = ValidationStack::new(one_i32);
        stack.push_block(BlockKind::If, one_i32, &module).unwrap();
        stack.push_value(ValType::I32);
        stack.validate_else(&module).unwrap();
        stack.push_value(ValType::I32);
        stack.validate_end(&module).unwrap();
        stack.validate_end(&module).unwrap();
    }

    #[test]
    fn select_unifies_types() {
        let (_, _, one_i32, _) = module_with_sigs();
        let mut stack = ValidationStack::new(one_i32);
        stack.push_value(ValType::F64);
        stack.push_value(ValType::F64);
        stack.push_value(ValType::I32);
        assert_eq!(stack.validate_select().unwrap(), ValidateType::F64);

        let mut stack = ValidationStack::new(one_i32);
        stack.push_value(ValType::F64);
        stack.push_value(ValType::I64);
        stack.push_value(ValType::I32);
        assert!(stack.validate_select().is_err());
    }

    #[test]
    fn branch_targets_walk_outward() {
        let (module, empty, one_i32, _) = module_with_sigs();
        let mut stack = ValidationStack::new(empty);
        stack.push_block(BlockKind::Block, one_i32, &module).unwrap();
        stack.push_block(BlockKind::Loop, empty, &module).unwrap();
        assert_eq!(stack.branch_target(0).unwrap().kind, BlockKind::Loop);
        assert_eq!(stack.branch_target(1).unwrap().kind, BlockKind::Block);
        assert_eq!(stack.branch_target(2).unwrap().kind, BlockKind::Func);
        assert!(stack.branch_target(3).is_err());

        // A loop's branch types are its parameters (empty here), so a bare
        // br validates even though the loop "returns" nothing yet.
        assert!(stack.validate_branch(0, false, &module).is_ok());
    }
}
