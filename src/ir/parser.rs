//! IR text parser.
//!
//! Single pass over the text with per-function name maps; value and block
//! references are patched once the function body is complete, call targets
//! once the whole module is read (so calls may name later functions).

use super::*;

pub fn parse_ir(text: &str) -> Result<Module, String> {
    let parser = Parser::new(text);
    parser.parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    ir: Module,

    // Global maps
    funcs: HashMap<&'a str, u32>,
    func_resolves: Vec<Resolve<'a>>,

    // Per-function maps
    blocks: HashMap<&'a str, u32>,
    values: HashMap<&'a str, u32>,
    block_resolves: Vec<Resolve<'a>>,
    value_resolves: Vec<Resolve<'a>>,
}

#[derive(Debug)]
struct Resolve<'a> {
    name: &'a str,
    index: u32,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            ir: Module::new(),
            funcs: HashMap::new(),
            func_resolves: Vec::new(),
            blocks: HashMap::new(),
            values: HashMap::new(),
            block_resolves: Vec::new(),
            value_resolves: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<Module, String> {
        self.skip_whitespace(true);

        while !self.is_eof() {
            if let Err(e) = self.parse_function() {
                let line = self.text[..self.pos].matches('\n').count() + 1;
                let context_start = self.pos.saturating_sub(20);
                let context_end = (self.pos + 20).min(self.text.len());
                log::debug!(
                    "parse error near '{}'",
                    self.text.get(context_start..context_end).unwrap_or_default()
                );
                return Err(format!("line {line}: {e}"));
            }
            self.skip_whitespace(true);
        }

        self.resolve_all_references()?;

        Ok(self.ir)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Skip comment line
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(true);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), String> {
        if !self.try_read(ch) {
            return Err(format!("expected '{}' but found {:?}", ch, self.current_char()));
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace(true);
        let start = self.pos;

        match self.current_char() {
            Some(ch) if ch.is_alphanumeric() || ch == '_' => {}
            Some(ch) => return Err(format!("expected identifier but found '{ch}'")),
            None => return Err("expected identifier but found EOF".to_string()),
        }

        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }

        Ok(&self.text[start..self.pos])
    }

    fn read_value_name(&mut self) -> Result<&'a str, String> {
        self.expect('%')?;
        self.read_identifier()
    }

    fn read_block_name(&mut self) -> Result<&'a str, String> {
        self.expect('^')?;
        self.read_identifier()
    }

    /// Signed decimal or `0x` hexadecimal literal.
    fn read_integer(&mut self) -> Result<i64, String> {
        self.skip_whitespace(true);
        let negative = self.current_char() == Some('-');
        if negative {
            self.advance();
        }

        let start = self.pos;
        let rest = &self.text[self.pos..];
        let (radix, digits_start) = if rest.starts_with("0x") || rest.starts_with("0X") {
            (16, start + 2)
        } else {
            (10, start)
        };
        self.pos = digits_start;
        while let Some(ch) = self.current_char() {
            if ch.is_digit(radix) {
                self.advance();
            } else {
                break;
            }
        }
        if self.pos == digits_start {
            return Err("expected number".to_string());
        }

        let digits = &self.text[digits_start..self.pos];
        let magnitude = u64::from_str_radix(digits, radix)
            .map_err(|e| format!("failed to parse number '{digits}': {e}"))?;
        if negative {
            0i64.checked_sub_unsigned(magnitude)
                .ok_or_else(|| format!("number -{digits} out of range"))
        } else {
            Ok(magnitude as i64)
        }
    }

    fn read_number(&mut self) -> Result<u32, String> {
        let n = self.read_integer()?;
        u32::try_from(n).map_err(|_| format!("expected unsigned 32-bit number, found {n}"))
    }

    fn parse_function(&mut self) -> Result<(), String> {
        let func_name = self.read_identifier()?;
        let func_idx = self.ir.functions.len() as u32;

        if self.funcs.contains_key(func_name) {
            return Err(format!("duplicate function definition: '{func_name}'"));
        }

        // Reset per-function state
        self.blocks.clear();
        self.values.clear();
        self.block_resolves.clear();
        self.value_resolves.clear();

        self.expect('(')?;
        let arg_begin_idx = self.ir.values.len() as u32;

        while !self.try_read(')') {
            let arg_name = self.read_value_name()?;
            let arg_idx = self.ir.values.len() as u32;

            if self.values.insert(arg_name, arg_idx).is_some() {
                return Err(format!("redefinition of %{arg_name}"));
            }
            self.ir.values.push(Value {
                name: arg_name.to_string(),
                value_type: ValueType::Arg,
                op: Operation::None,
                call_func_idx: 0,
                op_count: 0,
                op_begin_idx: 0,
                op_end_idx: 0,
            });

            if !self.try_read(',') && self.current_char() != Some(')') {
                return Err("expected ',' or ')' in argument list".to_string());
            }
        }

        let arg_end_idx = self.ir.values.len() as u32;
        let block_begin_idx = self.ir.blocks.len() as u32;
        self.funcs.insert(func_name, func_idx);

        // Declaration: `name(%a)!`
        if self.try_read('!') {
            self.ir.functions.push(Function {
                name: func_name.to_string(),
                declaration: true,
                local_only: false,
                partition: None,
                block_begin_idx,
                block_end_idx: block_begin_idx,
                arg_begin_idx,
                arg_end_idx,
            });
            return Ok(());
        }

        let mut local_only = false;
        let mut partition = None;
        loop {
            self.skip_whitespace(true);
            if self.current_char() == Some('{') {
                break;
            }
            match self.read_identifier()? {
                "local" => local_only = true,
                "hw" => partition = Some(Partition::Hardware),
                "sw" => partition = Some(Partition::Software),
                other => return Err(format!("unknown function modifier '{other}'")),
            }
        }

        self.expect('{')?;
        while !self.try_read('}') {
            if self.is_eof() {
                return Err(format!("unterminated body of function '{func_name}'"));
            }
            self.parse_block()?;
        }
        let block_end_idx = self.ir.blocks.len() as u32;

        self.resolve_function_references()?;

        self.ir.functions.push(Function {
            name: func_name.to_string(),
            declaration: false,
            local_only,
            partition,
            block_begin_idx,
            block_end_idx,
            arg_begin_idx,
            arg_end_idx,
        });

        Ok(())
    }

    fn parse_block(&mut self) -> Result<(), String> {
        let block_name = self.read_identifier()?;
        self.expect(':')?;

        let block_idx = self.ir.blocks.len() as u32;
        if self.blocks.insert(block_name, block_idx).is_some() {
            return Err(format!("duplicate block label '{block_name}'"));
        }

        let inst_begin_idx = self.ir.values.len() as u32;
        let mut phi_end_idx = inst_begin_idx;
        let mut successor_refs = Vec::new();

        while !self.is_at_block_end() {
            if self.is_eof() {
                break;
            }

            if self.peek_phi() {
                if self.ir.values.len() as u32 > phi_end_idx {
                    return Err("PHI nodes must be at the beginning of a block".to_string());
                }
                self.parse_phi()?;
                phi_end_idx = self.ir.values.len() as u32;
            } else {
                self.parse_instruction(&mut successor_refs)?;
            }
        }

        let inst_end_idx = self.ir.values.len() as u32;

        let succ_begin_idx = self.ir.value_operands.len() as u32;
        for succ_name in successor_refs {
            self.push_block_ref(succ_name);
        }
        let succ_end_idx = self.ir.value_operands.len() as u32;

        self.ir.blocks.push(Block {
            name: block_name.to_string(),
            succ_begin_idx,
            succ_end_idx,
            inst_begin_idx,
            phi_end_idx,
            inst_end_idx,
        });

        Ok(())
    }

    fn is_at_block_end(&mut self) -> bool {
        self.skip_whitespace(true);

        if self.current_char() == Some('}') {
            return true;
        }

        // Next block starts with `label:`
        let saved_pos = self.pos;
        let has_colon = self.read_identifier().is_ok() && {
            self.skip_whitespace(true);
            self.current_char() == Some(':')
        };
        self.pos = saved_pos;
        has_colon
    }

    fn peek_phi(&mut self) -> bool {
        let saved_pos = self.pos;
        let is_phi = self.read_value_name().is_ok()
            && self.try_read('=')
            && matches!(self.read_identifier(), Ok("phi"));
        self.pos = saved_pos;
        is_phi
    }

    fn define_value(&mut self, name: &'a str) -> Result<u32, String> {
        let val_idx = self.ir.values.len() as u32;
        if self.values.insert(name, val_idx).is_some() {
            return Err(format!("redefinition of %{name}"));
        }
        Ok(val_idx)
    }

    fn push_value_ref(&mut self, name: &'a str) {
        self.value_resolves.push(Resolve {
            name,
            index: self.ir.value_operands.len() as u32,
        });
        self.ir.value_operands.push(0); // Placeholder
    }

    fn push_block_ref(&mut self, name: &'a str) {
        self.block_resolves.push(Resolve {
            name,
            index: self.ir.value_operands.len() as u32,
        });
        self.ir.value_operands.push(0); // Placeholder
    }

    fn parse_phi(&mut self) -> Result<(), String> {
        let name = self.read_value_name()?;
        self.expect('=')?;
        self.read_identifier()?;
        self.define_value(name)?;

        // [^block, %value], ...
        let mut incoming = Vec::new();
        loop {
            self.expect('[')?;
            let block_name = self.read_block_name()?;
            self.expect(',')?;
            let val_name = self.read_value_name()?;
            self.expect(']')?;
            incoming.push((block_name, val_name));

            if !self.try_read(',') {
                break;
            }
        }

        // Values first, then blocks
        let op_begin_idx = self.ir.value_operands.len() as u32;
        for &(_, val_name) in &incoming {
            self.push_value_ref(val_name);
        }
        for &(block_name, _) in &incoming {
            self.push_block_ref(block_name);
        }

        self.ir.values.push(Value {
            name: name.to_string(),
            value_type: ValueType::Phi,
            op: Operation::None,
            call_func_idx: 0,
            op_count: incoming.len() as u32,
            op_begin_idx,
            op_end_idx: self.ir.value_operands.len() as u32,
        });

        Ok(())
    }

    fn parse_instruction(&mut self, successors: &mut Vec<&'a str>) -> Result<(), String> {
        self.skip_whitespace(true);

        let name = if self.current_char() == Some('%') {
            let name = self.read_value_name()?;
            self.expect('=')?;
            Some(name)
        } else {
            None
        };
        let op_str = self.read_identifier()?;
        let op = Operation::parse(op_str).ok_or_else(|| format!("unknown operation: {op_str}"))?;
        let info = op.info();

        if name.is_some() && !info.is_def {
            return Err(format!("operation '{}' does not produce a value", info.name));
        }
        if name.is_none() && info.is_def && op != Operation::Call {
            return Err(format!("operation '{}' requires a result value", info.name));
        }

        if let Some(name) = name {
            self.define_value(name)?;
        }
        let val_idx = self.ir.values.len() as u32;
        let op_begin_idx = self.ir.value_operands.len() as u32;
        let mut op_count = info.op_count;

        match op {
            Operation::Const => {
                let value = self.read_integer()?;
                self.ir.value_operands.extend(split_imm(value));
            }
            Operation::Alloca => {
                // alloca <size>, <align>
                let size = self.read_number()?;
                self.expect(',')?;
                let align = self.read_number()?;
                self.ir.value_operands.push(size);
                self.ir.value_operands.push(align);
            }
            Operation::Br => {
                let block_name = self.read_block_name()?;
                self.push_block_ref(block_name);
                successors.push(block_name);
            }
            Operation::CondBr => {
                // condbr %cond, ^true_block, ^false_block
                let cond_name = self.read_value_name()?;
                self.expect(',')?;
                let true_block = self.read_block_name()?;
                self.expect(',')?;
                let false_block = self.read_block_name()?;

                self.push_value_ref(cond_name);
                self.push_block_ref(true_block);
                self.push_block_ref(false_block);
                successors.push(true_block);
                successors.push(false_block);
            }
            Operation::Call => {
                // call @func_name[, %arg]*
                self.expect('@')?;
                let func_name = self.read_identifier()?;
                self.func_resolves.push(Resolve {
                    name: func_name,
                    index: val_idx,
                });

                op_count = 0;
                self.skip_whitespace(false);
                while self.current_char() == Some(',') {
                    self.advance();
                    let arg_name = self.read_value_name()?;
                    self.push_value_ref(arg_name);
                    op_count += 1;
                    self.skip_whitespace(false);
                }
            }
            _ => {
                for i in 0..info.op_count {
                    if i > 0 {
                        self.expect(',')?;
                    }
                    let operand = self.read_value_name()?;
                    self.push_value_ref(operand);
                }
            }
        }

        self.ir.values.push(Value {
            name: name.map(str::to_string).unwrap_or_default(),
            value_type: if info.is_terminator {
                ValueType::Terminator
            } else {
                ValueType::Normal
            },
            op,
            call_func_idx: 0,
            op_count,
            op_begin_idx,
            op_end_idx: self.ir.value_operands.len() as u32,
        });

        Ok(())
    }

    fn resolve_function_references(&mut self) -> Result<(), String> {
        for resolve in &self.value_resolves {
            match self.values.get(resolve.name) {
                Some(&idx) => self.ir.value_operands[resolve.index as usize] = idx,
                None => return Err(format!("undefined value reference: %{}", resolve.name)),
            }
        }

        for resolve in &self.block_resolves {
            match self.blocks.get(resolve.name) {
                Some(&idx) => self.ir.value_operands[resolve.index as usize] = idx,
                None => return Err(format!("undefined block reference: ^{}", resolve.name)),
            }
        }

        Ok(())
    }

    fn resolve_all_references(&mut self) -> Result<(), String> {
        for resolve in &self.func_resolves {
            match self.funcs.get(resolve.name) {
                Some(&idx) => self.ir.values[resolve.index as usize].call_func_idx = idx,
                None => return Err(format!("undefined function reference: @{}", resolve.name)),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_add() {
        let ir = Module::parse(
            r#"
; Simple add function
func(%a, %b) {
entry:
  %c = add %a, %b
  ret %c
}
"#,
        )
        .unwrap();

        assert_eq!(ir.functions.len(), 1);
        assert_eq!(ir.functions[0].name, "func");
        assert_eq!(ir.functions[0].partition, None);
        assert_eq!(ir.blocks.len(), 1);
        assert_eq!(ir.blocks[0].name, "entry");
        assert_eq!(ir.values.len(), 4);
        assert_eq!(ir.values[2].name, "c");
        assert_eq!(ir.values[2].op, Operation::Add);
        assert_eq!(ir.operands(2), &[0, 1]);
    }

    #[test]
    fn test_parse_branches_and_successors() {
        let ir = Module::parse(
            r#"
br1(%v) {
entry:
  condbr %v, ^left, ^right
left:
  br ^right
right:
  terminate
}
"#,
        )
        .unwrap();

        assert_eq!(ir.blocks.len(), 3);
        assert_eq!(ir.block_succs(0), &[1, 2]);
        assert_eq!(ir.block_succs(1), &[2]);
        assert!(ir.block_succs(2).is_empty());
        assert_eq!(ir.values[1].op, Operation::CondBr);
        assert_eq!(ir.values[1].op_count, 1);
    }

    #[test]
    fn test_parse_modifiers() {
        let ir = Module::parse(
            r#"
a() local hw {
entry:
  terminate
}
b() sw {
entry:
  terminate
}
ext(%x, %y)!
"#,
        )
        .unwrap();

        assert!(ir.functions[0].local_only);
        assert_eq!(ir.functions[0].partition, Some(Partition::Hardware));
        assert_eq!(ir.functions[1].partition, Some(Partition::Software));
        assert!(ir.functions[2].declaration);
        assert_eq!(ir.functions[2].arg_count(), 2);
    }

    #[test]
    fn test_parse_forward_call_and_constants() {
        let ir = Module::parse(
            r#"
caller() {
entry:
  %k = const 0x10
  %m = const -1
  %r = call @callee, %k, %m
  call @callee, %r, %r
  terminate
}
callee(%a, %b)!
"#,
        )
        .unwrap();

        assert_eq!(ir.const_value(0), Some(16));
        assert_eq!(ir.const_value(1), Some(-1));
        assert_eq!(ir.values[2].call_func_idx, 1);
        assert_eq!(ir.operands(2), &[0, 1]);
        assert_eq!(ir.values[3].name, "");
        assert_eq!(ir.operands(3), &[2, 2]);
    }

    #[test]
    fn test_parse_alloca() {
        let ir = Module::parse(
            r#"
func() {
entry:
  %slot = alloca 16, 8
  terminate
}
"#,
        )
        .unwrap();

        assert_eq!(ir.values[0].op, Operation::Alloca);
        assert_eq!(ir.immediates(0), &[16, 8]);
    }

    #[test]
    fn test_parse_errors() {
        let undefined = Module::parse("f() {\nentry:\n  ret %nope\n}\n").unwrap_err();
        assert!(undefined.contains("undefined value reference: %nope"), "{undefined}");

        let missing = Module::parse("f() {\nentry:\n  call @g\n  terminate\n}\n").unwrap_err();
        assert!(missing.contains("@g"), "{missing}");

        let redefined =
            Module::parse("f(%a) {\nentry:\n  %a = const 1\n  terminate\n}\n").unwrap_err();
        assert!(redefined.contains("redefinition"), "{redefined}");

        let bad_modifier = Module::parse("f() fast {\nentry:\n  terminate\n}\n").unwrap_err();
        assert!(bad_modifier.starts_with("line 1:"), "{bad_modifier}");

        let no_result = Module::parse("f(%a) {\nentry:\n  %x = ret %a\n}\n").unwrap_err();
        assert!(no_result.contains("does not produce a value"), "{no_result}");
    }

    #[test]
    fn test_print_ir() {
        let ir = Module::parse(
            r#"
func(%a, %b) hw {
entry:
  %c = add %a, %b
  ret %c
}
"#,
        )
        .unwrap();
        let output = ir.print();

        assert!(output.contains("Function func [hw]"));
        assert!(output.contains("Block entry"));
        assert!(output.contains("Value c (add)"));
        assert!(output.contains("Op a"));
        assert!(output.contains("Op b"));
        assert!(output.contains("Value (ret)"));
    }
}
