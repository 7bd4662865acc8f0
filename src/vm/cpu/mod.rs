pub mod decoder;

use crate::error::{VmError, VmResult};
use crate::vm::dictionary;
use crate::vm::object;
use crate::vm::text;
use crate::vm::text::zscii;
use crate::vm::Machine;
use decoder::{ArityClass, Decoded};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

impl Machine {
    /// Routes a decoded instruction to its arity-specific handler table.
    pub(crate) fn dispatch(&mut self, decoded: Decoded) -> VmResult<()> {
        match decoded.arity {
            ArityClass::Zero => self.dispatch_zero(decoded.opcode),
            ArityClass::One => self.dispatch_one(decoded.opcode, decoded.operands[0]),
            ArityClass::Two => self.dispatch_two(decoded.opcode, &decoded.operands),
            ArityClass::Var => self.dispatch_var(decoded.opcode, &decoded.operands),
        }
    }

    /// Reads a packed string starting at PC, advancing PC past it.
    fn read_inline_string(&mut self) -> VmResult<Vec<u8>> {
        let zchars = text::read_zchars(&self.memory, self.pc)?;
        self.pc += text::packed_byte_len(&zchars);
        text::decode_to_zscii(
            &self.memory,
            self.memory.version(),
            self.abbreviation_base,
            &zchars,
            true,
        )
    }

    fn print_zscii(&self, bytes: &[u8]) {
        self.io.emit(zscii::display_string(bytes));
    }

    fn dispatch_zero(&mut self, opcode: u8) -> VmResult<()> {
        match opcode {
            0x0 => self.return_from_routine(1),
            0x1 => self.return_from_routine(0),
            0x2 => {
                let s = self.read_inline_string()?;
                self.print_zscii(&s);
                Ok(())
            }
            0x3 => {
                let s = self.read_inline_string()?;
                self.print_zscii(&s);
                self.io.emit("\n");
                self.return_from_routine(1)
            }
            0x4 => Ok(()),
            0x5 => {
                let ok = self.save()?;
                self.branch(ok)
            }
            0x6 => {
                let ok = self.restore()?;
                self.branch(ok)
            }
            0x7 => self.restart(),
            0x8 => {
                let v = self.value_stack.pop()?;
                self.return_from_routine(v)
            }
            0x9 => {
                self.value_stack.pop()?;
                Ok(())
            }
            0xA => {
                self.quit();
                Ok(())
            }
            0xB => {
                self.io.emit("\n");
                Ok(())
            }
            0xC => Ok(()), // set_status, no-op in v<=3
            0xD => self.branch(true),
            _ => Ok(()), // extended/piracy: not part of v<=3
        }
    }

    fn dispatch_one(&mut self, opcode: u8, operand: u16) -> VmResult<()> {
        match opcode {
            0x0 => self.branch(operand == 0),
            0x1 => {
                let value = object::sibling(&self.memory, self.object_table_base, operand as u8);
                self.store(value as u16)?;
                self.branch(value != 0)
            }
            0x2 => {
                let value = object::child(&self.memory, self.object_table_base, operand as u8);
                self.store(value as u16)?;
                self.branch(value != 0)
            }
            0x3 => {
                let value = object::parent(&self.memory, self.object_table_base, operand as u8);
                self.store(value as u16)
            }
            0x4 => {
                let size = if operand == 0 {
                    0
                } else {
                    object::property_size(&self.memory, operand as usize) as u16
                };
                self.store(size)
            }
            0x5 => {
                let var = operand as u8;
                let v = self.get_variable(var)?;
                self.set_variable(var, v.wrapping_add(1))
            }
            0x6 => {
                let var = operand as u8;
                let v = self.get_variable(var)?;
                self.set_variable(var, v.wrapping_sub(1))
            }
            0x7 => {
                let zchars = text::read_zchars(&self.memory, operand as usize)?;
                let zscii = text::decode_to_zscii(
                    &self.memory,
                    self.memory.version(),
                    self.abbreviation_base,
                    &zchars,
                    true,
                )?;
                self.print_zscii(&zscii);
                Ok(())
            }
            0x9 => {
                object::remove_object(&mut self.memory, self.object_table_base, operand as u8);
                Ok(())
            }
            0xA => {
                let name = object::name(
                    &self.memory,
                    self.object_table_base,
                    self.memory.version(),
                    self.abbreviation_base,
                    operand as u8,
                )?;
                self.print_zscii(&name);
                Ok(())
            }
            0xB => self.return_from_routine(operand),
            0xC => {
                let offset = operand as i16 as i64;
                self.pc = (self.pc as i64 + offset - 2) as usize;
                Ok(())
            }
            0xD => {
                let addr = crate::vm::memory::Memory::unpack_address(operand);
                let zchars = text::read_zchars(&self.memory, addr)?;
                let zscii = text::decode_to_zscii(
                    &self.memory,
                    self.memory.version(),
                    self.abbreviation_base,
                    &zchars,
                    true,
                )?;
                self.print_zscii(&zscii);
                Ok(())
            }
            0xE => {
                let var = operand as u8;
                let value = if var == 0 {
                    self.value_stack.peek()
                } else {
                    self.get_variable(var)?
                };
                self.store(value)
            }
            0xF => self.store(!operand),
            _ => Ok(()), // call_1s: version 4+, not reachable from valid v<=3 bytecode
        }
    }

    fn dispatch_two(&mut self, opcode: u8, operands: &[u16]) -> VmResult<()> {
        let a = operands[0];
        let b = *operands.get(1).unwrap_or(&0);
        match opcode {
            0x01 => self.branch(operands[1..].iter().any(|&v| v == a)),
            0x02 => self.branch((a as i16) < (b as i16)),
            0x03 => self.branch((a as i16) > (b as i16)),
            0x04 => {
                let var = a as u8;
                let value = (self.get_variable(var)? as i16).wrapping_sub(1);
                self.set_variable(var, value as u16)?;
                self.branch(value < b as i16)
            }
            0x05 => {
                let var = a as u8;
                let value = (self.get_variable(var)? as i16).wrapping_add(1);
                self.set_variable(var, value as u16)?;
                self.branch(value > b as i16)
            }
            0x06 => {
                let parent = object::parent(&self.memory, self.object_table_base, a as u8);
                self.branch(parent == b as u8)
            }
            0x07 => self.branch(a & b == b),
            0x08 => self.store(a | b),
            0x09 => self.store(a & b),
            0x0A => {
                let set = object::get_attribute(&self.memory, self.object_table_base, a as u8, b as u8)?;
                self.branch(set)
            }
            0x0B => {
                object::set_attribute(&mut self.memory, self.object_table_base, a as u8, b as u8, true)
            }
            0x0C => {
                object::set_attribute(&mut self.memory, self.object_table_base, a as u8, b as u8, false)
            }
            0x0D => {
                let var = a as u8;
                if var == 0 {
                    self.value_stack.pop()?;
                    self.value_stack.push(b)
                } else {
                    self.set_variable(var, b)
                }
            }
            0x0E => {
                object::insert_object(&mut self.memory, self.object_table_base, a as u8, b as u8);
                Ok(())
            }
            0x0F => {
                let value = self.memory.word(a as usize + 2 * b as usize)?;
                self.store(value)
            }
            0x10 => {
                let value = self.memory.byte(a as usize + b as usize) as u16;
                self.store(value)
            }
            0x11 => {
                let prop = b as u8;
                let addr = object::property_address(&self.memory, self.object_table_base, a as u8, prop)?;
                let value = if addr == 0 {
                    object::default_property(&self.memory, self.object_table_base, prop)?
                } else if object::property_size(&self.memory, addr) == 1 {
                    self.memory.byte(addr) as u16
                } else {
                    self.memory.word(addr)?
                };
                self.store(value)
            }
            0x12 => {
                let addr =
                    object::property_address(&self.memory, self.object_table_base, a as u8, b as u8)?;
                self.store(addr as u16)
            }
            0x13 => {
                let next = object::next_property(&self.memory, self.object_table_base, a as u8, b as u8)?;
                self.store(next as u16)
            }
            0x14 => self.store(((a as i16).wrapping_add(b as i16)) as u16),
            0x15 => self.store(((a as i16).wrapping_sub(b as i16)) as u16),
            0x16 => self.store(((a as i16).wrapping_mul(b as i16)) as u16),
            0x17 => {
                if b == 0 {
                    return Err(VmError::DivisionByZero);
                }
                self.store(((a as i16) / (b as i16)) as u16)
            }
            0x18 => {
                if b == 0 {
                    return Err(VmError::DivisionByZero);
                }
                self.store(((a as i16) % (b as i16)) as u16)
            }
            _ => Ok(()), // call_2s/call_2n/set_colour/throw: version 4+
        }
    }

    fn dispatch_var(&mut self, opcode: u8, operands: &[u16]) -> VmResult<()> {
        match opcode {
            0x0 => self.call(operands),
            0x1 => {
                let addr = operands[0] as usize + 2 * operands[1] as usize;
                self.memory.set_word(addr, operands[2]);
                Ok(())
            }
            0x2 => {
                let addr = operands[0] as usize + operands[1] as usize;
                self.memory.set_byte(addr, operands[2] as u8);
                Ok(())
            }
            0x3 => {
                let obj = operands[0] as u8;
                let prop = operands[1] as u8;
                let value = operands[2];
                let addr = object::property_address(&self.memory, self.object_table_base, obj, prop)?;
                if addr == 0 {
                    return Ok(());
                }
                match object::property_size(&self.memory, addr) {
                    1 => self.memory.set_byte(addr, value as u8),
                    2 => self.memory.set_word(addr, value),
                    _ => return Err(VmError::IllegalPutProp),
                }
                Ok(())
            }
            0x4 => self.read_opcode(operands[0] as usize, operands[1] as usize),
            0x5 => {
                if let Some(ch) = zscii::display_char(operands[0] as u8) {
                    self.io.emit(ch.to_string());
                }
                Ok(())
            }
            0x6 => {
                self.io.emit((operands[0] as i16).to_string());
                Ok(())
            }
            0x7 => self.random(operands[0] as i16),
            0x8 => self.value_stack.push(operands[0]),
            0x9 => {
                let var = operands[0] as u8;
                let value = self.value_stack.pop()?;
                self.set_variable(var, value)
            }
            _ => Ok(()), // split_window/set_window/output_stream/...: no screen model
        }
    }

    fn read_opcode(&mut self, text_addr: usize, parse_addr: usize) -> VmResult<()> {
        let line = self.io.read_line()?;
        let lowered = line.to_lowercase();
        let capacity = self.memory.byte(text_addr) as usize;
        let mut bytes: Vec<u8> = lowered.bytes().collect();
        bytes.truncate(capacity);
        for (i, &b) in bytes.iter().enumerate() {
            self.memory.set_byte(text_addr + 1 + i, b);
        }
        self.memory.set_byte(text_addr + 1 + bytes.len(), 0);
        dictionary::tokenize(&mut self.memory, &self.dictionary, parse_addr, &bytes)
    }

    fn random(&mut self, r: i16) -> VmResult<()> {
        let dest = self.memory.byte(self.pc);
        self.pc += 1;
        if r == 0 {
            self.rng = StdRng::from_os_rng();
        } else if r < 0 {
            self.rng = StdRng::seed_from_u64((-(r as i32)) as u64);
        } else {
            let value = self.rng.random_range(0..=r as u16);
            self.set_variable(dest, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::io::Io;
    use crate::vm::memory;
    use std::sync::mpsc;

    fn machine() -> Machine {
        let mut bytes = vec![0u8; 0x100];
        bytes[memory::constants::HEADER_VERSION as usize] = 3;
        bytes[memory::constants::HEADER_DYNAMIC_END as usize + 1] = 0xFF;
        let (_input_tx, input_rx) = mpsc::channel();
        let (output_tx, _output_rx) = mpsc::channel();
        Machine::load_story(bytes, Io::new(input_rx, output_tx)).unwrap()
    }

    #[test]
    fn dispatch_zero_quit_stops_the_machine() {
        let mut machine = machine();
        machine.dispatch_zero(0xA).unwrap();
        assert!(!machine.is_running());
    }

    #[test]
    fn dispatch_one_inc_wraps_the_named_variable() {
        let mut machine = machine();
        machine.set_variable(0x10, 0xFFFF).unwrap();
        machine.dispatch_one(0x5, 0x10).unwrap();
        assert_eq!(machine.get_variable(0x10).unwrap(), 0);
    }

    #[test]
    fn dispatch_two_add_stores_the_wrapped_sum() {
        let mut machine = machine();
        machine.pc = 0x80;
        machine.memory.set_byte(machine.pc, 0x10); // dest var: global 0x00
        machine.dispatch_two(0x14, &[3, 4]).unwrap();
        assert_eq!(machine.get_variable(0x10).unwrap(), 7);
        assert_eq!(machine.pc, 0x81);
    }

    #[test]
    fn dispatch_two_div_by_zero_is_rejected() {
        let mut machine = machine();
        machine.pc = 0x80;
        machine.memory.set_byte(machine.pc, 0x10);
        assert!(matches!(
            machine.dispatch_two(0x17, &[10, 0]),
            Err(VmError::DivisionByZero)
        ));
    }

    /// The stored frame's word 0 (`arg_mask | local_count`) is what a
    /// Quetzal `Stks` chunk records verbatim — a wrong arg_mask here
    /// silently corrupts every save file for a call with >=1 argument.
    #[test]
    fn dispatch_var_call_records_the_correct_arg_mask_in_the_call_frame() {
        let mut machine = machine();
        let routine = 0x40usize;
        machine.memory.set_byte(routine, 3); // 3 locals
        machine.memory.set_word(routine + 1, 0);
        machine.memory.set_word(routine + 3, 0);
        machine.memory.set_word(routine + 5, 0);

        machine.pc = 0x80;
        machine.memory.set_byte(machine.pc, 0x10); // dest var

        machine.dispatch_var(0x0, &[0x20, 5, 6]).unwrap(); // 2 supplied args

        let frame_word0 = machine.call_stack.raw()[0];
        let expected_arg_mask = (0x7Fu16 >> 2) << 8;
        assert_eq!(frame_word0, expected_arg_mask | 3);
    }

    #[test]
    fn dispatch_var_push_pull_round_trip_the_value_stack() {
        let mut machine = machine();
        machine.dispatch_var(0x8, &[99]).unwrap(); // push
        machine.pc = 0x80;
        machine.memory.set_byte(machine.pc, 0x10); // dest var for pull
        machine.dispatch_var(0x9, &[0x10]).unwrap(); // pull
        assert_eq!(machine.get_variable(0x10).unwrap(), 99);
    }
}
