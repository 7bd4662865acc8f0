pub mod cpu;
pub mod dictionary;
pub mod io;
pub mod memory;
pub mod object;
pub mod save;
pub mod stack;
pub mod text;

use crate::error::{VmError, VmResult};
use dictionary::Dictionary;
use io::Io;
use memory::{constants::*, Memory};
use rand::rngs::StdRng;
use rand::SeedableRng;
use stack::Stack;
use std::path::PathBuf;

/// A running Z-machine story. Owns the memory arena, both stacks, the
/// program counter, and the handful of header-derived bases every
/// component needs (object table, globals, abbreviations, dictionary).
pub struct Machine {
    pub(crate) memory: Memory,
    pub(crate) value_stack: Stack,
    pub(crate) call_stack: Stack,
    pub(crate) pc: usize,
    pub(crate) object_table_base: u16,
    pub(crate) global_variable_base: u16,
    pub(crate) abbreviation_base: u16,
    pub(crate) dictionary: Dictionary,
    pub(crate) io: Io,
    /// The story image exactly as loaded, kept around for `restart` and as
    /// the `CMem` diff base for save/restore.
    pub(crate) original: Vec<u8>,
    pub(crate) save_path: Option<PathBuf>,
    pub(crate) rng: StdRng,
    running: bool,
}

impl Machine {
    /// Loads a story file's raw bytes into a fresh memory arena. Corresponds
    /// to the host's `LoadStory()`; acquiring the bytes themselves (from a
    /// filesystem path or elsewhere) is the host's responsibility.
    pub fn load_story(bytes: Vec<u8>, io: Io) -> VmResult<Self> {
        let original = bytes.clone();
        let memory = Memory::new(bytes)?;
        Ok(Machine {
            memory,
            value_stack: Stack::new(STACK_SIZE),
            call_stack: Stack::new(STACK_SIZE),
            pc: 0,
            object_table_base: 0,
            global_variable_base: 0,
            abbreviation_base: 0,
            dictionary: Dictionary {
                separators: Vec::new(),
                entry_length: 0,
                entry_count: 0,
                entries_start: 0,
            },
            io,
            original,
            save_path: None,
            rng: StdRng::from_os_rng(),
            running: true,
        })
    }

    /// Sets the path `save`/`restore` opcodes read and write. Without one,
    /// both opcodes report failure, matching a host with no file system.
    pub fn set_save_path(&mut self, path: impl Into<PathBuf>) {
        self.save_path = Some(path.into());
    }

    /// Reads the remaining header fields, builds the dictionary index, and
    /// positions the program counter at the story's entry point. Must run
    /// once before the first `execute_cycle`.
    pub fn complete_setup(&mut self) -> VmResult<()> {
        self.object_table_base = self.memory.word(HEADER_OBJECT_TABLE_BASE as usize)?;
        self.global_variable_base = self.memory.word(HEADER_GLOBAL_VARIABLE_BASE as usize)?;
        self.abbreviation_base = self.memory.word(HEADER_ABBREVIATION_BASE as usize)?;
        let dictionary_base = self.memory.word(HEADER_DICTIONARY_BASE as usize)?;
        self.dictionary = Dictionary::read(&self.memory, dictionary_base)?;
        self.pc = self.memory.word(HEADER_INITIAL_PC as usize)? as usize;

        log::info!(
            "loaded version {} story, dynamic_end={:#06x} high_start={:#06x}",
            self.memory.version(),
            self.memory.dynamic_end(),
            self.memory.high_start(),
        );
        log::info!(
            "object_table={:#06x} global_variable_base={:#06x} abbreviation_base={:#06x} dictionary_base={:#06x}",
            self.object_table_base,
            self.global_variable_base,
            self.abbreviation_base,
            dictionary_base,
        );
        log::info!("pc={:#06x}", self.pc);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// `quit`'s clean terminator, replacing the source's fatal panic.
    pub(crate) fn quit(&mut self) {
        self.running = false;
    }

    /// Variable 0 is the top of the value stack; variables 1..localCount
    /// index into the value stack at the active frame's base; variables
    /// >=0x10 are globals.
    pub(crate) fn get_variable(&mut self, variable: u8) -> VmResult<u16> {
        if variable == 0x00 {
            self.value_stack.pop()
        } else if variable >= 0x10 {
            self.memory
                .word(self.global_variable_base as usize + (variable as usize - 0x10) * 2)
        } else {
            let base = self.call_stack.peek() as usize;
            self.value_stack.look(base + variable as usize - 1)
        }
    }

    pub(crate) fn set_variable(&mut self, variable: u8, value: u16) -> VmResult<()> {
        if variable == 0x00 {
            self.value_stack.push(value)
        } else if variable >= 0x10 {
            self.memory.set_word(
                self.global_variable_base as usize + (variable as usize - 0x10) * 2,
                value,
            );
            Ok(())
        } else {
            let base = self.call_stack.peek() as usize;
            self.value_stack.set(base + variable as usize - 1, value)
        }
    }

    /// Reads the store destination byte at PC and writes `value` there.
    pub(crate) fn store(&mut self, value: u16) -> VmResult<()> {
        let dest = self.memory.byte(self.pc);
        self.pc += 1;
        self.set_variable(dest, value)
    }

    /// Reads a branch descriptor at PC and takes it if `result` matches the
    /// descriptor's polarity. Offsets 0/1 are `return 0`/`return 1`
    /// shortcuts; any other taken branch adds `offset - 2` to PC.
    pub(crate) fn branch(&mut self, result: bool) -> VmResult<()> {
        let first = self.memory.byte(self.pc);
        self.pc += 1;
        let required = first & 0x80 == 0x80;
        let mut target = (first & 0x3F) as i32;
        if first & 0x40 == 0 {
            let second = self.memory.byte(self.pc);
            self.pc += 1;
            target = (target << 8) | second as i32;
            if target & (1 << 13) != 0 {
                target -= 1 << 14;
            }
        }

        if result == required {
            match target {
                0 => self.return_from_routine(0)?,
                1 => self.return_from_routine(1)?,
                _ => {
                    self.pc = (self.pc as i64 + target as i64 - 2) as usize;
                }
            }
        }
        Ok(())
    }

    /// Pushes a call frame and jumps into `routine`'s first instruction.
    /// `operands[0]` is the packed routine address; the rest are the
    /// arguments supplied by the caller.
    pub(crate) fn call(&mut self, operands: &[u16]) -> VmResult<()> {
        let packed = operands[0];
        if packed == 0 {
            return self.store(0);
        }
        let routine = Memory::unpack_address(packed);
        let local_count = self.memory.byte(routine);
        if local_count > 15 {
            return Err(VmError::InvalidRoutine(routine as u32));
        }
        let arg_count = operands.len() - 1;

        let dest = self.memory.byte(self.pc);
        self.pc += 1;
        let arg_mask = (0x7Fu16 >> arg_count.min(7)) << 8;
        self.call_stack.push(arg_mask | local_count as u16)?;
        self.call_stack.push(dest as u16)?;
        self.call_stack.push((self.pc >> 16) as u16)?;
        self.call_stack.push((self.pc & 0xFFFF) as u16)?;
        self.call_stack.push(self.value_stack.size() as u16)?;

        for i in 0..local_count {
            let value = if (i as usize) < arg_count {
                operands[i as usize + 1]
            } else {
                self.memory.word(routine + 1 + 2 * i as usize)?
            };
            self.value_stack.push(value)?;
        }
        self.pc = routine + 1 + 2 * local_count as usize;
        Ok(())
    }

    /// Pops a frame, restores the caller's PC and truncates the value
    /// stack, then stores `value` into the caller's destination variable.
    pub(crate) fn return_from_routine(&mut self, value: u16) -> VmResult<()> {
        let truncate_to = self.call_stack.pop()? as usize;
        let pc_low = self.call_stack.pop()? as usize;
        let pc_high = self.call_stack.pop()? as usize;
        let dest = self.call_stack.pop()? as u8;
        self.call_stack.pop()?; // argMask | localCount, unused on return
        self.pc = (pc_high << 16) | pc_low;
        self.value_stack.truncate(truncate_to)?;
        self.set_variable(dest, value)
    }

    /// Resets dynamic memory to the freshly-loaded image and both stacks to
    /// empty, then jumps back to the story's entry point.
    pub(crate) fn restart(&mut self) -> VmResult<()> {
        let dynamic_len = self.memory.dynamic_end() as usize + 1;
        self.memory.set_dynamic_slice(&self.original[..dynamic_len]);
        self.value_stack.truncate(0)?;
        self.call_stack.truncate(0)?;
        self.pc = self.memory.word(HEADER_INITIAL_PC as usize)? as usize;
        Ok(())
    }

    /// Runs one decode-dispatch cycle.
    pub fn execute_cycle(&mut self) -> VmResult<()> {
        let decoded = self.decode()?;
        self.dispatch(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn machine() -> Machine {
        let mut bytes = vec![0u8; 0x100];
        bytes[memory::constants::HEADER_VERSION as usize] = 3;
        bytes[memory::constants::HEADER_DYNAMIC_END as usize + 1] = 0xFF;
        let (_input_tx, input_rx) = mpsc::channel();
        let (output_tx, _output_rx) = mpsc::channel();
        Machine::load_story(bytes, Io::new(input_rx, output_tx)).unwrap()
    }

    /// Routine at 0x40 (packed address 0x20), 2 locals with defaults 7, 9.
    /// `call 0x20, 42` supplies one argument, leaving locals `42, 9`;
    /// `ret 11` then hands 11 back to the caller's destination variable and
    /// restores the value stack to its pre-call size.
    #[test]
    fn call_and_return_round_trip_locals_and_value_stack() {
        let mut machine = machine();
        let routine = 0x40usize;
        machine.memory.set_byte(routine, 2);
        machine.memory.set_word(routine + 1, 7);
        machine.memory.set_word(routine + 3, 9);

        machine.value_stack.push(0xAAAA).unwrap();
        let stack_size_before = machine.value_stack.size();

        machine.pc = 0x80;
        machine.memory.set_byte(machine.pc, 0x10); // dest var: global 0x00

        machine.call(&[0x20, 42]).unwrap();

        assert_eq!(machine.get_variable(1).unwrap(), 42);
        assert_eq!(machine.get_variable(2).unwrap(), 9);

        machine.return_from_routine(11).unwrap();

        assert_eq!(machine.value_stack.size(), stack_size_before);
        assert_eq!(machine.get_variable(0x10).unwrap(), 11);
        assert_eq!(machine.pc, 0x81);
    }

    #[test]
    fn calling_the_null_routine_stores_zero_without_pushing_a_frame() {
        let mut machine = machine();
        machine.pc = 0x80;
        machine.memory.set_byte(machine.pc, 0x10); // dest var: global 0x00
        let call_stack_depth = machine.call_stack.size();

        machine.call(&[0]).unwrap();

        assert_eq!(machine.get_variable(0x10).unwrap(), 0);
        assert_eq!(machine.call_stack.size(), call_stack_depth);
    }

    #[test]
    fn branch_offset_zero_and_one_are_return_shortcuts() {
        let mut machine = machine();
        // Hand-assemble a frame so `branch`'s return-0 shortcut has a caller
        // to land in: dest var 0x10, return PC 0x200, frame base 0.
        machine.call_stack.push(0).unwrap(); // arg_mask | local_count
        machine.call_stack.push(0x10).unwrap(); // dest var
        machine.call_stack.push(0).unwrap(); // return PC, high half
        machine.call_stack.push(0x200).unwrap(); // return PC, low half
        machine.call_stack.push(0).unwrap(); // value-stack size at call time

        machine.pc = 0x90;
        machine.memory.set_byte(machine.pc, 0xC0); // branch-if-true, single byte, offset 0 (return false)
        machine.branch(true).unwrap();

        assert_eq!(machine.pc, 0x200);
        assert_eq!(machine.get_variable(0x10).unwrap(), 0);
    }

    #[test]
    fn restart_resets_dynamic_memory_and_stacks_but_keeps_pc_at_entry() {
        let mut machine = machine();
        let entry = 0x55u16;
        let pc_addr = memory::constants::HEADER_INITIAL_PC as usize;
        machine.memory.set_word(pc_addr, entry);
        // `original` has to agree — it's the pristine image `restart` resets
        // dynamic memory from, captured once at `load_story` time.
        machine.original[pc_addr] = (entry >> 8) as u8;
        machine.original[pc_addr + 1] = entry as u8;
        machine.memory.set_byte(0x10, 0xFF);
        machine.value_stack.push(1).unwrap();
        machine.call_stack.push(1).unwrap();

        machine.restart().unwrap();

        assert_eq!(machine.memory.byte(0x10), 0);
        assert_eq!(machine.value_stack.size(), 0);
        assert_eq!(machine.call_stack.size(), 0);
        assert_eq!(machine.pc, entry as usize);
    }
}
