//! The Quetzal-style save format: a chunked IFF container carrying the
//! story header fingerprint, dynamic memory, and both stacks.

pub mod cmem;

use crate::error::{VmError, VmResult};
use crate::vm::Machine;

const FORM: &[u8; 4] = b"FORM";
const IFZS: &[u8; 4] = b"IFZS";

fn write_chunk(out: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
}

struct Frame {
    local_count: u8,
    arg_mask: u8,
    dest_var: u8,
    pc: usize,
    base: usize,
}

fn gather_frames(machine: &Machine) -> Vec<Frame> {
    let raw = machine.call_stack.raw();
    let mut frames = Vec::new();
    let mut i = 0;
    while i + 5 <= raw.len() {
        let word0 = raw[i];
        frames.push(Frame {
            local_count: (word0 & 0x00FF) as u8,
            arg_mask: (word0 >> 8) as u8,
            dest_var: raw[i + 1] as u8,
            pc: ((raw[i + 2] as usize) << 16) | raw[i + 3] as usize,
            base: raw[i + 4] as usize,
        });
        i += 5;
    }
    frames
}

fn encode_stacks(machine: &Machine) -> Vec<u8> {
    let frames = gather_frames(machine);
    let stack = machine.value_stack.raw();
    let mut out = Vec::new();

    let dummy_size = frames.first().map(|f| f.base).unwrap_or(stack.len());
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&(dummy_size as u16).to_be_bytes());
    for &w in &stack[..dummy_size] {
        out.extend_from_slice(&w.to_be_bytes());
    }

    for (idx, frame) in frames.iter().enumerate() {
        let eval_start = frame.base + frame.local_count as usize;
        let eval_end = frames.get(idx + 1).map(|f| f.base).unwrap_or(stack.len());

        // PC is saved one ahead of the running convention, matching IFhd.
        let pc = frame.pc + 1;
        out.push((pc >> 16) as u8);
        out.push((pc >> 8) as u8);
        out.push(pc as u8);
        out.push(frame.local_count & 0x0F);
        out.push(frame.dest_var);
        out.push(frame.arg_mask);
        out.extend_from_slice(&((eval_end - eval_start) as u16).to_be_bytes());
        for &w in &stack[frame.base..eval_end] {
            out.extend_from_slice(&w.to_be_bytes());
        }
    }
    out
}

fn read_u16(data: &[u8], pos: usize) -> VmResult<u16> {
    data.get(pos..pos + 2)
        .map(|s| u16::from_be_bytes([s[0], s[1]]))
        .ok_or(VmError::SaveTruncated)
}

fn restore_stacks(machine: &mut Machine, data: &[u8]) -> VmResult<()> {
    machine.value_stack.truncate(0)?;
    machine.call_stack.truncate(0)?;

    let mut pos = 6; // skip the dummy frame's zeroed header
    let dummy_size = read_u16(data, pos)? as usize;
    pos += 2;
    for _ in 0..dummy_size {
        machine.value_stack.push(read_u16(data, pos)?)?;
        pos += 2;
    }

    while pos < data.len() {
        if pos + 8 > data.len() {
            return Err(VmError::SaveTruncated);
        }
        let pc = ((data[pos] as usize) << 16) | ((data[pos + 1] as usize) << 8) | data[pos + 2] as usize;
        let local_count = (data[pos + 3] & 0x0F) as usize;
        let dest_var = data[pos + 4];
        let arg_mask = data[pos + 5];
        let total_words = local_count + read_u16(data, pos + 6)? as usize;
        pos += 8;

        let base = machine.value_stack.size();
        for _ in 0..total_words {
            machine.value_stack.push(read_u16(data, pos)?)?;
            pos += 2;
        }

        let saved_pc = pc.saturating_sub(1);
        machine.call_stack.push((arg_mask as u16) << 8 | local_count as u16)?;
        machine.call_stack.push(dest_var as u16)?;
        machine.call_stack.push((saved_pc >> 16) as u16)?;
        machine.call_stack.push((saved_pc & 0xFFFF) as u16)?;
        machine.call_stack.push(base as u16)?;
    }
    Ok(())
}

/// Builds a complete Quetzal save image for the running machine.
fn encode(machine: &Machine, annotation: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(IFZS);

    let mut ifhd = Vec::with_capacity(13);
    ifhd.extend_from_slice(&machine.memory.release().unwrap_or(0).to_be_bytes());
    ifhd.extend_from_slice(machine.memory.serial());
    ifhd.extend_from_slice(&machine.memory.checksum().unwrap_or(0).to_be_bytes());
    let pc = machine.pc + 1;
    ifhd.push((pc >> 16) as u8);
    ifhd.push((pc >> 8) as u8);
    ifhd.push(pc as u8);
    ifhd.push(0);
    write_chunk(&mut body, b"IFhd", &ifhd);

    let live = machine.memory.dynamic_slice();
    let original_dynamic = &machine.original[..live.len()];
    write_chunk(&mut body, b"CMem", &cmem::encode(original_dynamic, live));

    write_chunk(&mut body, b"Stks", &encode_stacks(machine));

    if !annotation.is_empty() {
        write_chunk(&mut body, b"ANNO", annotation.as_bytes());
    }

    let mut out = Vec::new();
    out.extend_from_slice(FORM);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Parses a Quetzal save image and applies it to `machine`. Errors are the
/// four non-fatal `Save*` kinds (or a wrapped stack error if the file
/// describes a frame layout the stacks can't hold).
fn decode(machine: &mut Machine, data: &[u8]) -> VmResult<()> {
    if data.len() < 12 || &data[0..4] != FORM || &data[8..12] != IFZS {
        return Err(VmError::SaveFormatError("not a Quetzal/IFZS file".into()));
    }
    let total_len = u32::from_be_bytes(data[4..8].try_into().unwrap()) as usize;
    let end = (8 + total_len).min(data.len());

    let mut ifhd = None;
    let mut cmem = None;
    let mut umem = None;
    let mut stks = None;

    let mut pos = 12;
    while pos + 8 <= end {
        let tag = &data[pos..pos + 4];
        let len = u32::from_be_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let payload_start = pos + 8;
        let payload_end = payload_start + len;
        if payload_end > data.len() {
            return Err(VmError::SaveTruncated);
        }
        let payload = &data[payload_start..payload_end];
        match tag {
            b"IFhd" => ifhd = Some(payload),
            b"CMem" => cmem = Some(payload),
            b"UMem" => umem = Some(payload),
            b"Stks" => stks = Some(payload),
            _ => {}
        }
        pos = payload_end + (len % 2);
    }

    let ifhd = ifhd.ok_or_else(|| VmError::SaveFormatError("missing IFhd chunk".into()))?;
    if ifhd.len() < 13 {
        return Err(VmError::SaveTruncated);
    }
    let release = u16::from_be_bytes([ifhd[0], ifhd[1]]);
    let checksum = u16::from_be_bytes([ifhd[8], ifhd[9]]);
    if release != machine.memory.release()?
        || ifhd[2..8] != *machine.memory.serial()
        || checksum != machine.memory.checksum()?
    {
        return Err(VmError::SaveWrongGame);
    }
    let pc = ((ifhd[10] as usize) << 16) | ((ifhd[11] as usize) << 8) | ifhd[12] as usize;

    let dynamic_len = machine.memory.dynamic_end() as usize + 1;
    let live = if let Some(cmem) = cmem {
        cmem::decode(&machine.original[..dynamic_len], cmem)?
    } else if let Some(umem) = umem {
        if umem.len() != dynamic_len {
            return Err(VmError::SaveFormatError("UMem length mismatch".into()));
        }
        umem.to_vec()
    } else {
        return Err(VmError::SaveFormatError("missing CMem/UMem chunk".into()));
    };
    machine.memory.set_dynamic_slice(&live);

    let stks = stks.ok_or_else(|| VmError::SaveFormatError("missing Stks chunk".into()))?;
    restore_stacks(machine, stks)?;

    machine.pc = pc.saturating_sub(1);
    Ok(())
}

impl Machine {
    /// Writes a save image to `save_path`. Returns `false` (never an `Err`
    /// for I/O failure) when there is no configured path or the write
    /// failed, since `save` reports failure through the guest's branch.
    pub(crate) fn save(&mut self) -> VmResult<bool> {
        let Some(path) = self.save_path.clone() else {
            return Ok(false);
        };
        let image = encode(self, "zvm save file");
        match std::fs::write(&path, image) {
            Ok(()) => {
                log::info!("saved to {}", path.display());
                Ok(true)
            }
            Err(err) => {
                log::warn!("save to {} failed: {err}", path.display());
                Ok(false)
            }
        }
    }

    /// Reads and applies a save image from `save_path`. Malformed or
    /// mismatched files report failure rather than propagating, per the
    /// non-fatal `Save*` error contract; a closed-world I/O failure does
    /// too, since `restore`'s channel contract has no notion of "fatal".
    pub(crate) fn restore(&mut self) -> VmResult<bool> {
        let Some(path) = self.save_path.clone() else {
            return Ok(false);
        };
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("restore from {} failed: {err}", path.display());
                return Ok(false);
            }
        };
        match decode(self, &data) {
            Ok(()) => Ok(true),
            Err(err) if err.is_save_recoverable() => {
                log::warn!("restore from {} failed: {err}", path.display());
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::io::Io;
    use crate::vm::memory::constants::*;
    use std::sync::mpsc;

    fn story() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x100];
        bytes[HEADER_VERSION as usize] = 3;
        bytes[HEADER_DYNAMIC_END as usize] = 0x00;
        bytes[HEADER_DYNAMIC_END as usize + 1] = 0x80;
        bytes[HEADER_OBJECT_TABLE_BASE as usize + 1] = 0x40;
        bytes[HEADER_GLOBAL_VARIABLE_BASE as usize + 1] = 0x90;
        bytes[HEADER_DICTIONARY_BASE as usize + 1] = 0x40;
        bytes[HEADER_INITIAL_PC as usize + 1] = 0x50;
        bytes
    }

    fn test_machine() -> Machine {
        let (_tx_in, rx_in) = mpsc::channel();
        let (tx_out, _rx_out) = mpsc::channel();
        let mut machine = Machine::load_story(story(), Io::new(rx_in, tx_out)).unwrap();
        machine.complete_setup().unwrap();
        machine
    }

    #[test]
    fn cmem_save_round_trips_dynamic_memory_and_stacks() {
        let mut machine = test_machine();
        machine.memory.set_byte(0x10, 0xAB);
        machine.memory.set_byte(0x20, 0xCD);
        machine.value_stack.push(11).unwrap();
        machine.value_stack.push(22).unwrap();
        machine.call_stack.push(0x0002).unwrap();
        machine.call_stack.push(3).unwrap();
        machine.call_stack.push(0).unwrap();
        machine.call_stack.push(0x50).unwrap();
        machine.call_stack.push(0).unwrap();
        machine.value_stack.push(33).unwrap();
        machine.pc = 0x60;

        let image = encode(&machine, "");
        let mut restored = test_machine();
        decode(&mut restored, &image).unwrap();

        assert_eq!(restored.memory.byte(0x10), 0xAB);
        assert_eq!(restored.memory.byte(0x20), 0xCD);
        assert_eq!(restored.value_stack.raw(), machine.value_stack.raw());
        assert_eq!(restored.call_stack.raw(), machine.call_stack.raw());
        assert_eq!(restored.pc, machine.pc);
    }

    #[test]
    fn wrong_game_checksum_is_rejected() {
        let machine = test_machine();
        let mut image = encode(&machine, "");
        // FORM(4) + len(4) + IFZS(4) + "IFhd"(4) + chunklen(4) = 20, then the
        // checksum word sits at payload offset 8..10.
        let ifhd_payload_start = 20;
        image[ifhd_payload_start + 8] ^= 0xFF;
        let mut restored = test_machine();
        assert!(matches!(decode(&mut restored, &image), Err(VmError::SaveWrongGame)));
    }
}
