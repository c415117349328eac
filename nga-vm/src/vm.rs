use std::convert::TryFrom;

use crate::cell::{self, Cell};
use crate::device::Device;
use crate::opcode::OpCode;
use crate::string;

/// Number of cells of addressable memory. Chosen generously above the size of the shipped
/// bootstrap image so the in-image dictionary has room to grow; the reference C implementation
/// uses a much larger figure (it preallocates the whole address space up front) but this is
/// otherwise the same "fixed flat array" design.
pub const IMAGE_SIZE: usize = 1_048_576;

/// Capacity of the data stack.
pub const STACK_DEPTH: usize = 1024;

/// Capacity of the return (address) stack.
pub const ADDRESSES: usize = 1024;

/// Runtime faults. Carries the instruction pointer where the fault occurred when one is known, so
/// a host can print a useful diagnostic without the VM itself owning any notion of "how to report
/// an error" (it never formats a message or writes to a stream).
#[derive(Debug)]
pub struct VmError {
    pub ip: Option<usize>,
    pub kind: VmErrorKind,
}

#[derive(Debug)]
pub enum VmErrorKind {
    InvalidOpcode { bundle: i32, byte: u8 },
    DataUnderflow,
    AddressUnderflow,
    DataOverflow,
    AddressOverflow,
    MemoryOutOfBounds { addr: i64 },
    InvalidDevice { device: i32 },
}

impl VmError {
    fn invalid_opcode(bundle: i32, byte: u8) -> VmError {
        VmError { ip: None, kind: VmErrorKind::InvalidOpcode { bundle, byte } }
    }

    fn data_underflow() -> VmError {
        VmError { ip: None, kind: VmErrorKind::DataUnderflow }
    }

    fn address_underflow() -> VmError {
        VmError { ip: None, kind: VmErrorKind::AddressUnderflow }
    }

    fn data_overflow() -> VmError {
        VmError { ip: None, kind: VmErrorKind::DataOverflow }
    }

    fn address_overflow() -> VmError {
        VmError { ip: None, kind: VmErrorKind::AddressOverflow }
    }

    fn memory_out_of_bounds(addr: i64) -> VmError {
        VmError { ip: None, kind: VmErrorKind::MemoryOutOfBounds { addr } }
    }

    fn invalid_device(device: i32) -> VmError {
        VmError { ip: None, kind: VmErrorKind::InvalidDevice { device } }
    }

    fn with_ip(mut self, ip: usize) -> Self {
        self.ip = Some(ip);
        self
    }
}

impl From<std::num::TryFromIntError> for VmError {
    fn from(_: std::num::TryFromIntError) -> Self {
        VmError { ip: None, kind: VmErrorKind::MemoryOutOfBounds { addr: -1 } }
    }
}

/// The VM: cell memory, both stacks, the instruction pointer, and the device registry. Owned and
/// passed by exclusive reference to every operation, so a process may host any number of
/// independent instances.
pub struct Vm {
    pub memory: Vec<Cell>,
    pub data: Vec<Cell>,
    pub address: Vec<Cell>,
    ip: i64,
    devices: Vec<Option<Box<dyn Device>>>,
    registered_devices: usize,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            memory: vec![Cell(0); IMAGE_SIZE],
            data: Vec::new(),
            address: Vec::new(),
            ip: 0,
            devices: Vec::new(),
            registered_devices: 0,
        }
    }

    /// Copies `bytes`, read as little-endian 32-bit cells, into the start of memory. Any trailing
    /// partial cell is dropped. Clears both stacks, matching the reference loader's behavior of
    /// resetting VM state whenever a fresh image is installed.
    pub fn load_image(&mut self, bytes: &[u8]) {
        for cell in self.memory.iter_mut() {
            *cell = Cell(0);
        }
        for (i, chunk) in bytes.chunks_exact(cell::SIZE).enumerate() {
            let word = [chunk[0], chunk[1], chunk[2], chunk[3]];
            self.memory[i] = Cell(i32::from_le_bytes(word));
        }
        self.data.clear();
        self.address.clear();
        self.ip = 0;
    }

    pub fn ip(&self) -> i64 {
        self.ip
    }

    /// Registers `device` at the next free slot and returns its index.
    pub fn register_device(&mut self, device: Box<dyn Device>) -> usize {
        self.devices.push(Some(device));
        self.registered_devices += 1;
        self.devices.len() - 1
    }

    /// Reserves the next slot without installing a device there. Used to keep a device's
    /// registration index aligned with the numeric id that in-image code already expects for it,
    /// when that id isn't simply the count of devices registered so far. Does not count towards
    /// `ienum`'s reported device count, since no real device answers at this index.
    pub fn skip_device_slot(&mut self) -> usize {
        self.devices.push(None);
        self.devices.len() - 1
    }

    /// The number of slots in the device registry, including skipped placeholders. Not what
    /// `ienum` reports to in-image code; see `registered_devices`.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn peek(&self, addr: usize) -> Result<Cell, VmError> {
        self.memory.get(addr).copied().ok_or_else(|| VmError::memory_out_of_bounds(addr as i64))
    }

    pub fn poke(&mut self, addr: usize, value: Cell) -> Result<(), VmError> {
        if addr >= self.memory.len() {
            return Err(VmError::memory_out_of_bounds(addr as i64));
        }
        self.memory[addr] = value;
        Ok(())
    }

    pub fn string_inject(&mut self, bytes: Option<&[u8]>, addr: usize) -> usize {
        string::inject(&mut self.memory, bytes, addr)
    }

    pub fn string_extract(&self, addr: usize) -> Vec<u8> {
        string::extract(&self.memory, addr)
    }

    pub fn data_push(&mut self, value: Cell) -> Result<(), VmError> {
        if self.data.len() >= STACK_DEPTH {
            return Err(VmError::data_overflow());
        }
        self.data.push(value);
        Ok(())
    }

    pub fn data_pop(&mut self) -> Result<Cell, VmError> {
        self.data.pop().ok_or_else(VmError::data_underflow)
    }

    fn data_peek(&self) -> Result<Cell, VmError> {
        self.data.last().copied().ok_or_else(VmError::data_underflow)
    }

    pub fn address_push(&mut self, value: Cell) -> Result<(), VmError> {
        if self.address.len() >= ADDRESSES {
            return Err(VmError::address_overflow());
        }
        self.address.push(value);
        Ok(())
    }

    pub fn address_pop(&mut self) -> Result<Cell, VmError> {
        self.address.pop().ok_or_else(VmError::address_underflow)
    }

    /// Runs the VM starting at `addr` until the call chain unwinds past the bottom of the return
    /// stack (normal termination) or a fault occurs. Reentrant: device handlers may call this
    /// again on the same `Vm`, provided they save and restore `ip`/stack depths themselves first.
    pub fn execute(&mut self, addr: usize) -> Result<(), VmError> {
        if self.address.is_empty() {
            self.address.push(Cell(0));
        }
        self.ip = addr as i64;
        while self.ip >= 0 && (self.ip as usize) < IMAGE_SIZE {
            let ip = self.ip as usize;
            let bundle = self.memory[ip].0;
            let bytes = (bundle as u32).to_le_bytes();
            for &b in &bytes {
                if b > OpCode::ISend as u8 {
                    return Err(VmError::invalid_opcode(bundle, b).with_ip(ip));
                }
            }
            for &b in &bytes {
                if b != 0 {
                    let op = OpCode::try_from(b).map_err(|e| e.with_ip(ip))?;
                    self.dispatch(op).map_err(|e| e.with_ip(ip))?;
                }
            }
            self.ip += 1;
            if self.address.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Executes a single already-decoded opcode. Public so host code and tests can drive the VM
    /// one primitive at a time without going through the bundle loop.
    pub fn dispatch(&mut self, op: OpCode) -> Result<(), VmError> {
        match op {
            OpCode::Nop => {}
            OpCode::Lit => {
                self.ip += 1;
                let addr = self.ip;
                if addr < 0 || addr as usize >= IMAGE_SIZE {
                    return Err(VmError::memory_out_of_bounds(addr));
                }
                let value = self.memory[addr as usize];
                self.data_push(value)?;
            }
            OpCode::Dup => {
                let top = self.data_peek()?;
                self.data_push(top)?;
            }
            OpCode::Drop => {
                if self.data.pop().is_none() {
                    self.ip = IMAGE_SIZE as i64;
                }
            }
            OpCode::Swap => {
                let len = self.data.len();
                if len < 2 {
                    return Err(VmError::data_underflow());
                }
                self.data.swap(len - 1, len - 2);
            }
            OpCode::Push => {
                let v = self.data_pop()?;
                self.address_push(v)?;
            }
            OpCode::Pop => {
                let v = self.address_pop()?;
                self.data_push(v)?;
            }
            OpCode::Jump => {
                let addr = self.data_pop()?;
                self.ip = (addr.0 as i64) - 1;
            }
            OpCode::Call => {
                let addr = self.data_pop()?;
                self.address_push(Cell::try_from(self.ip as isize)?)?;
                self.ip = (addr.0 as i64) - 1;
            }
            OpCode::CCall => {
                let addr = self.data_pop()?;
                let flag = self.data_pop()?;
                if flag.0 != 0 {
                    self.address_push(Cell::try_from(self.ip as isize)?)?;
                    self.ip = (addr.0 as i64) - 1;
                }
            }
            OpCode::Return => {
                let ret = self.address_pop()?;
                self.ip = ret.0 as i64;
            }
            OpCode::Eq => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(Cell::from(a == b))?;
            }
            OpCode::Neq => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(Cell::from(a != b))?;
            }
            OpCode::Lt => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(Cell::from(a < b))?;
            }
            OpCode::Gt => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(Cell::from(a > b))?;
            }
            OpCode::Fetch => {
                let addr = self.data_pop()?;
                let value = match addr.0 {
                    -1 => Cell(self.data.len() as i32),
                    -2 => Cell(self.address.len() as i32),
                    -3 => Cell(IMAGE_SIZE as i32),
                    -4 => Cell(cell::CELL_MIN),
                    -5 => Cell(cell::CELL_MAX),
                    other => self.peek(other as usize)?,
                };
                self.data_push(value)?;
            }
            OpCode::Store => {
                let addr = self.data_pop()?;
                let value = self.data_pop()?;
                self.poke(addr.0 as usize, value)?;
            }
            OpCode::Add => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(a + b)?;
            }
            OpCode::Sub => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(a - b)?;
            }
            OpCode::Mul => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(a * b)?;
            }
            OpCode::DivMod => {
                let divisor = self.data_pop()?;
                let dividend = self.data_pop()?;
                let (q, r) = dividend.divmod(divisor);
                self.data_push(r)?;
                self.data_push(q)?;
            }
            OpCode::And => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(a & b)?;
            }
            OpCode::Or => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(a | b)?;
            }
            OpCode::Xor => {
                let b = self.data_pop()?;
                let a = self.data_pop()?;
                self.data_push(a ^ b)?;
            }
            OpCode::Shift => {
                let n = self.data_pop()?;
                let x = self.data_pop()?;
                self.data_push(x.shift(n))?;
            }
            OpCode::ZRet => {
                if self.data_peek()?.0 == 0 {
                    self.data_pop()?;
                    let ret = self.address_pop()?;
                    self.ip = ret.0 as i64;
                }
            }
            OpCode::Halt => {
                self.ip = IMAGE_SIZE as i64;
            }
            OpCode::IEnum => {
                self.data_push(Cell(self.registered_devices as i32))?;
            }
            OpCode::IQuery => {
                let device = self.data_pop()?;
                self.run_device(device.0, |d, vm| d.query(vm))?;
            }
            OpCode::ISend => {
                let device = self.data_pop()?;
                self.run_device(device.0, |d, vm| d.action(vm))?;
            }
        }
        Ok(())
    }

    /// Temporarily removes the one device being called out of the registry so its handler can
    /// take `&mut Vm` without aliasing the `Vec` it's stored in. Every other device slot stays
    /// reachable, so a device whose action itself drives the VM (e.g. `include`) can still use
    /// `iquery`/`isend` against any device other than itself.
    fn run_device(
        &mut self,
        device: i32,
        f: impl FnOnce(&mut Box<dyn Device>, &mut Vm) -> Result<(), VmError>,
    ) -> Result<(), VmError> {
        if device < 0 || device as usize >= self.devices.len() {
            return Err(VmError::invalid_device(device));
        }
        let idx = device as usize;
        let mut handler = self.devices[idx].take().ok_or_else(|| VmError::invalid_device(device))?;
        let result = f(&mut handler, self);
        self.devices[idx] = Some(handler);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(ops: [OpCode; 4]) -> Cell {
        let bytes = [ops[0] as u8, ops[1] as u8, ops[2] as u8, ops[3] as u8];
        Cell(i32::from_le_bytes(bytes))
    }

    #[test]
    fn bundle_decoder_rejects_opcode_past_isend() {
        let mut vm = Vm::new();
        vm.memory[0] = Cell(30);
        let err = vm.execute(0).unwrap_err();
        assert!(matches!(err.kind, VmErrorKind::InvalidOpcode { byte: 30, .. }));
        assert_eq!(err.ip, Some(0));
    }

    #[test]
    fn lit_dup_add_leaves_expected_stack() {
        let mut vm = Vm::new();
        // lit 2, lit 3, add, halt
        vm.memory[0] = bundle([OpCode::Lit, OpCode::Nop, OpCode::Nop, OpCode::Nop]);
        vm.memory[1] = Cell(2);
        vm.memory[2] = bundle([OpCode::Lit, OpCode::Nop, OpCode::Nop, OpCode::Nop]);
        vm.memory[3] = Cell(3);
        vm.memory[4] = bundle([OpCode::Add, OpCode::Halt, OpCode::Nop, OpCode::Nop]);
        vm.execute(0).unwrap();
        assert_eq!(vm.data, vec![Cell(5)]);
    }

    #[test]
    fn divmod_leaves_quotient_on_top_of_remainder() {
        let mut vm = Vm::new();
        vm.data_push(Cell(7)).unwrap();
        vm.data_push(Cell(3)).unwrap();
        vm.dispatch(OpCode::DivMod).unwrap();
        assert_eq!(vm.data, vec![Cell(1), Cell(2)]);
    }

    #[test]
    fn shift_left_for_negative_n_and_arithmetic_right_for_negative_x() {
        let mut vm = Vm::new();
        vm.data_push(Cell(1)).unwrap();
        vm.data_push(Cell(-4)).unwrap();
        vm.dispatch(OpCode::Shift).unwrap();
        assert_eq!(vm.data, vec![Cell(16)]);

        let mut vm = Vm::new();
        vm.data_push(Cell(-8)).unwrap();
        vm.data_push(Cell(1)).unwrap();
        vm.dispatch(OpCode::Shift).unwrap();
        assert_eq!(vm.data, vec![Cell(-4)]);
    }

    #[test]
    fn fetch_reports_image_size_for_address_minus_three() {
        let mut vm = Vm::new();
        vm.data_push(Cell(-3)).unwrap();
        vm.dispatch(OpCode::Fetch).unwrap();
        assert_eq!(vm.data, vec![Cell(IMAGE_SIZE as i32)]);
    }

    #[test]
    fn fetch_reports_data_and_address_depth() {
        let mut vm = Vm::new();
        vm.data_push(Cell(9)).unwrap();
        vm.data_push(Cell(-1)).unwrap();
        vm.dispatch(OpCode::Fetch).unwrap();
        assert_eq!(vm.data, vec![Cell(9), Cell(1)]);

        let mut vm = Vm::new();
        vm.address_push(Cell(0)).unwrap();
        vm.data_push(Cell(-2)).unwrap();
        vm.dispatch(OpCode::Fetch).unwrap();
        assert_eq!(vm.data, vec![Cell(1)]);
    }

    #[test]
    fn drop_on_empty_stack_halts_instead_of_erroring() {
        let mut vm = Vm::new();
        vm.dispatch(OpCode::Drop).unwrap();
        assert_eq!(vm.ip(), IMAGE_SIZE as i64);
    }

    #[test]
    fn call_then_return_balances_the_address_stack() {
        let mut vm = Vm::new();
        // lit <word>, call, halt ... word: halt (acts as a no-op return point via zret-free return)
        vm.memory[0] = bundle([OpCode::Lit, OpCode::Nop, OpCode::Nop, OpCode::Nop]);
        vm.memory[1] = Cell(10);
        vm.memory[2] = bundle([OpCode::Call, OpCode::Nop, OpCode::Nop, OpCode::Nop]);
        vm.memory[3] = bundle([OpCode::Halt, OpCode::Nop, OpCode::Nop, OpCode::Nop]);
        vm.memory[10] = bundle([OpCode::Return, OpCode::Nop, OpCode::Nop, OpCode::Nop]);
        vm.execute(0).unwrap();
        assert_eq!(vm.address.len(), 1);
        assert!(vm.data.is_empty());
    }

    #[test]
    fn execute_terminates_when_return_stack_runs_dry() {
        let mut vm = Vm::new();
        vm.memory[0] = bundle([OpCode::Return, OpCode::Nop, OpCode::Nop, OpCode::Nop]);
        vm.execute(0).unwrap();
        assert!(vm.address.is_empty());
    }

    #[test]
    fn zret_only_returns_when_top_is_zero() {
        let mut vm = Vm::new();
        vm.address_push(Cell(5)).unwrap();
        vm.data_push(Cell(1)).unwrap();
        vm.dispatch(OpCode::ZRet).unwrap();
        assert_eq!(vm.data, vec![Cell(1)]);
        assert_eq!(vm.address.len(), 1);

        vm.data.pop();
        vm.data_push(Cell(0)).unwrap();
        vm.dispatch(OpCode::ZRet).unwrap();
        assert!(vm.data.is_empty());
        assert!(vm.address.is_empty());
        assert_eq!(vm.ip(), 5);
    }

    #[test]
    fn ienum_reports_registered_device_count() {
        let mut vm = Vm::new();
        vm.dispatch(OpCode::IEnum).unwrap();
        assert_eq!(vm.data, vec![Cell(0)]);
    }

    struct NullDevice;
    impl Device for NullDevice {
        fn query(&self, _vm: &mut Vm) -> Result<(), VmError> {
            Ok(())
        }
        fn action(&mut self, _vm: &mut Vm) -> Result<(), VmError> {
            Ok(())
        }
    }

    #[test]
    fn ienum_ignores_skipped_slots_reserved_for_device_id_alignment() {
        let mut vm = Vm::new();
        vm.register_device(Box::new(NullDevice)); // 0
        vm.skip_device_slot(); // 1
        vm.skip_device_slot(); // 2
        vm.register_device(Box::new(NullDevice)); // 3
        assert_eq!(vm.device_count(), 4);
        vm.dispatch(OpCode::IEnum).unwrap();
        assert_eq!(vm.data, vec![Cell(2)]);
    }
}
