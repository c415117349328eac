use crate::vm::{Vm, VmError};

/// A host-provided capability, addressable by its index in the VM's device registry.
///
/// `query` answers the `iquery` opcode and must be side-effect free; by convention it reports
/// `(version, device_id)` via two pushes onto the caller's data stack. `action` answers `isend`
/// and performs the device's actual work, reading its own sub-selector and operands off the data
/// stack and pushing back whatever results the contract promises.
///
/// Implementations get a `&mut Vm` rather than direct access to a stack/memory pair so they can
/// use the same `data_pop`/`data_push`/`string_extract`/`string_inject`/`peek`/`poke` surface the
/// VM core itself uses — a device is just more VM-adjacent code, not a separate memory model.
pub trait Device {
    fn query(&self, vm: &mut Vm) -> Result<(), VmError>;
    fn action(&mut self, vm: &mut Vm) -> Result<(), VmError>;
}
