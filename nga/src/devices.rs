//! Concrete devices wired into the VM's registry: console I/O, a file table shared between the
//! filesystem and shell devices, scripting introspection, and a source of random cells.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::rc::Rc;

use nga_vm::{Cell, Device, Vm, VmError};

const MAX_OPEN_FILES: usize = 32;

pub(crate) enum OpenHandle {
    File(File),
    PipeOut(Child, ChildStdout),
    PipeIn(Child, ChildStdin),
}

impl OpenHandle {
    fn read_byte(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        let n = match self {
            OpenHandle::File(f) => f.read(&mut buf).ok()?,
            OpenHandle::PipeOut(_, out) => out.read(&mut buf).ok()?,
            OpenHandle::PipeIn(_, _) => 0,
        };
        if n == 0 {
            None
        } else {
            Some(buf[0])
        }
    }

    fn write_byte(&mut self, b: u8) {
        let _ = match self {
            OpenHandle::File(f) => f.write_all(&[b]),
            OpenHandle::PipeIn(_, input) => input.write_all(&[b]),
            OpenHandle::PipeOut(_, _) => Ok(()),
        };
    }

    fn flush(&mut self) {
        let _ = match self {
            OpenHandle::File(f) => f.flush(),
            OpenHandle::PipeIn(_, input) => input.flush(),
            OpenHandle::PipeOut(_, _) => Ok(()),
        };
    }
}

pub(crate) type HandleTable = Rc<RefCell<Vec<Option<OpenHandle>>>>;

pub fn new_handle_table() -> HandleTable {
    Rc::new(RefCell::new((0..MAX_OPEN_FILES).map(|_| None).collect()))
}

fn free_slot(table: &RefCell<Vec<Option<OpenHandle>>>) -> usize {
    let table = table.borrow();
    for (i, slot) in table.iter().enumerate().skip(1) {
        if slot.is_none() {
            return i;
        }
    }
    0
}

fn read_string(vm: &mut Vm, addr: Cell) -> String {
    String::from_utf8_lossy(&vm.string_extract(usize::from(addr))).into_owned()
}

/// Device 0: writes a single cell, truncated to a byte, to stdout.
pub struct OutputDevice;

impl Device for OutputDevice {
    fn query(&self, vm: &mut Vm) -> Result<(), VmError> {
        vm.data_push(Cell(0))?;
        vm.data_push(Cell(0))
    }

    fn action(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let c = vm.data_pop()?;
        print!("{}", c.0 as u8 as char);
        std::io::stdout().flush().ok();
        Ok(())
    }
}

/// Device 1: reads one byte from stdin, or `-1` at end of input. DEL is remapped to backspace to
/// match the terminals the reference interpreter was written against.
pub struct KeyboardDevice;

impl Device for KeyboardDevice {
    fn query(&self, vm: &mut Vm) -> Result<(), VmError> {
        vm.data_push(Cell(0))?;
        vm.data_push(Cell(1))
    }

    fn action(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let mut buf = [0u8; 1];
        let value = match std::io::stdin().read(&mut buf) {
            Ok(1) if buf[0] == 127 => 8,
            Ok(1) => buf[0] as i32,
            _ => -1,
        };
        vm.data_push(Cell(value))
    }
}

/// Device 4: buffered file access over a shared handle table, indexed by a `rx`-style slot
/// number starting at 1 (slot 0 means "operation failed").
pub struct FilesystemDevice {
    handles: HandleTable,
}

impl FilesystemDevice {
    pub fn new(handles: HandleTable) -> FilesystemDevice {
        FilesystemDevice { handles }
    }

    fn open(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let mode = vm.data_pop()?;
        let name = vm.data_pop()?;
        let path = read_string(vm, name);
        let slot = free_slot(&self.handles);
        let opened = if slot == 0 {
            None
        } else {
            match mode.0 {
                0 => OpenOptions::new().read(true).open(&path).ok(),
                1 => OpenOptions::new().write(true).create(true).truncate(true).open(&path).ok(),
                2 => OpenOptions::new().append(true).create(true).open(&path).ok(),
                3 => OpenOptions::new().read(true).write(true).open(&path).ok(),
                _ => None,
            }
        };
        let slot = match opened {
            Some(file) => {
                self.handles.borrow_mut()[slot] = Some(OpenHandle::File(file));
                slot
            }
            None => 0,
        };
        vm.data_push(Cell(slot as i32))
    }

    fn close(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let slot = vm.data_pop()?;
        self.handles.borrow_mut()[slot.0 as usize] = None;
        Ok(())
    }

    fn read(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let slot = vm.data_pop()?;
        let byte = self.handles.borrow_mut()[slot.0 as usize]
            .as_mut()
            .and_then(OpenHandle::read_byte);
        vm.data_push(Cell(byte.map(|b| b as i32).unwrap_or(0)))
    }

    fn write(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let slot = vm.data_pop()?;
        let value = vm.data_pop()?;
        if let Some(handle) = self.handles.borrow_mut()[slot.0 as usize].as_mut() {
            handle.write_byte(value.0 as u8);
        }
        Ok(())
    }

    fn get_position(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let slot = vm.data_pop()?;
        let pos = match self.handles.borrow_mut()[slot.0 as usize].as_mut() {
            Some(OpenHandle::File(f)) => f.stream_position().unwrap_or(0) as i32,
            _ => 0,
        };
        vm.data_push(Cell(pos))
    }

    fn set_position(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let slot = vm.data_pop()?;
        let pos = vm.data_pop()?;
        if let Some(OpenHandle::File(f)) = self.handles.borrow_mut()[slot.0 as usize].as_mut() {
            let _ = f.seek(SeekFrom::Start(pos.0 as u64));
        }
        Ok(())
    }

    fn get_size(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let slot = vm.data_pop()?;
        let size = match self.handles.borrow_mut()[slot.0 as usize].as_ref() {
            Some(OpenHandle::File(f)) => f.metadata().map(|m| m.len() as i32).unwrap_or(0),
            _ => 0,
        };
        vm.data_push(Cell(size))
    }

    fn delete(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let name = vm.data_pop()?;
        let path = read_string(vm, name);
        let _ = std::fs::remove_file(path);
        Ok(())
    }

    fn flush(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let slot = vm.data_pop()?;
        if let Some(handle) = self.handles.borrow_mut()[slot.0 as usize].as_mut() {
            handle.flush();
        }
        Ok(())
    }
}

impl Device for FilesystemDevice {
    fn query(&self, vm: &mut Vm) -> Result<(), VmError> {
        vm.data_push(Cell(0))?;
        vm.data_push(Cell(4))
    }

    fn action(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        match vm.data_pop()?.0 {
            0 => self.open(vm),
            1 => self.close(vm),
            2 => self.read(vm),
            3 => self.write(vm),
            4 => self.get_position(vm),
            5 => self.set_position(vm),
            6 => self.get_size(vm),
            7 => self.delete(vm),
            8 => self.flush(vm),
            _ => Ok(()),
        }
    }
}

/// Device 8: subprocess control sharing the filesystem device's handle table, so a pipe opened
/// here can be read or written through the ordinary file actions.
pub struct ShellDevice {
    handles: HandleTable,
}

impl ShellDevice {
    pub fn new(handles: HandleTable) -> ShellDevice {
        ShellDevice { handles }
    }

    fn system(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let name = vm.data_pop()?;
        let command = read_string(vm, name);
        let _ = Command::new("sh").arg("-c").arg(command).status();
        Ok(())
    }

    fn open_pipe(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let mode = vm.data_pop()?;
        let name = vm.data_pop()?;
        let command = read_string(vm, name);
        let slot = free_slot(&self.handles);
        let spawned = if slot == 0 {
            None
        } else {
            match mode.0 {
                0 => Command::new("sh").arg("-c").arg(&command).stdout(Stdio::piped()).spawn().ok().and_then(|mut child| {
                    let out = child.stdout.take()?;
                    Some(OpenHandle::PipeOut(child, out))
                }),
                1 => Command::new("sh").arg("-c").arg(&command).stdin(Stdio::piped()).spawn().ok().and_then(|mut child| {
                    let input = child.stdin.take()?;
                    Some(OpenHandle::PipeIn(child, input))
                }),
                _ => None,
            }
        };
        let slot = match spawned {
            Some(handle) => {
                self.handles.borrow_mut()[slot] = Some(handle);
                slot
            }
            None => 0,
        };
        vm.data_push(Cell(slot as i32))
    }

    fn close_pipe(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let slot = vm.data_pop()?;
        if let Some(mut handle) = self.handles.borrow_mut()[slot.0 as usize].take() {
            let child = match &mut handle {
                OpenHandle::PipeOut(c, _) => Some(c),
                OpenHandle::PipeIn(c, _) => Some(c),
                OpenHandle::File(_) => None,
            };
            if let Some(child) = child {
                let _ = child.wait();
            }
        }
        Ok(())
    }

    fn chdir(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let name = vm.data_pop()?;
        let path = read_string(vm, name);
        let _ = std::env::set_current_dir(path);
        Ok(())
    }

    fn getenv(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let dest = vm.data_pop()?;
        let name = vm.data_pop()?;
        let key = read_string(vm, name);
        let value = std::env::var(&key).ok();
        vm.string_inject(value.as_deref().map(str::as_bytes), usize::from(dest));
        Ok(())
    }

    fn putenv(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let assignment = vm.data_pop()?;
        let text = read_string(vm, assignment);
        if let Some((key, value)) = text.split_once('=') {
            std::env::set_var(key, value);
        }
        Ok(())
    }
}

impl Device for ShellDevice {
    fn query(&self, vm: &mut Vm) -> Result<(), VmError> {
        vm.data_push(Cell(1))?;
        vm.data_push(Cell(8))
    }

    fn action(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        match vm.data_pop()?.0 {
            0 => self.system(vm),
            1 => self.open_pipe(vm),
            2 => self.close_pipe(vm),
            3 => self.chdir(vm),
            4 => self.getenv(vm),
            5 => self.putenv(vm),
            _ => Ok(()),
        }
    }
}

/// Device 9: exposes the host's command-line arguments and lets in-image code `include` further
/// source files through the same evaluator the host uses at startup.
pub struct ScriptingDevice {
    script_name: String,
    extra_args: Vec<String>,
}

impl ScriptingDevice {
    pub fn new(script_name: String, extra_args: Vec<String>) -> ScriptingDevice {
        ScriptingDevice { script_name, extra_args }
    }
}

impl Device for ScriptingDevice {
    fn query(&self, vm: &mut Vm) -> Result<(), VmError> {
        vm.data_push(Cell(2))?;
        vm.data_push(Cell(9))
    }

    fn action(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        match vm.data_pop()?.0 {
            0 => vm.data_push(Cell(self.extra_args.len() as i32)),
            1 => {
                let index = vm.data_pop()?;
                let dest = vm.data_pop()?;
                let arg = self.extra_args.get(index.0 as usize).map(|s| s.as_bytes());
                let addr = vm.string_inject(arg, usize::from(dest));
                vm.data_push(Cell(addr as i32))
            }
            2 => {
                let name = vm.data_pop()?;
                let path = read_string(vm, name);
                crate::evaluator::include(vm, &path)
            }
            3 => {
                let dest = vm.data_pop()?;
                let addr = vm.string_inject(Some(self.script_name.as_bytes()), usize::from(dest));
                vm.data_push(Cell(addr as i32))
            }
            _ => Ok(()),
        }
    }
}

/// Device 10: a non-negative random cell drawn straight from OS entropy, the same source the
/// reference interpreter reads rather than a seeded PRNG.
pub struct RngDevice;

impl Device for RngDevice {
    fn query(&self, vm: &mut Vm) -> Result<(), VmError> {
        vm.data_push(Cell(0))?;
        vm.data_push(Cell(10))
    }

    fn action(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let mut buf = [0u8; 4];
        File::open("/dev/urandom")
            .and_then(|mut f| f.read_exact(&mut buf))
            .ok();
        let value = i32::from_le_bytes(buf).wrapping_abs();
        vm.data_push(Cell(value))
    }
}

