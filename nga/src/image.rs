use std::fs;
use std::io;

/// The bootstrap Forth image shipped with this binary, extracted from the reference
/// distribution's memory dump and embedded so the VM always has something runnable even with no
/// `--image` override on the command line.
pub const BOOTSTRAP: &[u8] = include_bytes!("../assets/bootstrap.bin");

/// Loads the image bytes to install into VM memory: either the embedded bootstrap, or the
/// contents of `path` when an override was given on the command line.
pub fn load(path: Option<&str>) -> io::Result<Vec<u8>> {
    match path {
        Some(path) => fs::read(path),
        None => Ok(BOOTSTRAP.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary;
    use nga_vm::Vm;

    #[test]
    fn bootstrap_image_resolves_interpret_to_a_nonzero_xt() {
        let mut vm = Vm::new();
        vm.load_image(BOOTSTRAP);
        let xt = dictionary::xt_for(&vm, b"interpret");
        assert!(matches!(xt, Some(x) if x != 0));
    }
}
