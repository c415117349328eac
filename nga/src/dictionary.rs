//! Host-side walk of the in-image dictionary: a singly linked list of `(link, xt, class,
//! name-start)` entries, newest definition first, rooted at a fixed memory cell.

use nga_vm::Vm;

/// Cell holding the address of the most recent dictionary entry (0 once the list is empty).
const DICTIONARY_HEAD: usize = 2;

/// Looks up `name` in the dictionary and returns its execution token, or `None` if no entry
/// matches. Unknown names are not an error here; the caller decides what to do (typically: try to
/// parse the token as a number instead).
pub fn xt_for(vm: &Vm, name: &[u8]) -> Option<i32> {
    let mut entry = vm.peek(DICTIONARY_HEAD).ok()?.0;
    while entry != 0 {
        let addr = entry as usize;
        let link = vm.peek(addr).ok()?.0;
        // The name field holds the string inline starting at this cell, not a pointer to it.
        if vm.string_extract(addr + 3) == name {
            return vm.peek(addr + 1).ok().map(|c| c.0);
        }
        entry = link;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use nga_vm::{Cell, Vm};

    #[test]
    fn resolves_a_known_name_and_rejects_an_unknown_one() {
        let mut vm = Vm::new();
        vm.poke(DICTIONARY_HEAD, Cell(200)).unwrap();
        vm.poke(200, Cell(0)).unwrap(); // link: end of list
        vm.poke(201, Cell(500)).unwrap(); // xt
        vm.poke(202, Cell(0)).unwrap(); // class (unused here)
        vm.string_inject(Some(b"x"), 203); // name stored inline, not behind a pointer

        assert_eq!(xt_for(&vm, b"x"), Some(500));
        assert_eq!(xt_for(&vm, b"y"), None);
    }
}
