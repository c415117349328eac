//! Turns a line of source text into VM execution: one token at a time through the text-input
//! buffer, each followed by a call to the image's `interpret` word.

use std::fs;

use nga_vm::{Vm, VmError};

use crate::dictionary;

/// Cell holding the address of the text input buffer, where the next token to interpret is
/// staged before `interpret` is invoked.
const TIB: usize = 7;

const INTERPRET: &[u8] = b"interpret";

/// Feeds `source` to the VM one whitespace-delimited token at a time. Lines outside a `~~~`
/// fenced block are prose and are skipped; only fenced lines are tokenized and run, so a script
/// can carry commentary without it being mistaken for code.
pub fn evaluate(vm: &mut Vm, source: &str) -> Result<(), VmError> {
    let interpret = dictionary::xt_for(vm, INTERPRET);
    let mut in_fence = false;
    for line in source.lines() {
        if line.trim_start().starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            continue;
        }
        for token in line.split_whitespace() {
            run_token(vm, token, interpret)?;
        }
    }
    Ok(())
}

fn run_token(vm: &mut Vm, token: &str, interpret: Option<i32>) -> Result<(), VmError> {
    let tib = vm.peek(TIB)?;
    vm.string_inject(Some(token.as_bytes()), usize::from(tib));
    if let Some(xt) = interpret {
        vm.data_push(tib)?;
        vm.execute(xt as usize)?;
    }
    Ok(())
}

/// Runs the contents of `path` as source, isolating its return stack from the caller's so a
/// runaway or unbalanced included file can't corrupt whatever called `include`. A missing file is
/// not an error: the include is simply skipped, the same way a typo'd path silently does nothing
/// in the reference interpreter's `-f` handling.
pub fn include(vm: &mut Vm, path: &str) -> Result<(), VmError> {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => return Ok(()),
    };
    let saved = std::mem::replace(&mut vm.address, Vec::new());
    let result = evaluate(vm, &source);
    vm.address = saved;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fenced_lines_are_tokenized() {
        let mut vm = Vm::new();
        let source = "ignore me\n~~~\nhello world\n~~~\nskip this too";
        evaluate(&mut vm, source).unwrap();
        assert_eq!(vm.string_extract(0), b"world");
    }

    #[test]
    fn include_of_a_missing_file_is_a_silent_no_op() {
        let mut vm = Vm::new();
        include(&mut vm, "/nonexistent/path/to/source.forth").unwrap();
        assert!(vm.data.is_empty());
        assert!(vm.address.is_empty());
    }

    #[test]
    fn a_numeric_token_is_interpreted_against_the_real_bootstrap_image() {
        let mut vm = Vm::new();
        vm.load_image(crate::image::BOOTSTRAP);
        evaluate(&mut vm, "~~~\n#42\n~~~").unwrap();
        assert_eq!(vm.data, vec![nga_vm::Cell(42)]);
    }
}
