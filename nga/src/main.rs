mod devices;
mod dictionary;
mod error;
mod evaluator;
mod image;

use clap::{App, Arg};
use nga_vm::Vm;

use error::HostError;

fn main() {
    if let Err(e) = run() {
        eprintln!("nga: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), HostError> {
    let matches = App::new("nga")
        .about("stack-machine host for the RETRO-family bootstrap image")
        .arg(Arg::with_name("image").long("image").takes_value(true).help("override the embedded bootstrap image"))
        .arg(Arg::with_name("file").short("f").long("file").takes_value(true).multiple(true).number_of_values(1).help("include a source file before exiting"))
        .arg(Arg::with_name("script").index(1).help("a source file to run directly, then exit"))
        .get_matches();

    let mut vm = Vm::new();
    vm.load_image(&image::load(matches.value_of("image"))?);
    register_devices(&mut vm);

    if let Ok(exe) = std::env::current_exe() {
        evaluator::include(&mut vm, &exe.to_string_lossy())?;
    }

    if let Some(script) = matches.value_of("script") {
        evaluator::include(&mut vm, script)?;
        if !vm.data.is_empty() {
            print_stack(&vm);
        }
        return Ok(());
    }

    if let Some(files) = matches.values_of("file") {
        for path in files {
            evaluator::include(&mut vm, path)?;
        }
        return Ok(());
    }

    repl(&mut vm)
}

fn register_devices(vm: &mut Vm) {
    let handles = devices::new_handle_table();
    let raw_args: Vec<String> = std::env::args().collect();
    let script_name = raw_args.get(1).cloned().unwrap_or_default();
    let extra_args = raw_args.get(2..).map(|s| s.to_vec()).unwrap_or_default();

    vm.register_device(Box::new(devices::OutputDevice)); // 0
    vm.register_device(Box::new(devices::KeyboardDevice)); // 1
    vm.skip_device_slot(); // 2 (unused in this build)
    vm.skip_device_slot(); // 3 (unused in this build)
    vm.register_device(Box::new(devices::FilesystemDevice::new(handles.clone()))); // 4
    vm.skip_device_slot(); // 5 (unused in this build)
    vm.skip_device_slot(); // 6 (unused in this build)
    vm.skip_device_slot(); // 7 (unused in this build)
    vm.register_device(Box::new(devices::ShellDevice::new(handles))); // 8
    vm.register_device(Box::new(devices::ScriptingDevice::new(script_name, extra_args))); // 9
    vm.register_device(Box::new(devices::RngDevice)); // 10
}

fn print_stack(vm: &Vm) {
    for cell in &vm.data {
        print!("{} ", cell.0);
    }
    println!();
}

fn repl(vm: &mut Vm) -> Result<(), HostError> {
    let mut editor = rustyline::Editor::<()>::new();
    loop {
        match editor.readline("nga> ") {
            Ok(line) => {
                editor.add_history_entry(line.as_str());
                let fenced = format!("~~~\n{}\n~~~", line);
                if let Err(e) = evaluator::evaluate(vm, &fenced) {
                    eprintln!("nga: {}", HostError::from(e));
                    continue;
                }
                print_stack(vm);
            }
            Err(rustyline::error::ReadlineError::Eof)
            | Err(rustyline::error::ReadlineError::Interrupted) => break,
            Err(e) => {
                eprintln!("nga: {}", e);
                break;
            }
        }
    }
    Ok(())
}
